use super::characteristic::Characteristic;
use super::service::Service;
use super::types::*;
use crate::bus::{Connection, Interface, ObjectPath};
use crate::error::{Error, Result};
use crate::uuid::Uuid;
use log::{debug, info};
use std::sync::{Arc, RwLock};

struct ApplicationInner {
    path: ObjectPath,
    services: RwLock<Vec<Service>>,
    shared: Arc<AppShared>,
}

/// Root of a GATT object tree
///
/// The root path answers `GetManagedObjects` once exported, which is how the
/// daemon discovers services, characteristics and descriptors.
#[derive(Clone)]
pub struct Application {
    inner: Arc<ApplicationInner>,
}

/// Creates an empty application rooted at `path`
pub fn create_application(path: &str) -> Result<Application> {
    Ok(Application::new(ObjectPath::new(path)?))
}

impl Application {
    pub fn new(path: ObjectPath) -> Self {
        Self {
            inner: Arc::new(ApplicationInner {
                path,
                services: RwLock::new(Vec::new()),
                shared: Arc::new(AppShared::default()),
            }),
        }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.inner.path
    }

    pub fn state(&self) -> RegistrationState {
        self.inner.shared.state()
    }

    pub(crate) fn set_state(&self, state: RegistrationState) {
        self.inner.shared.set_state(state);
    }

    pub fn is_exported(&self) -> bool {
        self.inner.shared.is_exported()
    }

    pub fn services(&self) -> Vec<Service> {
        self.inner
            .services
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Finds a characteristic by UUID in any service
    pub fn characteristic(&self, uuid: Uuid) -> Option<Characteristic> {
        self.services()
            .iter()
            .find_map(|service| service.characteristic(uuid))
    }

    /// Adds a primary service exported at `<application>/<id>`
    pub fn add_service(&self, id: &str, uuid: Uuid) -> Result<Service> {
        if self.is_exported() {
            return Err(Error::InvalidState(format!(
                "Cannot add service to {}: application already exported",
                self.inner.path
            )));
        }
        let path = self
            .inner
            .path
            .child(id)
            .map_err(|_| Error::Validation(format!("Invalid service id '{}'", id)))?;

        let mut services = self
            .inner
            .services
            .write()
            .map_err(|_| Error::InvalidState("service list poisoned".into()))?;
        if services.iter().any(|s| s.uuid() == uuid) {
            return Err(Error::Validation(format!(
                "Duplicate service {} in application {}",
                uuid, self.inner.path
            )));
        }
        if services.iter().any(|s| s.path() == &path) {
            return Err(Error::Validation(format!("Duplicate service id '{}'", id)));
        }

        let service = Service::new(path, uuid, true, self.inner.shared.clone());
        services.push(service.clone());
        Ok(service)
    }

    /// Every object below the root with its interface
    fn objects(&self) -> Vec<(ObjectPath, Arc<dyn Interface>)> {
        let mut objects: Vec<(ObjectPath, Arc<dyn Interface>)> = Vec::new();
        for service in self.services() {
            let path = service.path().clone();
            let characteristics = service.characteristics();
            objects.push((path, Arc::new(service) as Arc<dyn Interface>));
            for characteristic in characteristics {
                let path = characteristic.path().clone();
                let descriptors = characteristic.descriptors();
                objects.push((path, Arc::new(characteristic) as Arc<dyn Interface>));
                for descriptor in descriptors {
                    let path = descriptor.path().clone();
                    objects.push((path, Arc::new(descriptor) as Arc<dyn Interface>));
                }
            }
        }
        objects
    }

    /// Exports the whole tree on `conn`; the tree is frozen afterwards
    pub fn export(&self, conn: &Connection) -> Result<()> {
        if self.is_exported() {
            return Err(Error::InvalidState(format!(
                "Application {} already exported",
                self.inner.path
            )));
        }

        let objects = self.objects();
        let mut exported = Vec::with_capacity(objects.len());
        for (path, interface) in objects {
            if let Err(e) = conn.export_object(&path, vec![interface]) {
                for path in &exported {
                    conn.unexport_object(path);
                }
                return Err(e);
            }
            exported.push(path);
        }
        conn.set_object_manager(&self.inner.path);
        self.inner.shared.set_exported(Some(conn.downgrade()));

        info!(
            "Exported GATT application {} ({} objects)",
            self.inner.path,
            exported.len()
        );
        Ok(())
    }

    /// Removes the tree from the connection and resets the registration state
    pub fn unexport(&self) {
        if let Some(conn) = self.inner.shared.connection() {
            for (path, _) in self.objects() {
                conn.unexport_object(&path);
            }
            conn.unexport_object(&self.inner.path);
        }
        self.inner.shared.set_exported(None);
        self.inner.shared.set_state(RegistrationState::Unregistered);
        debug!("Unexported GATT application {}", self.inner.path);
    }
}
