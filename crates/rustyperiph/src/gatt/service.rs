use super::characteristic::Characteristic;
use super::constants::*;
use super::types::*;
use crate::bus::{Interface, MethodCall, ObjectPath, Value};
use crate::error::{Error, MethodError, Result, WriteError};
use crate::uuid::Uuid;
use std::sync::{Arc, RwLock};

pub(crate) struct ServiceInner {
    path: ObjectPath,
    uuid: Uuid,
    primary: bool,
    characteristics: RwLock<Vec<Characteristic>>,
    shared: Arc<AppShared>,
}

/// A GATT service exported at `<application>/<id>`
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    pub(crate) fn new(path: ObjectPath, uuid: Uuid, primary: bool, shared: Arc<AppShared>) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                path,
                uuid,
                primary,
                characteristics: RwLock::new(Vec::new()),
                shared,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ServiceInner>) -> Self {
        Self { inner }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.inner.path
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn is_primary(&self) -> bool {
        self.inner.primary
    }

    pub fn characteristics(&self) -> Vec<Characteristic> {
        self.inner
            .characteristics
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<Characteristic> {
        self.characteristics().into_iter().find(|c| c.uuid() == uuid)
    }

    /// Adds a characteristic; UUIDs must be unique within the service
    pub fn add_characteristic(
        &self,
        uuid: Uuid,
        flags: CharacteristicFlags,
        initial_value: &[u8],
    ) -> Result<Characteristic> {
        if self.inner.shared.is_exported() {
            return Err(Error::InvalidState(format!(
                "Cannot add characteristic to {}: application already exported",
                self.inner.path
            )));
        }
        if initial_value.len() > MAX_ATTRIBUTE_VALUE_LEN {
            return Err(Error::Validation(format!(
                "Initial value of {} bytes exceeds {}",
                initial_value.len(),
                MAX_ATTRIBUTE_VALUE_LEN
            )));
        }

        let mut characteristics = self
            .inner
            .characteristics
            .write()
            .map_err(|_| Error::InvalidState("characteristic list poisoned".into()))?;
        if characteristics.iter().any(|c| c.uuid() == uuid) {
            return Err(Error::Validation(format!(
                "Duplicate characteristic {} in service {}",
                uuid, self.inner.uuid
            )));
        }

        let path = self
            .inner
            .path
            .child(&format!("char{:04}", characteristics.len()))?;
        let characteristic = Characteristic::new(
            path,
            uuid,
            flags,
            initial_value.to_vec(),
            Arc::downgrade(&self.inner),
            self.inner.path.clone(),
            self.inner.shared.clone(),
        );
        characteristics.push(characteristic.clone());
        Ok(characteristic)
    }

    /// Adds a read-only characteristic holding a UTF-8 string
    pub fn add_read_only_string(&self, uuid: Uuid, text: &str) -> Result<Characteristic> {
        self.add_characteristic(uuid, CharacteristicFlags::READ, text.as_bytes())
    }

    /// Adds a serial-style RX characteristic whose writes go to `sink`
    pub fn add_serial_rx<F>(&self, uuid: Uuid, sink: F) -> Result<Characteristic>
    where
        F: Fn(&[u8], &WriteOptions) -> std::result::Result<(), WriteError> + Send + Sync + 'static,
    {
        let characteristic = self.add_characteristic(
            uuid,
            CharacteristicFlags::WRITE | CharacteristicFlags::WRITE_WITHOUT_RESPONSE,
            &[],
        )?;
        characteristic.set_write_hook(sink);
        Ok(characteristic)
    }

    /// Adds a serial-style TX characteristic peers read or subscribe to
    pub fn add_notify_tx(&self, uuid: Uuid) -> Result<Characteristic> {
        self.add_characteristic(
            uuid,
            CharacteristicFlags::READ | CharacteristicFlags::NOTIFY,
            &[],
        )
    }
}

impl Interface for Service {
    fn name(&self) -> &str {
        GATT_SERVICE_INTERFACE
    }

    fn call(&self, call: &MethodCall<'_>) -> std::result::Result<Vec<Value>, MethodError> {
        Err(crate::bus::object::unknown_method(
            GATT_SERVICE_INTERFACE,
            call.member(),
        ))
    }

    fn properties(&self) -> Vec<(String, Value)> {
        vec![
            ("UUID".to_string(), Value::Str(self.inner.uuid.to_string())),
            ("Primary".to_string(), Value::Bool(self.inner.primary)),
            (
                "Includes".to_string(),
                Value::path_array(Vec::<ObjectPath>::new()),
            ),
        ]
    }
}
