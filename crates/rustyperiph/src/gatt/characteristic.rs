//! GATT characteristics
//!
//! A characteristic owns its value and descriptors and keeps a weak
//! reference back to the service that created it.

use super::constants::*;
use super::descriptor::Descriptor;
use super::service::{Service, ServiceInner};
use super::types::*;
use crate::bus::{Interface, MethodCall, MethodSpec, ObjectPath, Value};
use crate::error::{Error, MethodError, Result, WriteError};
use crate::uuid::Uuid;
use log::{debug, trace};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Application logic run on every accepted remote write
///
/// Returning an error rejects the write and leaves the value untouched.
pub type WriteHook = Arc<dyn Fn(&[u8], &WriteOptions) -> std::result::Result<(), WriteError> + Send + Sync>;

const CHARACTERISTIC_METHODS: &[MethodSpec] = &[
    MethodSpec {
        name: "ReadValue",
        inputs: "a{sv}",
        outputs: "ay",
    },
    MethodSpec {
        name: "WriteValue",
        inputs: "aya{sv}",
        outputs: "",
    },
    MethodSpec {
        name: "StartNotify",
        inputs: "",
        outputs: "",
    },
    MethodSpec {
        name: "StopNotify",
        inputs: "",
        outputs: "",
    },
];

pub(crate) struct CharacteristicInner {
    path: ObjectPath,
    uuid: Uuid,
    flags: CharacteristicFlags,
    value: RwLock<Vec<u8>>,
    notifying: AtomicBool,
    service: Weak<ServiceInner>,
    service_path: ObjectPath,
    write_hook: RwLock<Option<WriteHook>>,
    descriptors: RwLock<Vec<Descriptor>>,
    shared: Arc<AppShared>,
}

/// A GATT characteristic exported at `<service>/charNNNN`
#[derive(Clone)]
pub struct Characteristic {
    inner: Arc<CharacteristicInner>,
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("path", self.path())
            .field("uuid", &self.inner.uuid)
            .field("flags", &self.inner.flags)
            .finish()
    }
}

impl Characteristic {
    pub(crate) fn new(
        path: ObjectPath,
        uuid: Uuid,
        flags: CharacteristicFlags,
        value: Vec<u8>,
        service: Weak<ServiceInner>,
        service_path: ObjectPath,
        shared: Arc<AppShared>,
    ) -> Self {
        Self {
            inner: Arc::new(CharacteristicInner {
                path,
                uuid,
                flags,
                value: RwLock::new(value),
                notifying: AtomicBool::new(false),
                service,
                service_path,
                write_hook: RwLock::new(None),
                descriptors: RwLock::new(Vec::new()),
                shared,
            }),
        }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.inner.path
    }

    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    pub fn flags(&self) -> CharacteristicFlags {
        self.inner.flags
    }

    /// The owning service, if it is still alive
    pub fn service(&self) -> Option<Service> {
        self.inner.service.upgrade().map(Service::from_inner)
    }

    pub fn value(&self) -> Vec<u8> {
        self.inner.value.read().map(|v| v.clone()).unwrap_or_default()
    }

    /// Replaces the value locally without notifying anyone
    pub fn set_value(&self, value: &[u8]) {
        if let Ok(mut v) = self.inner.value.write() {
            *v = value.to_vec();
        }
    }

    pub fn is_notifying(&self) -> bool {
        self.inner.notifying.load(Ordering::SeqCst)
    }

    pub fn descriptors(&self) -> Vec<Descriptor> {
        self.inner
            .descriptors
            .read()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// Installs the hook that validates and consumes remote writes
    pub fn set_write_hook<F>(&self, hook: F)
    where
        F: Fn(&[u8], &WriteOptions) -> std::result::Result<(), WriteError> + Send + Sync + 'static,
    {
        if let Ok(mut h) = self.inner.write_hook.write() {
            *h = Some(Arc::new(hook));
        }
    }

    /// Adds a descriptor; only possible before the application is exported
    pub fn add_descriptor(
        &self,
        uuid: Uuid,
        flags: DescriptorFlags,
        value: &[u8],
    ) -> Result<Descriptor> {
        if self.inner.shared.is_exported() {
            return Err(Error::InvalidState(format!(
                "Cannot add descriptor to {}: application already exported",
                self.inner.path
            )));
        }
        if value.len() > MAX_ATTRIBUTE_VALUE_LEN {
            return Err(Error::Validation(format!(
                "Descriptor value of {} bytes exceeds {}",
                value.len(),
                MAX_ATTRIBUTE_VALUE_LEN
            )));
        }
        let mut descriptors = self
            .inner
            .descriptors
            .write()
            .map_err(|_| Error::InvalidState("descriptor list poisoned".into()))?;
        if descriptors.iter().any(|d| d.uuid() == uuid) {
            return Err(Error::Validation(format!(
                "Duplicate descriptor {} in characteristic {}",
                uuid, self.inner.uuid
            )));
        }
        let path = self
            .inner
            .path
            .child(&format!("desc{:04}", descriptors.len()))?;
        let descriptor = Descriptor::new(
            path,
            uuid,
            flags,
            value.to_vec(),
            self.inner.path.clone(),
            self.inner.shared.clone(),
        );
        descriptors.push(descriptor.clone());
        Ok(descriptor)
    }

    /// Adds a read-only `2901` user description
    pub fn add_user_description(&self, text: &str) -> Result<Descriptor> {
        self.add_descriptor(
            CHARACTERISTIC_USER_DESCRIPTION,
            DescriptorFlags::READ,
            text.as_bytes(),
        )
    }

    /// Handles a remote read
    pub fn handle_read(&self, options: &ReadOptions) -> std::result::Result<Vec<u8>, MethodError> {
        if !self.inner.flags.can_read() {
            return Err(MethodError::new(
                BLUEZ_ERROR_NOT_PERMITTED,
                format!("Characteristic {} is not readable", self.inner.uuid),
            ));
        }
        let value = read_at(&self.value(), options.offset)?;
        trace!("Read {} bytes from {}", value.len(), self.inner.path);
        Ok(value)
    }

    /// Handles a remote write
    ///
    /// Checks readiness, permissions and offset, then runs the write hook
    /// and finally stores the value.
    pub fn handle_write(&self, data: &[u8], options: &WriteOptions) -> std::result::Result<(), WriteError> {
        if self.inner.shared.state() != RegistrationState::Registered {
            return Err(WriteError::NotReady);
        }
        if !self.inner.flags.can_write() {
            return Err(WriteError::NotPermitted);
        }

        let mut candidate = self.value();
        write_at(&mut candidate, options.offset, data)?;

        let hook = self.inner.write_hook.read().ok().and_then(|h| h.clone());
        if let Some(hook) = hook {
            hook(data, options)?;
        }

        self.set_value(&candidate);
        debug!(
            "Characteristic {} written ({} bytes, {:?})",
            self.inner.path,
            data.len(),
            options.write_type
        );
        Ok(())
    }

    fn start_notify(&self) -> std::result::Result<(), MethodError> {
        if !self.inner.flags.can_notify() {
            return Err(MethodError::new(
                BLUEZ_ERROR_NOT_SUPPORTED,
                format!("Characteristic {} does not support notifications", self.inner.uuid),
            ));
        }
        if !self.inner.notifying.swap(true, Ordering::SeqCst) {
            debug!("Notifications enabled on {}", self.inner.path);
            self.emit_changed("Notifying", Value::Bool(true));
        }
        Ok(())
    }

    fn stop_notify(&self) -> std::result::Result<(), MethodError> {
        if !self.inner.flags.can_notify() {
            return Err(MethodError::new(
                BLUEZ_ERROR_NOT_SUPPORTED,
                format!("Characteristic {} does not support notifications", self.inner.uuid),
            ));
        }
        if self.inner.notifying.swap(false, Ordering::SeqCst) {
            debug!("Notifications disabled on {}", self.inner.path);
            self.emit_changed("Notifying", Value::Bool(false));
        }
        Ok(())
    }

    fn emit_changed(&self, name: &str, value: Value) {
        if let Some(conn) = self.inner.shared.connection() {
            if let Err(e) = conn.emit_properties_changed(
                &self.inner.path,
                GATT_CHARACTERISTIC_INTERFACE,
                vec![(name.to_string(), value)],
            ) {
                log::warn!("Failed to emit {} change for {}: {}", name, self.inner.path, e);
            }
        }
    }

    /// Pushes `data` to subscribed peers
    ///
    /// Without a subscriber this is a no-op and returns `Ok(false)`; the
    /// stored value is only updated when a notification is sent.
    pub fn notify(&self, data: &[u8]) -> Result<bool> {
        if !self.is_notifying() {
            trace!("Notify on {} skipped: no subscriber", self.inner.path);
            return Ok(false);
        }
        if data.len() > MAX_ATTRIBUTE_VALUE_LEN {
            return Err(Error::Write(WriteError::InvalidValueLength(data.len())));
        }
        let conn = self.inner.shared.connection().ok_or_else(|| {
            Error::InvalidState(format!("Characteristic {} is not exported", self.inner.path))
        })?;
        self.set_value(data);
        conn.emit_properties_changed(
            &self.inner.path,
            GATT_CHARACTERISTIC_INTERFACE,
            vec![("Value".to_string(), Value::bytes(data))],
        )?;
        debug!("Notified {} bytes on {}", data.len(), self.inner.path);
        Ok(true)
    }
}

impl Interface for Characteristic {
    fn name(&self) -> &str {
        GATT_CHARACTERISTIC_INTERFACE
    }

    fn call(&self, call: &MethodCall<'_>) -> std::result::Result<Vec<Value>, MethodError> {
        match call.member() {
            "ReadValue" => {
                let options = ReadOptions::from_value(call.args().first());
                Ok(vec![Value::bytes(&self.handle_read(&options)?)])
            }
            "WriteValue" => {
                let data = bytes_arg(call.arg(0)?)?;
                let options = WriteOptions::from_value(call.args().get(1));
                self.handle_write(&data, &options)?;
                Ok(Vec::new())
            }
            "StartNotify" => self.start_notify().map(|_| Vec::new()),
            "StopNotify" => self.stop_notify().map(|_| Vec::new()),
            "AcquireWrite" | "AcquireNotify" => Err(MethodError::new(
                BLUEZ_ERROR_NOT_SUPPORTED,
                format!("{} is not supported", call.member()),
            )),
            other => Err(crate::bus::object::unknown_method(
                GATT_CHARACTERISTIC_INTERFACE,
                other,
            )),
        }
    }

    fn properties(&self) -> Vec<(String, Value)> {
        let mut props = vec![
            ("UUID".to_string(), Value::Str(self.inner.uuid.to_string())),
            (
                "Service".to_string(),
                Value::ObjectPath(self.inner.service_path.clone()),
            ),
            ("Value".to_string(), Value::bytes(&self.value())),
            (
                "Flags".to_string(),
                Value::str_array(self.inner.flags.to_strings()),
            ),
        ];
        if self.inner.flags.can_notify() {
            props.push(("Notifying".to_string(), Value::Bool(self.is_notifying())));
        }
        props
    }

    fn methods(&self) -> &[MethodSpec] {
        CHARACTERISTIC_METHODS
    }
}
