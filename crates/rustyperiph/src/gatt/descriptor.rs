use super::constants::*;
use super::types::*;
use crate::bus::{Interface, MethodCall, MethodSpec, ObjectPath, Value};
use crate::error::{MethodError, WriteError};
use crate::uuid::Uuid;
use log::debug;
use std::sync::{Arc, RwLock};

const DESCRIPTOR_METHODS: &[MethodSpec] = &[
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
];

struct DescriptorInner {
    path: ObjectPath,
    uuid: Uuid,
    flags: DescriptorFlags,
    value: RwLock<Vec<u8>>,
    characteristic_path: ObjectPath,
    shared: Arc<AppShared>,
}

/// A GATT descriptor exported at `<characteristic>/descNNNN`
#[derive(Clone)]
pub struct Descriptor {
    inner: Arc<DescriptorInner>,
}

impl Descriptor {
    pub(crate) fn new(
        path: ObjectPath,
        uuid: Uuid,
        flags: DescriptorFlags,
        value: Vec<u8>,
        characteristic_path: ObjectPath,
        shared: Arc<AppShared>,
    ) -> Self {
        Self {
            inner: Arc::new(DescriptorInner {
                path,
                uuid,
                flags,
                value: RwLock::new(value),
                characteristic_path,
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

    pub fn flags(&self) -> DescriptorFlags {
        self.inner.flags
    }

    pub fn value(&self) -> Vec<u8> {
        self.inner.value.read().map(|v| v.clone()).unwrap_or_default()
    }

    /// Handles a remote read
    pub fn handle_read(&self, options: &ReadOptions) -> Result<Vec<u8>, MethodError> {
        if !self.inner.flags.can_read() {
            return Err(MethodError::new(
                BLUEZ_ERROR_NOT_PERMITTED,
                format!("Descriptor {} is not readable", self.inner.uuid),
            ));
        }
        read_at(&self.value(), options.offset)
    }

    /// Handles a remote write
    pub fn handle_write(&self, data: &[u8], options: &WriteOptions) -> Result<(), WriteError> {
        if self.inner.shared.state() != RegistrationState::Registered {
            return Err(WriteError::NotReady);
        }
        if !self.inner.flags.can_write() {
            return Err(WriteError::NotPermitted);
        }
        let mut value = self
            .inner
            .value
            .write()
            .map_err(|_| WriteError::Rejected("descriptor value poisoned".into()))?;
        write_at(&mut value, options.offset, data)?;
        debug!("Descriptor {} written ({} bytes)", self.inner.path, data.len());
        Ok(())
    }
}

impl Interface for Descriptor {
    fn name(&self) -> &str {
        GATT_DESCRIPTOR_INTERFACE
    }

    fn call(&self, call: &MethodCall<'_>) -> Result<Vec<Value>, MethodError> {
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
            other => Err(crate::bus::object::unknown_method(GATT_DESCRIPTOR_INTERFACE, other)),
        }
    }

    fn properties(&self) -> Vec<(String, Value)> {
        vec![
            ("UUID".into(), Value::Str(self.inner.uuid.to_string())),
            (
                "Characteristic".into(),
                Value::ObjectPath(self.inner.characteristic_path.clone()),
            ),
            ("Value".into(), Value::bytes(&self.value())),
            ("Flags".into(), Value::str_array(self.inner.flags.to_strings())),
        ]
    }

    fn methods(&self) -> &[MethodSpec] {
        DESCRIPTOR_METHODS
    }
}
