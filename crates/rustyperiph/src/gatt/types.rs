//! Common types for GATT objects
//!
//! This module defines flags, request options and the registration state
//! shared by every object of an application.

use super::constants::*;
use crate::bus::{ObjectPath, Value, WeakConnection};
use crate::error::{MethodError, WriteError};
use bitflags::bitflags;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

bitflags! {
    /// Characteristic properties, as exposed in the `Flags` property
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CharacteristicFlags: u16 {
        const BROADCAST = 0x0001;
        const READ = 0x0002;
        const WRITE_WITHOUT_RESPONSE = 0x0004;
        const WRITE = 0x0008;
        const NOTIFY = 0x0010;
        const INDICATE = 0x0020;
        const AUTHENTICATED_SIGNED_WRITES = 0x0040;
        const RELIABLE_WRITE = 0x0100;
        const WRITABLE_AUXILIARIES = 0x0200;
        const ENCRYPT_READ = 0x0400;
        const ENCRYPT_WRITE = 0x0800;
        const ENCRYPT_AUTHENTICATED_READ = 0x1000;
        const ENCRYPT_AUTHENTICATED_WRITE = 0x2000;
    }
}

const CHARACTERISTIC_FLAG_NAMES: &[(CharacteristicFlags, &str)] = &[
    (CharacteristicFlags::BROADCAST, "broadcast"),
    (CharacteristicFlags::READ, "read"),
    (CharacteristicFlags::WRITE_WITHOUT_RESPONSE, "write-without-response"),
    (CharacteristicFlags::WRITE, "write"),
    (CharacteristicFlags::NOTIFY, "notify"),
    (CharacteristicFlags::INDICATE, "indicate"),
    (CharacteristicFlags::AUTHENTICATED_SIGNED_WRITES, "authenticated-signed-writes"),
    (CharacteristicFlags::RELIABLE_WRITE, "reliable-write"),
    (CharacteristicFlags::WRITABLE_AUXILIARIES, "writable-auxiliaries"),
    (CharacteristicFlags::ENCRYPT_READ, "encrypt-read"),
    (CharacteristicFlags::ENCRYPT_WRITE, "encrypt-write"),
    (CharacteristicFlags::ENCRYPT_AUTHENTICATED_READ, "encrypt-authenticated-read"),
    (CharacteristicFlags::ENCRYPT_AUTHENTICATED_WRITE, "encrypt-authenticated-write"),
];

impl CharacteristicFlags {
    /// Flag strings in the order the daemon documents them
    pub fn to_strings(self) -> Vec<&'static str> {
        CHARACTERISTIC_FLAG_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Parses a single flag string
    pub fn from_flag_str(name: &str) -> Option<Self> {
        CHARACTERISTIC_FLAG_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(flag, _)| *flag)
    }

    pub fn can_read(self) -> bool {
        self.intersects(
            Self::READ | Self::ENCRYPT_READ | Self::ENCRYPT_AUTHENTICATED_READ,
        )
    }

    pub fn can_write(self) -> bool {
        self.intersects(
            Self::WRITE
                | Self::WRITE_WITHOUT_RESPONSE
                | Self::AUTHENTICATED_SIGNED_WRITES
                | Self::RELIABLE_WRITE
                | Self::ENCRYPT_WRITE
                | Self::ENCRYPT_AUTHENTICATED_WRITE,
        )
    }

    pub fn can_notify(self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }
}

bitflags! {
    /// Descriptor permissions, as exposed in the `Flags` property
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DescriptorFlags: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        const ENCRYPT_READ = 0x04;
        const ENCRYPT_WRITE = 0x08;
        const ENCRYPT_AUTHENTICATED_READ = 0x10;
        const ENCRYPT_AUTHENTICATED_WRITE = 0x20;
    }
}

const DESCRIPTOR_FLAG_NAMES: &[(DescriptorFlags, &str)] = &[
    (DescriptorFlags::READ, "read"),
    (DescriptorFlags::WRITE, "write"),
    (DescriptorFlags::ENCRYPT_READ, "encrypt-read"),
    (DescriptorFlags::ENCRYPT_WRITE, "encrypt-write"),
    (DescriptorFlags::ENCRYPT_AUTHENTICATED_READ, "encrypt-authenticated-read"),
    (DescriptorFlags::ENCRYPT_AUTHENTICATED_WRITE, "encrypt-authenticated-write"),
];

impl DescriptorFlags {
    pub fn to_strings(self) -> Vec<&'static str> {
        DESCRIPTOR_FLAG_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    pub fn can_read(self) -> bool {
        self.intersects(Self::READ | Self::ENCRYPT_READ | Self::ENCRYPT_AUTHENTICATED_READ)
    }

    pub fn can_write(self) -> bool {
        self.intersects(Self::WRITE | Self::ENCRYPT_WRITE | Self::ENCRYPT_AUTHENTICATED_WRITE)
    }
}

/// Kind of write requested by the remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteType {
    /// Write without response
    Command,
    /// Write with response
    #[default]
    Request,
    /// Part of a reliable write
    Reliable,
}

/// Options passed with `ReadValue`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub offset: usize,
    pub mtu: Option<u16>,
    pub device: Option<ObjectPath>,
}

impl ReadOptions {
    /// Parses an `a{sv}` options dict; unknown keys are ignored
    pub fn from_value(options: Option<&Value>) -> Self {
        let Some(options) = options else {
            return Self::default();
        };
        Self {
            offset: options
                .dict_get("offset")
                .and_then(Value::as_u16)
                .map_or(0, usize::from),
            mtu: options.dict_get("mtu").and_then(Value::as_u16),
            device: options.dict_get("device").and_then(Value::as_object_path).cloned(),
        }
    }
}

/// Options passed with `WriteValue`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub offset: usize,
    pub write_type: WriteType,
    pub mtu: Option<u16>,
    pub device: Option<ObjectPath>,
    pub prepare_authorize: bool,
}

impl WriteOptions {
    pub fn from_value(options: Option<&Value>) -> Self {
        let Some(options) = options else {
            return Self::default();
        };
        let write_type = match options.dict_get("type").and_then(Value::as_str) {
            Some("command") => WriteType::Command,
            Some("reliable") => WriteType::Reliable,
            _ => WriteType::Request,
        };
        Self {
            offset: options
                .dict_get("offset")
                .and_then(Value::as_u16)
                .map_or(0, usize::from),
            write_type,
            mtu: options.dict_get("mtu").and_then(Value::as_u16),
            device: options.dict_get("device").and_then(Value::as_object_path).cloned(),
            prepare_authorize: options
                .dict_get("prepare-authorize")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

/// Progress of `RegisterApplication`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationState {
    #[default]
    Unregistered,
    Registering,
    Registered,
}

/// State shared by an application and every object it owns
#[derive(Default)]
pub(crate) struct AppShared {
    state: RwLock<RegistrationState>,
    exported: AtomicBool,
    connection: RwLock<Option<WeakConnection>>,
}

impl AppShared {
    pub(crate) fn state(&self) -> RegistrationState {
        self.state.read().map(|s| *s).unwrap_or_default()
    }

    pub(crate) fn set_state(&self, state: RegistrationState) {
        if let Ok(mut s) = self.state.write() {
            *s = state;
        }
    }

    pub(crate) fn is_exported(&self) -> bool {
        self.exported.load(Ordering::SeqCst)
    }

    pub(crate) fn set_exported(&self, connection: Option<WeakConnection>) {
        self.exported.store(connection.is_some(), Ordering::SeqCst);
        if let Ok(mut c) = self.connection.write() {
            *c = connection;
        }
    }

    pub(crate) fn connection(&self) -> Option<crate::bus::Connection> {
        self.connection
            .read()
            .ok()
            .and_then(|c| c.as_ref().and_then(WeakConnection::upgrade))
    }
}

impl From<WriteError> for MethodError {
    fn from(err: WriteError) -> Self {
        let name = match err {
            WriteError::NotReady => BLUEZ_ERROR_NOT_READY,
            WriteError::NotPermitted => BLUEZ_ERROR_NOT_PERMITTED,
            WriteError::InvalidOffset(_) => BLUEZ_ERROR_INVALID_OFFSET,
            WriteError::InvalidValueLength(_) => BLUEZ_ERROR_INVALID_VALUE_LENGTH,
            WriteError::Rejected(_) => BLUEZ_ERROR_FAILED,
        };
        MethodError::new(name, err.to_string())
    }
}

/// Reads `value[offset..]`, failing past the end
pub(crate) fn read_at(value: &[u8], offset: usize) -> Result<Vec<u8>, MethodError> {
    if offset > value.len() {
        return Err(MethodError::new(
            BLUEZ_ERROR_INVALID_OFFSET,
            format!("Offset {} beyond value length {}", offset, value.len()),
        ));
    }
    Ok(value[offset..].to_vec())
}

/// Replaces everything from `offset` on with `data`
pub(crate) fn write_at(value: &mut Vec<u8>, offset: usize, data: &[u8]) -> Result<(), WriteError> {
    if offset > value.len() {
        return Err(WriteError::InvalidOffset(offset));
    }
    if offset + data.len() > MAX_ATTRIBUTE_VALUE_LEN {
        return Err(WriteError::InvalidValueLength(offset + data.len()));
    }
    value.truncate(offset);
    value.extend_from_slice(data);
    Ok(())
}

/// Extracts the `ay` argument of `WriteValue`
pub(crate) fn bytes_arg(value: &Value) -> Result<Vec<u8>, MethodError> {
    value.as_bytes().ok_or_else(|| {
        MethodError::new(
            BLUEZ_ERROR_INVALID_ARGUMENTS,
            format!("Expected a byte array, got {}", value.signature()),
        )
    })
}
