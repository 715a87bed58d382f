use crate::gap::constants::*;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Kind of adapter address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Public,
    Random,
}

impl AddressType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressType::Public => ADDRESS_TYPE_PUBLIC,
            AddressType::Random => ADDRESS_TYPE_RANDOM,
        }
    }
}

impl FromStr for AddressType {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ADDRESS_TYPE_PUBLIC => Ok(AddressType::Public),
            ADDRESS_TYPE_RANDOM => Ok(AddressType::Random),
            other => Err(AddressParseError(other.to_string())),
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid Bluetooth address: {0}")]
pub struct AddressParseError(pub String);

/// A Bluetooth device address, stored little-endian like on the air
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

impl FromStr for BdAddr {
    type Err = AddressParseError;

    /// Parses the `AA:BB:CC:DD:EE:FF` form used by the daemon
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AddressParseError(s.to_string());
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(invalid());
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            let mut octet = [0u8; 1];
            hex::decode_to_slice(part, &mut octet).map_err(|_| invalid())?;
            bytes[5 - i] = octet[0];
        }
        Ok(Self { bytes })
    }
}
