//! RustyPeriph - BLE GATT peripherals over the system message bus
//!
//! This library speaks the message bus wire protocol directly on a Unix
//! socket and uses it to publish GATT applications and LE advertisements to
//! the Bluetooth daemon. It includes the bus transport, the GATT object
//! model, the advertisement registrar and a small adapter proxy.

pub mod adv;
pub mod bus;
pub mod error;
pub mod gap;
pub mod gatt;
pub mod peripheral;
pub mod uuid;

#[cfg(test)]
mod testing;

// Re-export common types for convenience
pub use adv::{
    create_advertisement, Advertisement, AdvertisementState, AdvertisementType,
    AdvertisingCapacity, AdvertisingManager, AdvertisingOptions,
};
pub use bus::{Connection, EventLoopThread, Interface, Message, ObjectPath, Proxy, Value};
pub use error::{ConnectionError, Error, MethodError, ProtocolError, Result, WriteError};
pub use gap::{AddressType, Adapter, AdapterInfo, BdAddr, ConnectionManager};
pub use gatt::{
    create_application, Application, Characteristic, CharacteristicFlags, Descriptor,
    GattManager, RegistrationState, Service,
};
pub use peripheral::{
    DeviceInfo, Peripheral, PeripheralConfig, PeripheralEvent, SerialProfile, ServerStatus,
    StatusSnapshot,
};
pub use uuid::Uuid;
