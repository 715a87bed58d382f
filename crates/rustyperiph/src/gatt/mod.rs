//! GATT (Generic Attribute Profile) object model
//!
//! An [`Application`] owns services, services own characteristics and
//! characteristics own descriptors. The tree is exported on a bus
//! connection and registered with the Bluetooth daemon through
//! [`GattManager`], which then forwards remote reads, writes and
//! subscriptions as method calls.

pub mod application;
pub mod characteristic;
pub mod constants;
pub mod descriptor;
pub mod manager;
pub mod service;
pub mod types;


pub use application::{create_application, Application};
pub use characteristic::{Characteristic, WriteHook};
pub use descriptor::Descriptor;
pub use manager::GattManager;
pub use service::Service;
pub use types::{
    CharacteristicFlags, DescriptorFlags, ReadOptions, RegistrationState, WriteOptions, WriteType,
};
