//! Host adapter access

pub mod adapter;
pub mod connections;
pub mod constants;
pub mod types;

pub use adapter::{Adapter, AdapterInfo};
pub use connections::{device_address, ConnectionManager};
pub use constants::*;
pub use types::*;
