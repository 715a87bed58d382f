//! LE advertisement registrar

pub mod advertisement;
pub mod constants;
pub mod manager;

#[cfg(test)]
mod tests;

pub use advertisement::{
    create_advertisement, Advertisement, AdvertisementBuilder, AdvertisementState,
    AdvertisementType,
};
pub use manager::{AdvertisingCapacity, AdvertisingManager, AdvertisingOptions};
