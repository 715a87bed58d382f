use super::advertisement::{Advertisement, AdvertisementState, AdvertisementType};
use super::constants::*;
use crate::bus::{Connection, ObjectPath, Proxy, Value};
use crate::error::{Error, ProtocolError, Result};
use log::{debug, info, warn};

/// Options sent with `RegisterAdvertisement`
///
/// Only fields that are set end up in the options map; with nothing set the
/// map is empty and the daemon applies its own defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisingOptions {
    /// Minimum advertising interval in milliseconds
    pub min_interval: Option<u16>,
    /// Maximum advertising interval in milliseconds
    pub max_interval: Option<u16>,
    pub adv_type: Option<AdvertisementType>,
}

impl AdvertisingOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interval(mut self, min: u16, max: u16) -> Self {
        self.min_interval = Some(min);
        self.max_interval = Some(max);
        self
    }

    pub fn advertisement_type(mut self, adv_type: AdvertisementType) -> Self {
        self.adv_type = Some(adv_type);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.min_interval.is_none() && self.max_interval.is_none() && self.adv_type.is_none()
    }

    /// Entries of the `a{sv}` options map
    pub fn to_entries(&self) -> Vec<(String, Value)> {
        let mut entries = Vec::new();
        if let Some(min) = self.min_interval {
            entries.push((OPTION_MIN_INTERVAL.to_string(), Value::UInt16(min)));
        }
        if let Some(max) = self.max_interval {
            entries.push((OPTION_MAX_INTERVAL.to_string(), Value::UInt16(max)));
        }
        if let Some(adv_type) = self.adv_type {
            entries.push((OPTION_TYPE.to_string(), Value::Str(adv_type.as_str().to_string())));
        }
        entries
    }
}

/// Instance limits reported by the advertising manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingCapacity {
    pub active_instances: u8,
    pub supported_instances: u8,
    pub supported_includes: Vec<String>,
}

impl AdvertisingCapacity {
    pub fn is_full(&self) -> bool {
        self.active_instances >= self.supported_instances
    }
}

/// Proxy for the daemon's `LEAdvertisingManager1` on one adapter
#[derive(Debug, Clone)]
pub struct AdvertisingManager {
    proxy: Proxy,
}

fn unexpected(expected: &str, value: &Value) -> Error {
    Error::Protocol(ProtocolError::UnexpectedSignature {
        expected: expected.to_string(),
        actual: value.signature(),
    })
}

impl AdvertisingManager {
    pub fn new(conn: &Connection, service: &str, adapter_path: &ObjectPath) -> Self {
        Self {
            proxy: Proxy::new(conn, service, adapter_path, ADVERTISING_MANAGER_INTERFACE),
        }
    }

    fn get_u8(&self, name: &str) -> Result<u8> {
        let value = self.proxy.get(name)?;
        value.as_u8().ok_or_else(|| unexpected("y", &value))
    }

    pub fn active_instances(&self) -> Result<u8> {
        self.get_u8(PROP_ACTIVE_INSTANCES)
    }

    pub fn supported_instances(&self) -> Result<u8> {
        self.get_u8(PROP_SUPPORTED_INSTANCES)
    }

    pub fn supported_includes(&self) -> Result<Vec<String>> {
        let value = self.proxy.get(PROP_SUPPORTED_INCLUDES)?;
        value.as_str_array().ok_or_else(|| unexpected("as", &value))
    }

    /// Reads all limits in one round trip
    pub fn capacity(&self) -> Result<AdvertisingCapacity> {
        let props = self.proxy.get_all()?;
        let find = |name: &str| props.iter().find(|(n, _)| n == name).map(|(_, v)| v);
        let instances = |name: &str| -> Result<u8> {
            let value = find(name).ok_or_else(|| {
                Error::Validation(format!("Advertising manager did not report {}", name))
            })?;
            value.as_u8().ok_or_else(|| unexpected("y", value))
        };
        Ok(AdvertisingCapacity {
            active_instances: instances(PROP_ACTIVE_INSTANCES)?,
            supported_instances: instances(PROP_SUPPORTED_INSTANCES)?,
            supported_includes: find(PROP_SUPPORTED_INCLUDES)
                .and_then(Value::as_str_array)
                .unwrap_or_default(),
        })
    }

    /// Registers `ad` with the daemon
    ///
    /// Fails immediately with [`Error::Capacity`] when every instance is in
    /// use, without calling `RegisterAdvertisement`. Otherwise the outcome of
    /// the registration is delivered to `callback`.
    pub fn register<F>(
        &self,
        ad: &Advertisement,
        options: &AdvertisingOptions,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if ad.state() != AdvertisementState::Created {
            return Err(Error::InvalidState(format!(
                "Advertisement {} is {:?}",
                ad.path(),
                ad.state()
            )));
        }

        let capacity = self.capacity()?;
        if capacity.is_full() {
            warn!(
                "No advertising instance free ({} of {} active)",
                capacity.active_instances, capacity.supported_instances
            );
            return Err(Error::Capacity {
                active: capacity.active_instances,
                supported: capacity.supported_instances,
            });
        }
        for include in ad.includes() {
            if !capacity.supported_includes.is_empty()
                && !capacity.supported_includes.contains(include)
            {
                warn!("Include '{}' is not supported by the adapter", include);
            }
        }

        ad.export(self.proxy.connection())?;
        ad.set_state(AdvertisementState::Registering);
        debug!("Registering advertisement {} with {:?}", ad.path(), options);

        let ad = ad.clone();
        self.proxy.call_async(
            "RegisterAdvertisement",
            vec![
                Value::ObjectPath(ad.path().clone()),
                Value::property_map(options.to_entries()),
            ],
            move |reply| match reply {
                Ok(_) => {
                    ad.activate();
                    info!("Advertisement {} registered", ad.path());
                    callback(Ok(()));
                }
                Err(e) => {
                    if ad.transition(AdvertisementState::Registering, AdvertisementState::Created) {
                        ad.unexport();
                    }
                    let e = e.into_registration();
                    warn!("Failed to register advertisement {}: {}", ad.path(), e);
                    callback(Err(e));
                }
            },
        );
        Ok(())
    }

    /// Unregisters an active advertisement; on success it is released
    pub fn unregister<F>(&self, ad: &Advertisement, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if ad.state() != AdvertisementState::Active {
            return Err(Error::InvalidState(format!(
                "Advertisement {} is {:?}",
                ad.path(),
                ad.state()
            )));
        }

        let ad = ad.clone();
        self.proxy.call_async(
            "UnregisterAdvertisement",
            vec![Value::ObjectPath(ad.path().clone())],
            move |reply| match reply {
                Ok(_) => {
                    ad.release();
                    callback(Ok(()));
                }
                Err(e) => callback(Err(e.into_registration())),
            },
        );
        Ok(())
    }

    /// Blocking form of [`unregister`](Self::unregister)
    pub fn unregister_blocking(&self, ad: &Advertisement) -> Result<()> {
        if ad.state() != AdvertisementState::Active {
            return Err(Error::InvalidState(format!(
                "Advertisement {} is {:?}",
                ad.path(),
                ad.state()
            )));
        }
        self.proxy
            .call(
                "UnregisterAdvertisement",
                vec![Value::ObjectPath(ad.path().clone())],
            )
            .map_err(Error::into_registration)?;
        ad.release();
        Ok(())
    }
}
