use crate::bus::constants::PROPERTIES_INTERFACE;
use crate::bus::{Connection, ObjectPath, Proxy, SignalMatch, Value};
use crate::error::{Error, ProtocolError, Result};
use crate::gap::constants::*;
use crate::gap::types::*;
use log::{debug, info};

/// Snapshot of the adapter's properties
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub address: Option<BdAddr>,
    pub address_type: Option<AddressType>,
    pub name: String,
    pub alias: String,
    pub powered: bool,
    pub discoverable: bool,
    pub pairable: bool,
}

/// Proxy for the daemon's `Adapter1` object
#[derive(Debug, Clone)]
pub struct Adapter {
    proxy: Proxy,
}

fn unexpected(expected: &str, value: &Value) -> Error {
    Error::Protocol(ProtocolError::UnexpectedSignature {
        expected: expected.to_string(),
        actual: value.signature(),
    })
}

impl Adapter {
    pub fn new(conn: &Connection, service: &str, path: &ObjectPath) -> Self {
        Self {
            proxy: Proxy::new(conn, service, path, ADAPTER_INTERFACE),
        }
    }

    pub fn path(&self) -> &ObjectPath {
        self.proxy.path()
    }

    fn get_bool(&self, name: &str) -> Result<bool> {
        let value = self.proxy.get(name)?;
        value.as_bool().ok_or_else(|| unexpected("b", &value))
    }

    fn get_string(&self, name: &str) -> Result<String> {
        let value = self.proxy.get(name)?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| unexpected("s", &value))
    }

    fn set(&self, name: &str, value: Value) -> Result<()> {
        debug!("Setting adapter {} to {:?}", name, value);
        self.proxy.set(name, value)
    }

    pub fn powered(&self) -> Result<bool> {
        self.get_bool(PROP_POWERED)
    }

    pub fn set_powered(&self, powered: bool) -> Result<()> {
        self.set(PROP_POWERED, Value::Bool(powered))
    }

    pub fn discoverable(&self) -> Result<bool> {
        self.get_bool(PROP_DISCOVERABLE)
    }

    pub fn set_discoverable(&self, discoverable: bool) -> Result<()> {
        self.set(PROP_DISCOVERABLE, Value::Bool(discoverable))
    }

    /// Seconds the adapter stays discoverable; 0 means forever
    pub fn set_discoverable_timeout(&self, seconds: u32) -> Result<()> {
        self.set(PROP_DISCOVERABLE_TIMEOUT, Value::UInt32(seconds))
    }

    pub fn pairable(&self) -> Result<bool> {
        self.get_bool(PROP_PAIRABLE)
    }

    pub fn set_pairable(&self, pairable: bool) -> Result<()> {
        self.set(PROP_PAIRABLE, Value::Bool(pairable))
    }

    pub fn alias(&self) -> Result<String> {
        self.get_string(PROP_ALIAS)
    }

    pub fn set_alias(&self, alias: &str) -> Result<()> {
        self.set(PROP_ALIAS, Value::Str(alias.to_string()))
    }

    pub fn name(&self) -> Result<String> {
        self.get_string(PROP_NAME)
    }

    pub fn address(&self) -> Result<BdAddr> {
        let address = self.get_string(PROP_ADDRESS)?;
        address
            .parse()
            .map_err(|e: AddressParseError| Error::Validation(e.to_string()))
    }

    pub fn address_type(&self) -> Result<AddressType> {
        let address_type = self.get_string(PROP_ADDRESS_TYPE)?;
        address_type
            .parse()
            .map_err(|e: AddressParseError| Error::Validation(e.to_string()))
    }

    /// Reads all adapter properties in one round trip
    pub fn info(&self) -> Result<AdapterInfo> {
        let props = self.proxy.get_all()?;
        let find = |name: &str| props.iter().find(|(n, _)| n == name).map(|(_, v)| v);
        let text = |name: &str| {
            find(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let flag = |name: &str| find(name).and_then(Value::as_bool).unwrap_or(false);

        Ok(AdapterInfo {
            address: find(PROP_ADDRESS)
                .and_then(Value::as_str)
                .and_then(|a| a.parse().ok()),
            address_type: find(PROP_ADDRESS_TYPE)
                .and_then(Value::as_str)
                .and_then(|a| a.parse().ok()),
            name: text(PROP_NAME),
            alias: text(PROP_ALIAS),
            powered: flag(PROP_POWERED),
            discoverable: flag(PROP_DISCOVERABLE),
            pairable: flag(PROP_PAIRABLE),
        })
    }

    /// Powers the adapter and makes it visible under `alias`
    pub fn configure(&self, alias: &str, pairable: bool) -> Result<()> {
        self.set_powered(true)?;
        self.set_alias(alias)?;
        self.set_discoverable_timeout(0)?;
        self.set_discoverable(true)?;
        self.set_pairable(pairable)?;
        info!(
            "Adapter {} configured as '{}' (pairable: {})",
            self.path(),
            alias,
            pairable
        );
        Ok(())
    }

    /// Calls `handler` with the changed properties whenever the adapter reports changes
    pub fn on_properties_changed<F>(&self, handler: F) -> Result<u64>
    where
        F: Fn(&[(String, Value)]) + Send + Sync + 'static,
    {
        let rule = SignalMatch::new()
            .sender(self.proxy.destination())
            .path(self.proxy.path())
            .interface(PROPERTIES_INTERFACE)
            .member("PropertiesChanged");
        self.proxy.connection().subscribe_signal(rule, move |msg| {
            if msg.body.first().and_then(Value::as_str) != Some(ADAPTER_INTERFACE) {
                return;
            }
            if let Some(changed) = msg.body.get(1).and_then(Value::to_property_list) {
                handler(&changed);
            }
        })
    }
}
