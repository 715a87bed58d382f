//! LE advertisement objects
//!
//! An [`Advertisement`] is exported as an `LEAdvertisement1` object. Its
//! lifecycle is `Created -> Registering -> Active -> Released`; a failed
//! registration rolls back to `Created` so the caller can retry.

use super::constants::*;
use crate::bus::{Connection, Interface, MethodCall, MethodSpec, ObjectPath, Value, WeakConnection};
use crate::error::{Error, MethodError, Result};
use crate::uuid::Uuid;
use log::{debug, info};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

/// Runs once when the advertisement is released
pub type ReleaseCallback = Box<dyn FnOnce() + Send>;

const ADVERTISEMENT_METHODS: &[MethodSpec] = &[MethodSpec {
    name: "Release",
    inputs: "",
    outputs: "",
}];

/// Advertisement kind, the `Type` property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdvertisementType {
    /// Connectable
    #[default]
    Peripheral,
    /// Non-connectable
    Broadcast,
}

impl AdvertisementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdvertisementType::Peripheral => "peripheral",
            AdvertisementType::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for AdvertisementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdvertisementType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "peripheral" => Ok(AdvertisementType::Peripheral),
            "broadcast" => Ok(AdvertisementType::Broadcast),
            other => Err(Error::Validation(format!("Unknown advertisement type '{}'", other))),
        }
    }
}

/// Lifecycle of an advertisement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertisementState {
    Created,
    Registering,
    Active,
    Released,
}

struct AdvertisementInner {
    path: ObjectPath,
    adv_type: AdvertisementType,
    local_name: Option<String>,
    service_uuids: Vec<Uuid>,
    includes: Vec<String>,
    appearance: Option<u16>,
    discoverable: Option<bool>,
    tx_power: Option<i16>,
    /// Advertising interval range in milliseconds
    interval: Option<(u32, u32)>,
    state: Mutex<AdvertisementState>,
    on_release: Mutex<Option<ReleaseCallback>>,
    connection: RwLock<Option<WeakConnection>>,
    disconnect_hook: Mutex<Option<u64>>,
}

/// An LE advertisement exported on the bus
#[derive(Clone)]
pub struct Advertisement {
    inner: Arc<AdvertisementInner>,
}

impl fmt::Debug for Advertisement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Advertisement")
            .field("path", &self.inner.path)
            .field("type", &self.inner.adv_type)
            .field("local_name", &self.inner.local_name)
            .field("state", &self.state())
            .finish()
    }
}

/// Creates an advertisement with the fields every peripheral sets
pub fn create_advertisement(
    path: &str,
    local_name: &str,
    service_uuids: &[Uuid],
    includes: &[&str],
    interval: Option<(u32, u32)>,
) -> Result<Advertisement> {
    let mut builder = Advertisement::builder(ObjectPath::new(path)?)
        .local_name(local_name)
        .service_uuids(service_uuids.iter().copied())
        .includes(includes.iter().copied());
    if let Some((min, max)) = interval {
        builder = builder.interval(min, max);
    }
    builder.build()
}

/// Builder for [`Advertisement`]
pub struct AdvertisementBuilder {
    path: ObjectPath,
    adv_type: AdvertisementType,
    local_name: Option<String>,
    service_uuids: Vec<Uuid>,
    includes: Vec<String>,
    appearance: Option<u16>,
    discoverable: Option<bool>,
    tx_power: Option<i16>,
    interval: Option<(u32, u32)>,
    on_release: Option<ReleaseCallback>,
}

impl AdvertisementBuilder {
    pub fn advertisement_type(mut self, adv_type: AdvertisementType) -> Self {
        self.adv_type = adv_type;
        self
    }

    pub fn local_name(mut self, name: &str) -> Self {
        self.local_name = Some(name.to_string());
        self
    }

    pub fn service_uuids<I: IntoIterator<Item = Uuid>>(mut self, uuids: I) -> Self {
        self.service_uuids.extend(uuids);
        self
    }

    pub fn includes<I, S>(mut self, includes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.includes.extend(includes.into_iter().map(Into::into));
        self
    }

    pub fn appearance(mut self, appearance: u16) -> Self {
        self.appearance = Some(appearance);
        self
    }

    pub fn discoverable(mut self, discoverable: bool) -> Self {
        self.discoverable = Some(discoverable);
        self
    }

    pub fn tx_power(mut self, dbm: i16) -> Self {
        self.tx_power = Some(dbm);
        self
    }

    /// Interval range in milliseconds
    pub fn interval(mut self, min_ms: u32, max_ms: u32) -> Self {
        self.interval = Some((min_ms, max_ms));
        self
    }

    pub fn on_release<F: FnOnce() + Send + 'static>(mut self, callback: F) -> Self {
        self.on_release = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> Result<Advertisement> {
        if let Some((min, max)) = self.interval {
            if min > max {
                return Err(Error::Validation(format!(
                    "Minimum interval {} exceeds maximum {}",
                    min, max
                )));
            }
        }
        let mut seen = Vec::with_capacity(self.service_uuids.len());
        for uuid in &self.service_uuids {
            if seen.contains(uuid) {
                return Err(Error::Validation(format!("Duplicate service UUID {}", uuid)));
            }
            seen.push(*uuid);
        }

        Ok(Advertisement {
            inner: Arc::new(AdvertisementInner {
                path: self.path,
                adv_type: self.adv_type,
                local_name: self.local_name,
                service_uuids: self.service_uuids,
                includes: self.includes,
                appearance: self.appearance,
                discoverable: self.discoverable,
                tx_power: self.tx_power,
                interval: self.interval,
                state: Mutex::new(AdvertisementState::Created),
                on_release: Mutex::new(self.on_release),
                connection: RwLock::new(None),
                disconnect_hook: Mutex::new(None),
            }),
        })
    }
}

impl Advertisement {
    pub fn builder(path: ObjectPath) -> AdvertisementBuilder {
        AdvertisementBuilder {
            path,
            adv_type: AdvertisementType::default(),
            local_name: None,
            service_uuids: Vec::new(),
            includes: Vec::new(),
            appearance: None,
            discoverable: None,
            tx_power: None,
            interval: None,
            on_release: None,
        }
    }

    pub fn path(&self) -> &ObjectPath {
        &self.inner.path
    }

    pub fn local_name(&self) -> Option<&str> {
        self.inner.local_name.as_deref()
    }

    pub fn service_uuids(&self) -> &[Uuid] {
        &self.inner.service_uuids
    }

    pub fn includes(&self) -> &[String] {
        &self.inner.includes
    }

    pub fn state(&self) -> AdvertisementState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(AdvertisementState::Released)
    }

    pub(crate) fn set_state(&self, state: AdvertisementState) {
        if let Ok(mut s) = self.inner.state.lock() {
            *s = state;
        }
    }

    /// Moves `from -> to`; returns false if the current state differs
    pub(crate) fn transition(&self, from: AdvertisementState, to: AdvertisementState) -> bool {
        match self.inner.state.lock() {
            Ok(mut s) if *s == from => {
                *s = to;
                true
            }
            _ => false,
        }
    }

    /// Replaces the release callback
    pub fn on_release<F: FnOnce() + Send + 'static>(&self, callback: F) {
        if let Ok(mut cb) = self.inner.on_release.lock() {
            *cb = Some(Box::new(callback));
        }
    }

    pub(crate) fn export(&self, conn: &Connection) -> Result<()> {
        conn.export_object(&self.inner.path, vec![Arc::new(self.clone()) as Arc<dyn Interface>])?;
        if let Ok(mut c) = self.inner.connection.write() {
            *c = Some(conn.downgrade());
        }
        Ok(())
    }

    fn connection(&self) -> Option<Connection> {
        self.inner
            .connection
            .read()
            .ok()
            .and_then(|c| c.as_ref().and_then(WeakConnection::upgrade))
    }

    pub(crate) fn unexport(&self) {
        if let Some(conn) = self.connection() {
            conn.unexport_object(&self.inner.path);
            let hook = self.inner.disconnect_hook.lock().ok().and_then(|mut h| h.take());
            if let Some(id) = hook {
                conn.remove_disconnect_hook(id);
            }
        }
        if let Ok(mut c) = self.inner.connection.write() {
            *c = None;
        }
    }

    /// Marks a registering advertisement active
    ///
    /// Installs a disconnect hook so a lost bus connection releases it.
    pub(crate) fn activate(&self) {
        if !self.transition(AdvertisementState::Registering, AdvertisementState::Active) {
            return;
        }
        if let Some(conn) = self.connection() {
            let ad = self.clone();
            let id = conn.on_disconnect(move || {
                ad.release();
            });
            if let Ok(mut hook) = self.inner.disconnect_hook.lock() {
                *hook = Some(id);
            }
        }
    }

    /// Releases the advertisement: un-exports it and runs the release callback
    ///
    /// Only the first call has any effect; it returns true.
    pub fn release(&self) -> bool {
        let previous = match self.inner.state.lock() {
            Ok(mut state) => std::mem::replace(&mut *state, AdvertisementState::Released),
            Err(_) => return false,
        };
        if previous == AdvertisementState::Released {
            debug!("Advertisement {} already released", self.inner.path);
            return false;
        }

        self.unexport();
        info!("Advertisement {} released", self.inner.path);

        let callback = self.inner.on_release.lock().ok().and_then(|mut cb| cb.take());
        if let Some(callback) = callback {
            callback();
        }
        true
    }
}

impl Interface for Advertisement {
    fn name(&self) -> &str {
        ADVERTISEMENT_INTERFACE
    }

    fn call(&self, call: &MethodCall<'_>) -> std::result::Result<Vec<Value>, MethodError> {
        match call.member() {
            "Release" => {
                self.release();
                Ok(Vec::new())
            }
            other => Err(crate::bus::object::unknown_method(ADVERTISEMENT_INTERFACE, other)),
        }
    }

    fn properties(&self) -> Vec<(String, Value)> {
        let inner = &self.inner;
        let mut props = vec![
            ("Type".to_string(), Value::Str(inner.adv_type.as_str().to_string())),
            (
                "ServiceUUIDs".to_string(),
                Value::str_array(inner.service_uuids.iter().map(Uuid::to_string)),
            ),
            (
                "Includes".to_string(),
                Value::str_array(inner.includes.iter().cloned()),
            ),
        ];
        if let Some(name) = &inner.local_name {
            props.push(("LocalName".to_string(), Value::Str(name.clone())));
        }
        if let Some(appearance) = inner.appearance {
            props.push(("Appearance".to_string(), Value::UInt16(appearance)));
        }
        if let Some(discoverable) = inner.discoverable {
            props.push(("Discoverable".to_string(), Value::Bool(discoverable)));
        }
        if let Some(tx_power) = inner.tx_power {
            props.push(("TxPower".to_string(), Value::Int16(tx_power)));
        }
        if let Some((min, max)) = inner.interval {
            props.push(("MinInterval".to_string(), Value::UInt32(min)));
            props.push(("MaxInterval".to_string(), Value::UInt32(max)));
        }
        props
    }

    fn methods(&self) -> &[MethodSpec] {
        ADVERTISEMENT_METHODS
    }
}
