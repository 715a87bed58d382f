//! Connected central tracking
//!
//! The daemon reports each link through the `Connected` property of the
//! remote device's `Device1` object, so the set of connected clients is kept
//! up to date from `PropertiesChanged` signals.

use crate::bus::constants::PROPERTIES_INTERFACE;
use crate::bus::{Connection, ObjectPath, SignalMatch, Value};
use crate::error::{Error, Result};
use crate::gap::constants::*;
use crate::gap::types::BdAddr;
use log::{debug, info};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

/// Address encoded in a device path such as `/org/bluez/hci0/dev_00_11_22_33_44_55`
pub fn device_address(path: &ObjectPath) -> Option<BdAddr> {
    let element = path.as_str().rsplit('/').next()?;
    element.strip_prefix("dev_")?.replace('_', ":").parse().ok()
}

fn describe(path: &ObjectPath) -> String {
    match device_address(path) {
        Some(addr) => addr.to_string(),
        None => path.to_string(),
    }
}

#[derive(Default)]
struct Clients(Mutex<BTreeSet<ObjectPath>>);

impl Clients {
    fn update(&self, device: &ObjectPath, connected: bool) -> bool {
        let Ok(mut clients) = self.0.lock() else {
            return false;
        };
        let changed = if connected {
            clients.insert(device.clone())
        } else {
            clients.remove(device)
        };
        if changed {
            info!(
                "Client {} {}, {} connected",
                describe(device),
                if connected { "connected" } else { "disconnected" },
                clients.len()
            );
        }
        changed
    }
}

/// Set of remote devices currently connected to the adapter
#[derive(Default)]
pub struct ConnectionManager {
    clients: Arc<Clients>,
    subscription: Mutex<Option<(Connection, u64)>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follows `Connected` changes of devices announced by `service`
    ///
    /// `on_change` runs on the event loop for every device whose state
    /// actually changed. Watching twice is a no-op.
    pub fn watch<F>(&self, conn: &Connection, service: &str, on_change: F) -> Result<()>
    where
        F: Fn(&ObjectPath, bool) + Send + Sync + 'static,
    {
        let mut subscription = self
            .subscription
            .lock()
            .map_err(|_| Error::InvalidState("connection watch poisoned".into()))?;
        if subscription.is_some() {
            return Ok(());
        }

        let rule = SignalMatch::new()
            .sender(service)
            .interface(PROPERTIES_INTERFACE)
            .member("PropertiesChanged");
        let clients = self.clients.clone();
        let id = conn.subscribe_signal(rule, move |msg| {
            if msg.body.first().and_then(Value::as_str) != Some(DEVICE_INTERFACE) {
                return;
            }
            let connected = msg
                .body
                .get(1)
                .and_then(|changed| changed.dict_get(PROP_CONNECTED))
                .and_then(Value::as_bool);
            if let (Some(path), Some(connected)) = (msg.path.as_ref(), connected) {
                if clients.update(path, connected) {
                    on_change(path, connected);
                }
            }
        })?;
        debug!("Watching device connections from {}", service);
        *subscription = Some((conn.clone(), id));
        Ok(())
    }

    /// Stops following device signals; the client set is left as is
    pub fn unwatch(&self) {
        let taken = self.subscription.lock().ok().and_then(|mut s| s.take());
        if let Some((conn, id)) = taken {
            conn.unsubscribe_signal(id);
        }
    }

    /// Records a connection; false if the device was already known
    pub fn add_client(&self, device: &ObjectPath) -> bool {
        self.clients.update(device, true)
    }

    /// Forgets a connection; false if the device was not connected
    pub fn remove_client(&self, device: &ObjectPath) -> bool {
        self.clients.update(device, false)
    }

    pub fn is_connected(&self, device: &ObjectPath) -> bool {
        self.clients
            .0
            .lock()
            .map(|clients| clients.contains(device))
            .unwrap_or(false)
    }

    pub fn connected_clients(&self) -> Vec<ObjectPath> {
        self.clients
            .0
            .lock()
            .map(|clients| clients.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.clients.0.lock().map(|clients| clients.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.unwatch();
    }
}
