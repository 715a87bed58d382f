//! In-process stand-in for the Bluetooth daemon
//!
//! [`FakeBluez`] serves `Adapter1`, `GattManager1` and
//! `LEAdvertisingManager1` on one end of a socket pair, speaking the real
//! wire protocol. Like the daemon it calls back into the application:
//! `GetManagedObjects` on registration and `GetAll` on advertisements.

use crate::adv::constants::*;
use crate::bus::constants::*;
use crate::bus::{
    Connection, EventLoopThread, Interface, Message, MessageType, MethodCall, ObjectPath,
    SignalMatch, Value,
};
use crate::error::{MethodError, Result};
use crate::gap::constants::*;
use crate::gatt::constants::*;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub(crate) const WAIT: Duration = Duration::from_secs(5);

/// Polls `cond` until it holds or `timeout` passes
pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub(crate) fn adapter_path() -> ObjectPath {
    ObjectPath::new(DEFAULT_ADAPTER_PATH).unwrap()
}

/// Path the daemon uses for the device with address `addr`
pub(crate) fn device_path(addr: &str) -> ObjectPath {
    adapter_path()
        .child(&format!("dev_{}", addr.replace(':', "_")))
        .unwrap()
}

/// An object the fake learned about through `GetManagedObjects`
#[derive(Debug, Clone)]
pub(crate) struct ManagedObject {
    pub path: ObjectPath,
    pub interfaces: Vec<(String, Vec<(String, Value)>)>,
}

impl ManagedObject {
    pub fn property(&self, interface: &str, name: &str) -> Option<&Value> {
        self.interfaces
            .iter()
            .find(|(i, _)| i == interface)
            .and_then(|(_, props)| props.iter().find(|(n, _)| n == name))
            .map(|(_, v)| v)
    }

    pub fn implements(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|(i, _)| i == interface)
    }
}

/// A registered advertisement as seen by the fake
#[derive(Debug, Clone)]
pub(crate) struct AdvertisementRecord {
    pub path: ObjectPath,
    pub options: Vec<(String, Value)>,
    pub properties: Vec<(String, Value)>,
}

impl AdvertisementRecord {
    pub fn option(&self, name: &str) -> Option<&Value> {
        self.options.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

#[derive(Default)]
struct FakeState {
    adapter: Mutex<Vec<(String, Value)>>,
    applications: Mutex<Vec<(ObjectPath, Vec<ManagedObject>)>>,
    advertisements: Mutex<Vec<AdvertisementRecord>>,
    supported_instances: AtomicU8,
    register_application_calls: AtomicUsize,
    register_advertisement_calls: AtomicUsize,
    fail_next_registration: Mutex<Option<MethodError>>,
    signals: Mutex<Vec<Message>>,
    /// Index of the first signal `wait_for_change` has not consumed
    signal_cursor: Mutex<usize>,
}

impl FakeState {
    fn take_failure(&self) -> Option<MethodError> {
        self.fail_next_registration.lock().unwrap().take()
    }
}

fn path_arg(call: &MethodCall<'_>) -> std::result::Result<ObjectPath, MethodError> {
    call.arg(0)?
        .as_object_path()
        .cloned()
        .ok_or_else(|| MethodError::new(BLUEZ_ERROR_INVALID_ARGUMENTS, "Expected object path"))
}

fn remote(error: crate::error::Error) -> MethodError {
    MethodError::new(BLUEZ_ERROR_FAILED, error.to_string())
}

struct FakeAdapter(Arc<FakeState>);

impl Interface for FakeAdapter {
    fn name(&self) -> &str {
        ADAPTER_INTERFACE
    }

    fn call(&self, call: &MethodCall<'_>) -> std::result::Result<Vec<Value>, MethodError> {
        Err(crate::bus::object::unknown_method(ADAPTER_INTERFACE, call.member()))
    }

    fn properties(&self) -> Vec<(String, Value)> {
        self.0.adapter.lock().unwrap().clone()
    }

    fn set_property(&self, name: &str, value: &Value) -> std::result::Result<(), MethodError> {
        let mut props = self.0.adapter.lock().unwrap();
        let slot = props
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| MethodError::new(DBUS_ERROR_UNKNOWN_PROPERTY, name))?;
        if name == PROP_ADDRESS || name == PROP_ADDRESS_TYPE || name == PROP_NAME {
            return Err(MethodError::new(DBUS_ERROR_PROPERTY_READ_ONLY, name));
        }
        if slot.1.signature() != value.signature() {
            return Err(MethodError::new(DBUS_ERROR_INVALID_ARGS, name));
        }
        slot.1 = value.clone();
        Ok(())
    }
}

struct FakeGattManager(Arc<FakeState>);

impl Interface for FakeGattManager {
    fn name(&self) -> &str {
        GATT_MANAGER_INTERFACE
    }

    fn call(&self, call: &MethodCall<'_>) -> std::result::Result<Vec<Value>, MethodError> {
        match call.member() {
            "RegisterApplication" => {
                self.0.register_application_calls.fetch_add(1, Ordering::SeqCst);
                let path = path_arg(call)?;
                if let Some(e) = self.0.take_failure() {
                    return Err(e);
                }
                if self.0.applications.lock().unwrap().iter().any(|(p, _)| *p == path) {
                    return Err(MethodError::new(
                        BLUEZ_ERROR_ALREADY_EXISTS,
                        "Already Exists",
                    ));
                }

                let reply = call
                    .connection
                    .call_method(Message::method_call(
                        None,
                        &path,
                        OBJECT_MANAGER_INTERFACE,
                        "GetManagedObjects",
                        Vec::new(),
                    ))
                    .map_err(remote)?;
                let objects = parse_managed_objects(reply.body.first());
                if !objects.iter().any(|o| o.implements(GATT_SERVICE_INTERFACE)) {
                    return Err(MethodError::new(BLUEZ_ERROR_FAILED, "No object received"));
                }
                self.0.applications.lock().unwrap().push((path, objects));
                Ok(Vec::new())
            }
            "UnregisterApplication" => {
                let path = path_arg(call)?;
                let mut apps = self.0.applications.lock().unwrap();
                let before = apps.len();
                apps.retain(|(p, _)| *p != path);
                if apps.len() == before {
                    return Err(MethodError::new(BLUEZ_ERROR_DOES_NOT_EXIST, "Does Not Exist"));
                }
                Ok(Vec::new())
            }
            other => Err(crate::bus::object::unknown_method(GATT_MANAGER_INTERFACE, other)),
        }
    }

    fn properties(&self) -> Vec<(String, Value)> {
        Vec::new()
    }
}

fn parse_managed_objects(value: Option<&Value>) -> Vec<ManagedObject> {
    let Some(entries) = value.and_then(Value::as_dict) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|(path, interfaces)| {
            let path = path.as_object_path()?.clone();
            let interfaces = interfaces
                .as_dict()?
                .iter()
                .filter_map(|(name, props)| {
                    Some((name.as_str()?.to_string(), props.to_property_list()?))
                })
                .collect();
            Some(ManagedObject { path, interfaces })
        })
        .collect()
}

struct FakeAdvertisingManager(Arc<FakeState>);

impl Interface for FakeAdvertisingManager {
    fn name(&self) -> &str {
        ADVERTISING_MANAGER_INTERFACE
    }

    fn call(&self, call: &MethodCall<'_>) -> std::result::Result<Vec<Value>, MethodError> {
        match call.member() {
            "RegisterAdvertisement" => {
                self.0.register_advertisement_calls.fetch_add(1, Ordering::SeqCst);
                let path = path_arg(call)?;
                let options = call.arg(1)?.to_property_list().unwrap_or_default();
                if let Some(e) = self.0.take_failure() {
                    return Err(e);
                }
                {
                    let ads = self.0.advertisements.lock().unwrap();
                    if ads.iter().any(|a| a.path == path) {
                        return Err(MethodError::new(BLUEZ_ERROR_ALREADY_EXISTS, "Already Exists"));
                    }
                    if ads.len() >= usize::from(self.0.supported_instances.load(Ordering::SeqCst)) {
                        return Err(MethodError::new(
                            BLUEZ_ERROR_NOT_PERMITTED,
                            "Maximum advertisements reached",
                        ));
                    }
                }

                let reply = call
                    .connection
                    .call_method(Message::method_call(
                        None,
                        &path,
                        PROPERTIES_INTERFACE,
                        "GetAll",
                        vec![Value::Str(ADVERTISEMENT_INTERFACE.to_string())],
                    ))
                    .map_err(remote)?;
                let properties = reply
                    .body
                    .first()
                    .and_then(Value::to_property_list)
                    .unwrap_or_default();
                self.0.advertisements.lock().unwrap().push(AdvertisementRecord {
                    path,
                    options,
                    properties,
                });
                Ok(Vec::new())
            }
            "UnregisterAdvertisement" => {
                let path = path_arg(call)?;
                let mut ads = self.0.advertisements.lock().unwrap();
                let before = ads.len();
                ads.retain(|a| a.path != path);
                if ads.len() == before {
                    return Err(MethodError::new(BLUEZ_ERROR_DOES_NOT_EXIST, "Does Not Exist"));
                }
                Ok(Vec::new())
            }
            other => Err(crate::bus::object::unknown_method(
                ADVERTISING_MANAGER_INTERFACE,
                other,
            )),
        }
    }

    fn properties(&self) -> Vec<(String, Value)> {
        let active = self.0.advertisements.lock().unwrap().len() as u8;
        vec![
            (PROP_ACTIVE_INSTANCES.to_string(), Value::Byte(active)),
            (
                PROP_SUPPORTED_INSTANCES.to_string(),
                Value::Byte(self.0.supported_instances.load(Ordering::SeqCst)),
            ),
            (
                PROP_SUPPORTED_INCLUDES.to_string(),
                Value::str_array([INCLUDE_TX_POWER, INCLUDE_APPEARANCE, INCLUDE_LOCAL_NAME]),
            ),
        ]
    }
}

/// The fake daemon; its event loop runs until the value is dropped
pub(crate) struct FakeBluez {
    conn: Connection,
    state: Arc<FakeState>,
    event_loop: Option<EventLoopThread>,
}

impl FakeBluez {
    /// Returns the application's end of a fresh socket pair and the fake on the other
    pub fn start() -> (Connection, FakeBluez) {
        let (app_end, bluez_end) = UnixStream::pair().unwrap();
        let app = Connection::from_stream(app_end).unwrap();
        let conn = Connection::from_stream(bluez_end).unwrap();

        let state = Arc::new(FakeState {
            adapter: Mutex::new(vec![
                (PROP_ADDRESS.to_string(), Value::Str("00:1A:7D:DA:71:13".into())),
                (PROP_ADDRESS_TYPE.to_string(), Value::Str(ADDRESS_TYPE_PUBLIC.into())),
                (PROP_NAME.to_string(), Value::Str("rk3588".into())),
                (PROP_ALIAS.to_string(), Value::Str("rk3588".into())),
                (PROP_POWERED.to_string(), Value::Bool(false)),
                (PROP_DISCOVERABLE.to_string(), Value::Bool(false)),
                (PROP_DISCOVERABLE_TIMEOUT.to_string(), Value::UInt32(180)),
                (PROP_PAIRABLE.to_string(), Value::Bool(false)),
            ]),
            supported_instances: AtomicU8::new(5),
            ..FakeState::default()
        });

        conn.export_object(
            &adapter_path(),
            vec![
                Arc::new(FakeAdapter(state.clone())) as Arc<dyn Interface>,
                Arc::new(FakeGattManager(state.clone())),
                Arc::new(FakeAdvertisingManager(state.clone())),
            ],
        )
        .unwrap();

        let signals = state.clone();
        conn.subscribe_signal(SignalMatch::new(), move |msg| {
            signals.signals.lock().unwrap().push(msg.clone());
        })
        .unwrap();

        let event_loop = conn.enter_event_loop_async().unwrap();
        (
            app,
            FakeBluez {
                conn,
                state,
                event_loop: Some(event_loop),
            },
        )
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn set_supported_instances(&self, count: u8) {
        self.state.supported_instances.store(count, Ordering::SeqCst);
    }

    /// Makes the next registration call fail with `name`
    pub fn fail_next_registration(&self, name: &str, message: &str) {
        *self.state.fail_next_registration.lock().unwrap() = Some(MethodError::new(name, message));
    }

    pub fn adapter_property(&self, name: &str) -> Option<Value> {
        self.state
            .adapter
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    /// Changes an adapter property and announces it, as the daemon would
    pub fn change_adapter_property(&self, name: &str, value: Value) {
        FakeAdapter(self.state.clone())
            .set_property(name, &value)
            .unwrap();
        self.conn
            .emit_properties_changed(&adapter_path(), ADAPTER_INTERFACE, vec![(name.to_string(), value)])
            .unwrap();
    }

    /// Announces a device link coming up or going down
    pub fn set_device_connected(&self, device: &ObjectPath, connected: bool) {
        self.conn
            .emit_properties_changed(
                device,
                DEVICE_INTERFACE,
                vec![(PROP_CONNECTED.to_string(), Value::Bool(connected))],
            )
            .unwrap();
    }

    pub fn register_application_calls(&self) -> usize {
        self.state.register_application_calls.load(Ordering::SeqCst)
    }

    pub fn register_advertisement_calls(&self) -> usize {
        self.state.register_advertisement_calls.load(Ordering::SeqCst)
    }

    pub fn applications(&self) -> Vec<ObjectPath> {
        self.state
            .applications
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Objects reported by the application registered at `app`
    pub fn managed_objects(&self, app: &ObjectPath) -> Vec<ManagedObject> {
        self.state
            .applications
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| p == app)
            .map(|(_, objects)| objects.clone())
            .unwrap_or_default()
    }

    pub fn advertisements(&self) -> Vec<AdvertisementRecord> {
        self.state.advertisements.lock().unwrap().clone()
    }

    /// Signals received from the application
    pub fn signals(&self) -> Vec<Message> {
        self.state.signals.lock().unwrap().clone()
    }

    pub fn clear_signals(&self) {
        let mut signals = self.state.signals.lock().unwrap();
        signals.clear();
        *self.state.signal_cursor.lock().unwrap() = 0;
    }

    /// Waits for the next `PropertiesChanged` on `path` carrying `property`
    ///
    /// Changes are consumed in arrival order, so a second call only sees
    /// signals emitted after the one the first call returned.
    pub fn wait_for_change(&self, path: &ObjectPath, property: &str) -> Option<Value> {
        let mut found = None;
        wait_until(WAIT, || {
            let signals = self.state.signals.lock().unwrap();
            let mut cursor = self.state.signal_cursor.lock().unwrap();
            let start = (*cursor).min(signals.len());
            for (index, msg) in signals.iter().enumerate().skip(start) {
                if msg.message_type != MessageType::Signal
                    || msg.path.as_ref() != Some(path)
                    || msg.member() != "PropertiesChanged"
                {
                    continue;
                }
                if let Some(value) = msg.body.get(1).and_then(|changed| changed.dict_get(property)) {
                    found = Some(value.clone());
                    *cursor = index + 1;
                    return true;
                }
            }
            false
        });
        found
    }

    /// Calls a method on an object exported by the application
    pub fn call(
        &self,
        path: &ObjectPath,
        interface: &str,
        member: &str,
        args: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let reply = self
            .conn
            .call_method(Message::method_call(None, path, interface, member, args))?;
        Ok(reply.body)
    }

    pub fn read_value(&self, path: &ObjectPath, offset: u16) -> Result<Vec<u8>> {
        let options = if offset == 0 {
            Vec::new()
        } else {
            vec![("offset".to_string(), Value::UInt16(offset))]
        };
        let body = self.call(
            path,
            GATT_CHARACTERISTIC_INTERFACE,
            "ReadValue",
            vec![Value::property_map(options)],
        )?;
        Ok(body.first().and_then(Value::as_bytes).unwrap_or_default())
    }

    pub fn write_value(&self, path: &ObjectPath, data: &[u8]) -> Result<()> {
        self.write_value_with(path, data, Vec::new())
    }

    pub fn write_value_with(
        &self,
        path: &ObjectPath,
        data: &[u8],
        options: Vec<(String, Value)>,
    ) -> Result<()> {
        self.call(
            path,
            GATT_CHARACTERISTIC_INTERFACE,
            "WriteValue",
            vec![Value::bytes(data), Value::property_map(options)],
        )?;
        Ok(())
    }

    pub fn start_notify(&self, path: &ObjectPath) -> Result<()> {
        self.call(path, GATT_CHARACTERISTIC_INTERFACE, "StartNotify", Vec::new())?;
        Ok(())
    }

    pub fn stop_notify(&self, path: &ObjectPath) -> Result<()> {
        self.call(path, GATT_CHARACTERISTIC_INTERFACE, "StopNotify", Vec::new())?;
        Ok(())
    }

    /// Releases an advertisement the way the daemon does when it drops one
    pub fn release_advertisement(&self, path: &ObjectPath) -> Result<()> {
        self.state
            .advertisements
            .lock()
            .unwrap()
            .retain(|a| a.path != *path);
        self.call(path, ADVERTISEMENT_INTERFACE, "Release", Vec::new())?;
        Ok(())
    }

    /// Stops the fake and closes its end of the socket
    pub fn disconnect(mut self) {
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.stop().unwrap();
        }
        self.conn.close();
    }
}

impl Drop for FakeBluez {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.take() {
            let _ = event_loop.stop();
        }
    }
}
