//! A ready-made serial peripheral
//!
//! [`Peripheral`] wires the pieces of this crate into the usual device setup:
//! a Device Information service, a serial service with RX and TX
//! characteristics, and one advertisement announcing both. Remote writes to
//! RX are echoed back on TX.

pub mod status;

use crate::adv::constants::{INCLUDE_APPEARANCE, INCLUDE_TX_POWER};
use crate::adv::{
    Advertisement, AdvertisementState, AdvertisementType, AdvertisingCapacity, AdvertisingManager,
    AdvertisingOptions,
};
use crate::bus::{Connection, ObjectPath};
use crate::error::{Error, Result, WriteError};
use crate::gap::constants::{BLUEZ_SERVICE, DEFAULT_ADAPTER_PATH};
use crate::gap::{Adapter, AdapterInfo, ConnectionManager};
use crate::gatt::constants::*;
use crate::gatt::{Application, Characteristic, GattManager, RegistrationState};
use crate::uuid::Uuid;
use log::{debug, info, warn};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use status::{ServerStatus, StatusSnapshot};

pub const DEFAULT_NAME: &str = "RK3588_BLE";
pub const DEFAULT_APP_PATH: &str = "/org/bluez/example";
pub const DEFAULT_ADV_PATH: &str = "/org/bluez/example/advertisement1";

/// Prefix of the reply sent on TX for every accepted RX write
pub const ECHO_PREFIX: &str = "Echo: ";

/// Strings served by the Device Information service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub model_number: String,
    pub serial_number: String,
    pub firmware_revision: String,
    pub hardware_revision: String,
    pub software_revision: String,
    pub manufacturer_name: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            model_number: DEFAULT_NAME.to_string(),
            serial_number: "333-12345678-888".to_string(),
            firmware_revision: "1.0.1".to_string(),
            hardware_revision: "rev A".to_string(),
            software_revision: "5.0".to_string(),
            manufacturer_name: "ACME Inc.".to_string(),
        }
    }
}

impl DeviceInfo {
    fn entries(&self) -> [(Uuid, &str); 6] {
        [
            (MODEL_NUMBER_STRING, &self.model_number),
            (SERIAL_NUMBER_STRING, &self.serial_number),
            (FIRMWARE_REVISION_STRING, &self.firmware_revision),
            (HARDWARE_REVISION_STRING, &self.hardware_revision),
            (SOFTWARE_REVISION_STRING, &self.software_revision),
            (MANUFACTURER_NAME_STRING, &self.manufacturer_name),
        ]
    }
}

/// UUID layout of the serial service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerialProfile {
    /// Nordic UART Service
    #[default]
    NordicUart,
    /// 16-bit `FFF0` service with `FFE1`/`FFE2` characteristics
    Fff0,
}

impl SerialProfile {
    pub fn service_uuid(&self) -> Uuid {
        match self {
            SerialProfile::NordicUart => NORDIC_UART_SERVICE,
            SerialProfile::Fff0 => SERIAL_FFF0_SERVICE,
        }
    }

    pub fn rx_uuid(&self) -> Uuid {
        match self {
            SerialProfile::NordicUart => NORDIC_UART_RX,
            SerialProfile::Fff0 => SERIAL_FFF0_RX,
        }
    }

    pub fn tx_uuid(&self) -> Uuid {
        match self {
            SerialProfile::NordicUart => NORDIC_UART_TX,
            SerialProfile::Fff0 => SERIAL_FFF0_TX,
        }
    }
}

impl fmt::Display for SerialProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerialProfile::NordicUart => f.write_str("nus"),
            SerialProfile::Fff0 => f.write_str("fff0"),
        }
    }
}

impl FromStr for SerialProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nus" => Ok(SerialProfile::NordicUart),
            "fff0" => Ok(SerialProfile::Fff0),
            other => Err(Error::Validation(format!("Unknown serial profile '{}'", other))),
        }
    }
}

/// Everything needed to bring up a [`Peripheral`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralConfig {
    /// Bus name of the Bluetooth daemon
    pub bluez_service: String,
    pub adapter_path: String,
    /// Adapter alias and advertised local name
    pub name: String,
    pub app_path: String,
    pub adv_path: String,
    pub pairable: bool,
    pub device_info: DeviceInfo,
    pub serial_profile: SerialProfile,
    pub includes: Vec<String>,
    pub advertising_options: AdvertisingOptions,
    /// Reply to RX writes with `Echo: <text>` on TX
    pub echo: bool,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            bluez_service: BLUEZ_SERVICE.to_string(),
            adapter_path: DEFAULT_ADAPTER_PATH.to_string(),
            name: DEFAULT_NAME.to_string(),
            app_path: DEFAULT_APP_PATH.to_string(),
            adv_path: DEFAULT_ADV_PATH.to_string(),
            pairable: true,
            device_info: DeviceInfo::default(),
            serial_profile: SerialProfile::default(),
            includes: vec![INCLUDE_TX_POWER.to_string(), INCLUDE_APPEARANCE.to_string()],
            advertising_options: AdvertisingOptions::new()
                .interval(100, 200)
                .advertisement_type(AdvertisementType::Peripheral),
            echo: true,
        }
    }
}

/// Things the peripheral reports back to its owner
#[derive(Debug)]
pub enum PeripheralEvent {
    ApplicationRegistered(Result<()>),
    AdvertisementRegistered(Result<()>),
    AdvertisementReleased,
    /// Payload of an accepted RX write
    DataReceived(Vec<u8>),
    /// A remote device connected, identified by its device object path
    ClientConnected(ObjectPath),
    ClientDisconnected(ObjectPath),
}

type EventHandler = Arc<dyn Fn(PeripheralEvent) + Send + Sync>;

/// Serial peripheral built from a [`PeripheralConfig`]
pub struct Peripheral {
    config: PeripheralConfig,
    conn: Connection,
    adapter: Adapter,
    gatt: GattManager,
    advertising: AdvertisingManager,
    app: Application,
    advertisement: Advertisement,
    rx: Characteristic,
    tx: Characteristic,
    events: EventHandler,
    status: Arc<ServerStatus>,
    clients: ConnectionManager,
}

impl fmt::Debug for Peripheral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peripheral")
            .field("name", &self.config.name)
            .field("app", self.app.path())
            .field("advertisement", self.advertisement.path())
            .finish()
    }
}

fn check_length(data: &[u8]) -> std::result::Result<(), WriteError> {
    if data.is_empty() || data.len() > MAX_ATTRIBUTE_VALUE_LEN {
        return Err(WriteError::InvalidValueLength(data.len()));
    }
    Ok(())
}

/// Checks an RX payload and decodes it as text
///
/// Invalid UTF-8 is replaced rather than refused; a message with nothing
/// but whitespace is rejected.
pub fn decode_message(data: &[u8]) -> std::result::Result<String, WriteError> {
    check_length(data)?;
    let text = String::from_utf8_lossy(data);
    if text.trim().is_empty() {
        return Err(WriteError::Rejected("Empty message".into()));
    }
    Ok(text.into_owned())
}

/// Checks an RX payload and builds the TX echo for it
///
/// Fails when the echo would not fit in a single attribute value.
pub fn echo_reply(data: &[u8]) -> std::result::Result<Vec<u8>, WriteError> {
    let text = decode_message(data)?;
    let reply = format!("{}{}", ECHO_PREFIX, text).into_bytes();
    if reply.len() > MAX_ATTRIBUTE_VALUE_LEN {
        return Err(WriteError::InvalidValueLength(data.len()));
    }
    Ok(reply)
}

/// Handles one RX write; the caller counts the error if this fails
fn receive(
    data: &[u8],
    echo: bool,
    tx: &Characteristic,
    status: &ServerStatus,
    events: &EventHandler,
) -> std::result::Result<(), WriteError> {
    check_length(data)?;
    status.record_message();

    let reply = if echo {
        Some(echo_reply(data)?)
    } else {
        decode_message(data)?;
        None
    };
    info!("RX: {}", String::from_utf8_lossy(data));

    if let Some(reply) = reply {
        match tx.notify(&reply) {
            Ok(true) => debug!("Echoed {} bytes on TX", reply.len()),
            Ok(false) => debug!("Echo dropped: nobody subscribed to TX"),
            Err(e) => return Err(WriteError::Rejected(format!("Failed to echo on TX: {}", e))),
        }
    }
    events(PeripheralEvent::DataReceived(data.to_vec()));
    Ok(())
}

impl Peripheral {
    /// Builds the object tree and proxies; nothing is sent on the bus yet
    pub fn new<F>(conn: &Connection, config: PeripheralConfig, on_event: F) -> Result<Self>
    where
        F: Fn(PeripheralEvent) + Send + Sync + 'static,
    {
        let events: EventHandler = Arc::new(on_event);
        let status = Arc::new(ServerStatus::new());
        let adapter_path = ObjectPath::new(&config.adapter_path)?;

        let app = Application::new(ObjectPath::new(&config.app_path)?);
        let device_info = app.add_service("deviceinfo", DEVICE_INFORMATION_SERVICE)?;
        for (uuid, text) in config.device_info.entries() {
            device_info.add_read_only_string(uuid, text)?;
        }

        let profile = config.serial_profile;
        let serial = app.add_service("serial", profile.service_uuid())?;
        let tx = serial.add_notify_tx(profile.tx_uuid())?;
        tx.add_user_description("TX")?;
        let rx = {
            let tx = tx.clone();
            let events = events.clone();
            let status = status.clone();
            let echo = config.echo;
            serial.add_serial_rx(profile.rx_uuid(), move |data, _options| {
                let result = receive(data, echo, &tx, &status, &events);
                if let Err(e) = &result {
                    warn!("Rejected RX write of {} bytes: {}", data.len(), e);
                    status.record_error();
                }
                result
            })?
        };
        rx.add_user_description("RX")?;

        let advertisement = {
            let events = events.clone();
            Advertisement::builder(ObjectPath::new(&config.adv_path)?)
                .local_name(&config.name)
                .service_uuids([DEVICE_INFORMATION_SERVICE, profile.service_uuid()])
                .includes(config.includes.iter().cloned())
                .on_release(move || events(PeripheralEvent::AdvertisementReleased))
                .build()?
        };

        Ok(Self {
            adapter: Adapter::new(conn, &config.bluez_service, &adapter_path),
            gatt: GattManager::new(conn, &config.bluez_service, &adapter_path),
            advertising: AdvertisingManager::new(conn, &config.bluez_service, &adapter_path),
            conn: conn.clone(),
            config,
            app,
            advertisement,
            rx,
            tx,
            events,
            status,
            clients: ConnectionManager::new(),
        })
    }

    pub fn config(&self) -> &PeripheralConfig {
        &self.config
    }

    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    pub fn application(&self) -> &Application {
        &self.app
    }

    pub fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    pub fn rx(&self) -> &Characteristic {
        &self.rx
    }

    pub fn tx(&self) -> &Characteristic {
        &self.tx
    }

    pub fn status(&self) -> &ServerStatus {
        &self.status
    }

    /// Remote devices currently connected to the adapter
    pub fn clients(&self) -> &ConnectionManager {
        &self.clients
    }

    /// Powers the adapter, applies name and visibility, and reads it back
    pub fn configure_adapter(&self) -> Result<AdapterInfo> {
        self.adapter.configure(&self.config.name, self.config.pairable)?;
        self.adapter.on_properties_changed(|changed| {
            for (name, value) in changed {
                info!("Adapter {} changed to {:?}", name, value.flatten());
            }
        })?;
        self.adapter.info()
    }

    /// Current advertising manager limits
    pub fn advertising_status(&self) -> Result<AdvertisingCapacity> {
        self.advertising.capacity()
    }

    /// Registers the application, then the advertisement
    ///
    /// Both registrations complete on the event loop and are reported as
    /// [`PeripheralEvent`]s. Only transport failures are returned here.
    pub fn start(&self) -> Result<()> {
        self.status.start();
        let events = self.events.clone();
        self.clients
            .watch(&self.conn, &self.config.bluez_service, move |device, connected| {
                events(if connected {
                    PeripheralEvent::ClientConnected(device.clone())
                } else {
                    PeripheralEvent::ClientDisconnected(device.clone())
                })
            })?;

        let events = self.events.clone();
        self.gatt
            .register_application(&self.app, Vec::new(), move |result| {
                events(PeripheralEvent::ApplicationRegistered(result))
            });

        let events = self.events.clone();
        let registered = self.advertising.register(
            &self.advertisement,
            &self.config.advertising_options,
            move |result| events(PeripheralEvent::AdvertisementRegistered(result)),
        );
        match registered {
            Ok(()) => Ok(()),
            Err(e @ Error::Connection(_)) => Err(e),
            Err(e) => {
                (self.events)(PeripheralEvent::AdvertisementRegistered(Err(e)));
                Ok(())
            }
        }
    }

    /// Notifies `data` on TX; returns false if nobody is subscribed
    pub fn send(&self, data: &[u8]) -> Result<bool> {
        self.tx.notify(data)
    }

    /// Unregisters whatever is registered and removes the exported objects
    ///
    /// Blocks for the daemon's replies, so it also works once the event loop
    /// has returned.
    pub fn shutdown(&self) {
        if self.advertisement.state() == AdvertisementState::Active {
            if let Err(e) = self.advertising.unregister_blocking(&self.advertisement) {
                warn!("Failed to unregister advertisement: {}", e);
            }
        }
        self.advertisement.release();

        if self.app.state() == RegistrationState::Registered {
            if let Err(e) = self.gatt.unregister_application_blocking(&self.app) {
                warn!("Failed to unregister application: {}", e);
            }
        }
        self.app.unexport();
        self.clients.unwatch();
        info!("Peripheral '{}' shut down", self.config.name);
    }
}

/// Formats adapter info the way the daemon prints it at startup
pub fn describe_adapter(info: &AdapterInfo) -> Vec<(&'static str, String)> {
    let or_unknown = |v: Option<String>| v.unwrap_or_else(|| "unknown".to_string());
    vec![
        ("Name", info.name.clone()),
        ("Address", or_unknown(info.address.map(|a| a.to_string()))),
        (
            "AddressType",
            or_unknown(info.address_type.map(|t| t.to_string())),
        ),
        ("Powered", info.powered.to_string()),
        ("Discoverable", info.discoverable.to_string()),
        ("Pairable", info.pairable.to_string()),
    ]
}

/// Formats advertising manager limits for display
pub fn describe_capacity(capacity: &AdvertisingCapacity) -> Vec<(&'static str, String)> {
    vec![
        ("ActiveInstances", capacity.active_instances.to_string()),
        ("SupportedInstances", capacity.supported_instances.to_string()),
        ("SupportedIncludes", capacity.supported_includes.join(", ")),
    ]
}

/// Formats the RX counters for display
pub fn describe_status(status: &StatusSnapshot) -> Vec<(&'static str, String)> {
    vec![
        ("Uptime", format!("{}s", status.uptime.as_secs())),
        ("TotalMessages", status.total_messages.to_string()),
        ("Errors", status.error_count.to_string()),
        ("ErrorRate", format!("{:.1}%", status.error_rate * 100.0)),
    ]
}
