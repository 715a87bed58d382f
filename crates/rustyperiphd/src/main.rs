//! rustyperiphd - serial BLE peripheral
//!
//! Publishes a Device Information service and a serial service, advertises
//! them and echoes whatever peers write to RX back on TX.

use clap::Parser;
use log::{debug, error, info, warn};
use rustyperiph::adv::constants::{INCLUDE_APPEARANCE, INCLUDE_TX_POWER};
use rustyperiph::gap::device_address;
use rustyperiph::peripheral::{describe_adapter, describe_capacity, describe_status};
use rustyperiph::{
    AdvertisementType, AdvertisingOptions, Connection, DeviceInfo, ObjectPath, Peripheral,
    PeripheralConfig, PeripheralEvent, SerialProfile,
};
use std::fs::File;
use std::io::{BufRead, ErrorKind, Read};
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

static TERMINATE: AtomicBool = AtomicBool::new(false);
/// Write end of the pipe the signal handler wakes the watcher through
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

#[derive(Parser, Debug)]
#[command(name = "rustyperiphd")]
#[command(about = "BLE serial peripheral for the Bluetooth daemon", long_about = None)]
#[command(version)]
struct Args {
    /// Adapter object path
    #[arg(long, default_value = "/org/bluez/hci0")]
    adapter: String,

    /// Adapter alias and advertised local name
    #[arg(long, default_value = "RK3588_BLE")]
    name: String,

    /// Object path of the GATT application
    #[arg(long, default_value = "/org/bluez/example")]
    app_path: String,

    /// Object path of the advertisement
    #[arg(long, default_value = "/org/bluez/example/advertisement1")]
    adv_path: String,

    /// Whether the adapter accepts pairing
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pairable: bool,

    /// Serial service layout: nus or fff0
    #[arg(long, default_value = "nus")]
    serial_profile: SerialProfile,

    /// Minimum advertising interval in milliseconds
    #[arg(long, default_value_t = 100)]
    min_interval: u16,

    /// Maximum advertising interval in milliseconds
    #[arg(long, default_value_t = 200)]
    max_interval: u16,

    /// Register the advertisement with an empty options map
    #[arg(long)]
    no_adv_options: bool,

    /// Advertisement includes; may be repeated
    #[arg(long = "include")]
    includes: Vec<String>,

    /// Do not echo RX writes on TX
    #[arg(long)]
    no_echo: bool,

    #[arg(long, default_value = "RK3588_BLE")]
    model: String,

    #[arg(long, default_value = "333-12345678-888")]
    serial_number: String,

    #[arg(long, default_value = "1.0.1")]
    firmware: String,

    #[arg(long, default_value = "rev A")]
    hardware: String,

    #[arg(long, default_value = "5.0")]
    software: String,

    #[arg(long, default_value = "ACME Inc.")]
    manufacturer: String,
}

impl Args {
    fn into_config(self) -> PeripheralConfig {
        let advertising_options = if self.no_adv_options {
            AdvertisingOptions::new()
        } else {
            AdvertisingOptions::new()
                .interval(self.min_interval, self.max_interval)
                .advertisement_type(AdvertisementType::Peripheral)
        };
        let includes = if self.includes.is_empty() {
            vec![INCLUDE_TX_POWER.to_string(), INCLUDE_APPEARANCE.to_string()]
        } else {
            self.includes
        };

        PeripheralConfig {
            adapter_path: self.adapter,
            name: self.name,
            app_path: self.app_path,
            adv_path: self.adv_path,
            pairable: self.pairable,
            device_info: DeviceInfo {
                model_number: self.model,
                serial_number: self.serial_number,
                firmware_revision: self.firmware,
                hardware_revision: self.hardware,
                software_revision: self.software,
                manufacturer_name: self.manufacturer,
            },
            serial_profile: self.serial_profile,
            includes,
            advertising_options,
            echo: !self.no_echo,
            ..PeripheralConfig::default()
        }
    }
}

extern "C" fn request_termination(_signal: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = 1u8;
        // SAFETY: write(2) is async-signal-safe and the buffer is live
        unsafe {
            libc::write(fd, (&byte as *const u8).cast(), 1);
        }
    }
}

/// Installs SIGINT and SIGTERM handlers; returns the pipe they write to
fn install_signal_handlers() -> std::io::Result<OwnedFd> {
    let mut fds = [0; 2];
    // SAFETY: fds has room for the two descriptors pipe2 writes
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    // The write end lives as long as the process
    WAKE_FD.store(write.into_raw_fd(), Ordering::SeqCst);

    let handler = request_termination as extern "C" fn(libc::c_int);
    // SAFETY: the handler only touches atomics and calls write(2)
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
    Ok(read)
}

/// Stops the event loop once a termination signal arrived
fn spawn_signal_watcher(conn: Connection, wake: OwnedFd) -> std::io::Result<()> {
    let mut wake = File::from(wake);
    thread::Builder::new()
        .name("signal-watcher".into())
        .spawn(move || {
            let mut byte = [0u8; 1];
            loop {
                match wake.read(&mut byte) {
                    Ok(0) => break,
                    Ok(_) if TERMINATE.load(Ordering::SeqCst) => {
                        info!("Termination requested");
                        conn.stop();
                        break;
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        warn!("Signal pipe read failed: {}", e);
                        break;
                    }
                }
            }
        })?;
    Ok(())
}

fn print_status(peripheral: &Peripheral) {
    match peripheral.advertising_status() {
        Ok(capacity) => {
            println!("Advertising manager:");
            for (key, value) in describe_capacity(&capacity) {
                println!("  {}: {}", key, value);
            }
        }
        Err(e) => warn!("Failed to read advertising manager state: {}", e),
    }
    println!("  Advertisement: {:?}", peripheral.advertisement().state());
    println!("  Application: {:?}", peripheral.application().state());

    println!("Server:");
    for (key, value) in describe_status(&peripheral.status().snapshot()) {
        println!("  {}: {}", key, value);
    }
    let clients = peripheral.clients().connected_clients();
    println!("  Clients: {}", clients.len());
    for device in clients {
        println!("    {}", describe_device(&device));
    }
}

fn describe_device(device: &ObjectPath) -> String {
    device_address(device)
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| device.to_string())
}

/// Reads console commands: `q` quits, `s <text>` sends, `i` prints status
fn spawn_console(conn: Connection, peripheral: Arc<Peripheral>) -> std::io::Result<()> {
    thread::Builder::new().name("console".into()).spawn(move || {
        println!("Commands: q = quit, s <text> = send on TX, i = status");
        for line in std::io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!("Console read failed: {}", e);
                    break;
                }
            };
            let line = line.trim();
            if line == "q" {
                conn.stop();
                break;
            } else if line == "i" {
                print_status(&peripheral);
            } else if let Some(text) = line.strip_prefix("s ") {
                let data = text.as_bytes().to_vec();
                let peripheral = peripheral.clone();
                conn.post(move |_| match peripheral.send(&data) {
                    Ok(true) => info!("Sent {} bytes on TX", data.len()),
                    Ok(false) => println!("Nobody is subscribed to TX"),
                    Err(e) => warn!("Send failed: {}", e),
                });
            } else if !line.is_empty() {
                println!("Unknown command '{}'", line);
            }
        }
        debug!("Console closed");
    })?;
    Ok(())
}

fn on_event(event: PeripheralEvent) {
    match event {
        PeripheralEvent::ApplicationRegistered(Ok(())) => info!("GATT application registered"),
        PeripheralEvent::ApplicationRegistered(Err(e)) => {
            error!("Failed to register application: {}", e)
        }
        PeripheralEvent::AdvertisementRegistered(Ok(())) => info!("Advertisement registered"),
        PeripheralEvent::AdvertisementRegistered(Err(e)) => {
            error!("Failed to register advertisement: {}", e)
        }
        PeripheralEvent::AdvertisementReleased => info!("Advertisement released"),
        PeripheralEvent::DataReceived(data) => {
            println!("Received: {}", String::from_utf8_lossy(&data))
        }
        PeripheralEvent::ClientConnected(device) => {
            println!("Client connected: {}", describe_device(&device))
        }
        PeripheralEvent::ClientDisconnected(device) => {
            println!("Client disconnected: {}", describe_device(&device))
        }
    }
}

fn run(args: Args) -> rustyperiph::Result<()> {
    let config = args.into_config();
    let conn = Connection::system()?;
    info!(
        "Connected to the system bus as {}",
        conn.unique_name().unwrap_or_default()
    );

    let peripheral = Arc::new(Peripheral::new(&conn, config, on_event)?);

    let adapter = peripheral.configure_adapter()?;
    println!("Adapter {}:", peripheral.adapter().path());
    for (key, value) in describe_adapter(&adapter) {
        println!("  {}: {}", key, value);
    }
    print_status(&peripheral);

    peripheral.start()?;

    let wake = install_signal_handlers()?;
    spawn_signal_watcher(conn.clone(), wake)?;
    spawn_console(conn.clone(), peripheral.clone())?;

    let result = conn.run_event_loop();
    if let Err(e) = &result {
        error!("Event loop ended: {}", e);
    }

    if !conn.is_closed() {
        peripheral.shutdown();
        conn.close();
    }
    result
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        error!("{}", e);
        std::process::exit(1);
    }
}
