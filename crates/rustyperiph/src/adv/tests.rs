use super::constants::*;
use super::*;
use crate::bus::{Connection, ObjectPath, Value};
use crate::error::Error;
use crate::gatt::constants::{DEVICE_INFORMATION_SERVICE, NORDIC_UART_SERVICE};
use crate::testing::{adapter_path, wait_until, FakeBluez, WAIT};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

const AD_PATH: &str = "/org/bluez/example/advertisement1";

fn manager(conn: &Connection) -> AdvertisingManager {
    AdvertisingManager::new(conn, "org.bluez", &adapter_path())
}

fn scenario_advertisement(releases: Arc<AtomicUsize>) -> Advertisement {
    Advertisement::builder(ObjectPath::new(AD_PATH).unwrap())
        .local_name("RK3588_BLE")
        .service_uuids([DEVICE_INFORMATION_SERVICE, NORDIC_UART_SERVICE])
        .includes([INCLUDE_TX_POWER, INCLUDE_APPEARANCE])
        .interval(100, 200)
        .on_release(move || {
            releases.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap()
}

fn register(
    manager: &AdvertisingManager,
    ad: &Advertisement,
    options: &AdvertisingOptions,
) -> crate::error::Result<()> {
    let (tx, rx) = mpsc::channel();
    manager.register(ad, options, move |result| {
        tx.send(result).unwrap();
    })?;
    rx.recv_timeout(WAIT).unwrap()
}

#[test]
fn test_builder_validation() {
    let path = ObjectPath::new(AD_PATH).unwrap();
    let err = Advertisement::builder(path.clone())
        .interval(200, 100)
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = Advertisement::builder(path.clone())
        .service_uuids([NORDIC_UART_SERVICE, NORDIC_UART_SERVICE])
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let ad = Advertisement::builder(path).build().unwrap();
    assert_eq!(ad.state(), AdvertisementState::Created);
    assert_eq!(ad.local_name(), None);
    assert!(ad.service_uuids().is_empty());

    assert!(matches!(
        create_advertisement("no-slash", "x", &[], &[], None),
        Err(Error::Protocol(_))
    ));
}

#[test]
fn test_create_advertisement() {
    let ad = create_advertisement(
        AD_PATH,
        "RK3588_BLE",
        &[DEVICE_INFORMATION_SERVICE],
        &[INCLUDE_TX_POWER],
        Some((100, 200)),
    )
    .unwrap();
    assert_eq!(ad.path().as_str(), AD_PATH);
    assert_eq!(ad.local_name(), Some("RK3588_BLE"));
    assert_eq!(ad.service_uuids(), &[DEVICE_INFORMATION_SERVICE]);
    assert_eq!(ad.includes(), &["tx-power".to_string()]);
}

#[test]
fn test_advertisement_type_names() {
    assert_eq!(AdvertisementType::Peripheral.to_string(), "peripheral");
    assert_eq!(
        "broadcast".parse::<AdvertisementType>().unwrap(),
        AdvertisementType::Broadcast
    );
    assert!("beacon".parse::<AdvertisementType>().is_err());
}

#[test]
fn test_options_map() {
    assert!(AdvertisingOptions::new().is_empty());
    assert!(AdvertisingOptions::new().to_entries().is_empty());

    let options = AdvertisingOptions::new()
        .interval(100, 200)
        .advertisement_type(AdvertisementType::Peripheral);
    assert_eq!(
        options.to_entries(),
        vec![
            (OPTION_MIN_INTERVAL.to_string(), Value::UInt16(100)),
            (OPTION_MAX_INTERVAL.to_string(), Value::UInt16(200)),
            (OPTION_TYPE.to_string(), Value::Str("peripheral".into())),
        ]
    );
}

#[test]
fn test_release_runs_once() {
    let releases = Arc::new(AtomicUsize::new(0));
    let ad = scenario_advertisement(releases.clone());

    assert!(ad.release());
    assert!(!ad.release());
    assert!(!ad.release());
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert_eq!(ad.state(), AdvertisementState::Released);
}

#[test]
fn test_capacity() {
    let (conn, bluez) = FakeBluez::start();
    let _event_loop = conn.enter_event_loop_async().unwrap();
    let manager = manager(&conn);

    let capacity = manager.capacity().unwrap();
    assert_eq!(capacity.active_instances, 0);
    assert_eq!(capacity.supported_instances, 5);
    assert!(capacity
        .supported_includes
        .contains(&INCLUDE_TX_POWER.to_string()));
    assert!(!capacity.is_full());

    bluez.set_supported_instances(0);
    assert_eq!(manager.supported_instances().unwrap(), 0);
    assert!(manager.capacity().unwrap().is_full());
    assert_eq!(manager.supported_includes().unwrap().len(), 3);
}

#[test]
fn test_register_when_full() {
    let (conn, bluez) = FakeBluez::start();
    let _event_loop = conn.enter_event_loop_async().unwrap();
    let manager = manager(&conn);
    bluez.set_supported_instances(0);

    let releases = Arc::new(AtomicUsize::new(0));
    let ad = scenario_advertisement(releases.clone());
    let called = Arc::new(AtomicUsize::new(0));
    let seen = called.clone();
    let err = manager
        .register(&ad, &AdvertisingOptions::new(), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Capacity {
            active: 0,
            supported: 0
        }
    ));
    assert_eq!(bluez.register_advertisement_calls(), 0);
    assert_eq!(ad.state(), AdvertisementState::Created);
    assert!(!conn.is_exported(ad.path()));
    assert_eq!(called.load(Ordering::SeqCst), 0);
    assert_eq!(releases.load(Ordering::SeqCst), 0);
}

#[test]
fn test_register_when_last_instance_taken() {
    let (conn, bluez) = FakeBluez::start();
    let _event_loop = conn.enter_event_loop_async().unwrap();
    let manager = manager(&conn);
    bluez.set_supported_instances(1);

    let first = scenario_advertisement(Arc::new(AtomicUsize::new(0)));
    register(&manager, &first, &AdvertisingOptions::new()).unwrap();
    assert_eq!(bluez.register_advertisement_calls(), 1);
    assert!(manager.capacity().unwrap().is_full());

    let second = Advertisement::builder(
        ObjectPath::new("/org/bluez/example/advertisement2").unwrap(),
    )
    .local_name("second")
    .build()
    .unwrap();
    let called = Arc::new(AtomicUsize::new(0));
    let seen = called.clone();
    let err = manager
        .register(&second, &AdvertisingOptions::new(), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Capacity {
            active: 1,
            supported: 1
        }
    ));
    assert_eq!(bluez.register_advertisement_calls(), 1);
    assert_eq!(second.state(), AdvertisementState::Created);
    assert!(!conn.is_exported(second.path()));
    assert_eq!(called.load(Ordering::SeqCst), 0);
    assert_eq!(first.state(), AdvertisementState::Active);
}

#[test]
fn test_register_scenario() {
    let (conn, bluez) = FakeBluez::start();
    let _event_loop = conn.enter_event_loop_async().unwrap();
    let manager = manager(&conn);
    let ad = scenario_advertisement(Arc::new(AtomicUsize::new(0)));
    let options = AdvertisingOptions::new()
        .interval(100, 200)
        .advertisement_type(AdvertisementType::Peripheral);

    let before = manager.active_instances().unwrap();
    register(&manager, &ad, &options).unwrap();
    assert_eq!(ad.state(), AdvertisementState::Active);
    assert_eq!(manager.active_instances().unwrap(), before + 1);

    let records = bluez.advertisements();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.path.as_str(), AD_PATH);
    assert_eq!(record.option(OPTION_MIN_INTERVAL), Some(&Value::UInt16(100)));
    assert_eq!(record.option(OPTION_MAX_INTERVAL), Some(&Value::UInt16(200)));
    assert_eq!(
        record.option(OPTION_TYPE),
        Some(&Value::Str("peripheral".into()))
    );

    assert_eq!(
        record.property("LocalName"),
        Some(&Value::Str("RK3588_BLE".into()))
    );
    assert_eq!(
        record.property("ServiceUUIDs"),
        Some(&Value::str_array([
            "0000180a-0000-1000-8000-00805f9b34fb",
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e",
        ]))
    );
    assert_eq!(
        record.property("Includes"),
        Some(&Value::str_array(["tx-power", "appearance"]))
    );
    assert_eq!(record.property("MinInterval"), Some(&Value::UInt32(100)));
    assert_eq!(record.property("MaxInterval"), Some(&Value::UInt32(200)));

    // Only a freshly created advertisement can be registered
    assert!(matches!(
        manager.register(&ad, &options, |_| {}),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn test_register_without_options() {
    let (conn, bluez) = FakeBluez::start();
    let _event_loop = conn.enter_event_loop_async().unwrap();
    let manager = manager(&conn);
    let ad = scenario_advertisement(Arc::new(AtomicUsize::new(0)));

    register(&manager, &ad, &AdvertisingOptions::new()).unwrap();
    assert!(bluez.advertisements()[0].options.is_empty());
}

#[test]
fn test_failed_registration_rolls_back() {
    let (conn, bluez) = FakeBluez::start();
    let _event_loop = conn.enter_event_loop_async().unwrap();
    let manager = manager(&conn);
    let releases = Arc::new(AtomicUsize::new(0));
    let ad = scenario_advertisement(releases.clone());
    bluez.fail_next_registration("org.bluez.Error.InvalidArguments", "Bad interval");

    let err = register(&manager, &ad, &AdvertisingOptions::new()).unwrap_err();
    assert_eq!(err.remote_name(), Some("org.bluez.Error.InvalidArguments"));
    assert_eq!(ad.state(), AdvertisementState::Created);
    assert!(!conn.is_exported(ad.path()));
    assert_eq!(releases.load(Ordering::SeqCst), 0);

    // A retry goes through
    register(&manager, &ad, &AdvertisingOptions::new()).unwrap();
    assert_eq!(bluez.register_advertisement_calls(), 2);
}

#[test]
fn test_daemon_release() {
    let (conn, bluez) = FakeBluez::start();
    let _event_loop = conn.enter_event_loop_async().unwrap();
    let manager = manager(&conn);
    let releases = Arc::new(AtomicUsize::new(0));
    let ad = scenario_advertisement(releases.clone());
    register(&manager, &ad, &AdvertisingOptions::new()).unwrap();

    bluez.release_advertisement(ad.path()).unwrap();
    assert_eq!(ad.state(), AdvertisementState::Released);
    assert!(!conn.is_exported(ad.path()));
    assert!(!ad.release());
    assert_eq!(releases.load(Ordering::SeqCst), 1);

    // Released is terminal
    assert!(matches!(
        manager.unregister(&ad, |_| {}),
        Err(Error::InvalidState(_))
    ));
}

#[test]
fn test_unregister() {
    let (conn, bluez) = FakeBluez::start();
    let _event_loop = conn.enter_event_loop_async().unwrap();
    let manager = manager(&conn);
    let releases = Arc::new(AtomicUsize::new(0));
    let ad = scenario_advertisement(releases.clone());

    assert!(matches!(
        manager.unregister(&ad, |_| {}),
        Err(Error::InvalidState(_))
    ));

    register(&manager, &ad, &AdvertisingOptions::new()).unwrap();
    let (tx, rx) = mpsc::channel();
    manager
        .unregister(&ad, move |result| tx.send(result).unwrap())
        .unwrap();
    rx.recv_timeout(WAIT).unwrap().unwrap();

    assert_eq!(ad.state(), AdvertisementState::Released);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert!(bluez.advertisements().is_empty());
    assert_eq!(manager.active_instances().unwrap(), 0);
}

#[test]
fn test_unregister_blocking() {
    let (conn, bluez) = FakeBluez::start();
    let event_loop = conn.enter_event_loop_async().unwrap();
    let manager = manager(&conn);
    let releases = Arc::new(AtomicUsize::new(0));
    let ad = scenario_advertisement(releases.clone());
    register(&manager, &ad, &AdvertisingOptions::new()).unwrap();

    // Works with the application loop stopped
    event_loop.stop().unwrap();
    manager.unregister_blocking(&ad).unwrap();
    assert_eq!(ad.state(), AdvertisementState::Released);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    assert!(bluez.advertisements().is_empty());
    assert!(manager.unregister_blocking(&ad).is_err());
}

#[test]
fn test_disconnect_releases_active_advertisement() {
    let (conn, bluez) = FakeBluez::start();
    let _event_loop = conn.enter_event_loop_async().unwrap();
    let manager = manager(&conn);
    let releases = Arc::new(AtomicUsize::new(0));
    let ad = scenario_advertisement(releases.clone());
    register(&manager, &ad, &AdvertisingOptions::new()).unwrap();

    bluez.disconnect();
    assert!(wait_until(WAIT, || releases.load(Ordering::SeqCst) == 1));
    assert_eq!(ad.state(), AdvertisementState::Released);
    assert!(!ad.release());
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}
