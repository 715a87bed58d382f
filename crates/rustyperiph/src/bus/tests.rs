//! Unit tests for the bus transport

use super::auth::{authenticate, BusAddress};
use super::codec::{Decoder, Encoder};
use super::connection::POLL_INTERVAL;
use super::constants::*;
use super::*;
use crate::error::{ConnectionError, Error, MethodError, ProtocolError};
use crate::testing::{wait_until, WAIT};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const COUNTER_INTERFACE: &str = "com.example.Counter";

const COUNTER_METHODS: &[MethodSpec] = &[
    MethodSpec {
        name: "Increment",
        inputs: "u",
        outputs: "u",
    },
    MethodSpec {
        name: "Echo",
        inputs: "",
        outputs: "",
    },
];

#[derive(Default)]
struct Counter {
    count: AtomicU32,
    label: Mutex<String>,
}

impl Interface for Counter {
    fn name(&self) -> &str {
        COUNTER_INTERFACE
    }

    fn call(&self, call: &MethodCall<'_>) -> Result<Vec<Value>, MethodError> {
        match call.member() {
            "Increment" => {
                let step = call.arg(0)?.as_u32().unwrap_or(0);
                let count = self.count.fetch_add(step, Ordering::SeqCst) + step;
                Ok(vec![Value::UInt32(count)])
            }
            "Echo" => Ok(call.args().to_vec()),
            other => Err(object::unknown_method(COUNTER_INTERFACE, other)),
        }
    }

    fn properties(&self) -> Vec<(String, Value)> {
        vec![
            ("Count".to_string(), Value::UInt32(self.count.load(Ordering::SeqCst))),
            ("Label".to_string(), Value::Str(self.label.lock().unwrap().clone())),
        ]
    }

    fn set_property(&self, name: &str, value: &Value) -> Result<(), MethodError> {
        match (name, value.as_str()) {
            ("Label", Some(label)) => {
                *self.label.lock().unwrap() = label.to_string();
                Ok(())
            }
            ("Label", None) => Err(MethodError::new(DBUS_ERROR_INVALID_ARGS, "Label is a string")),
            _ => Err(MethodError::new(DBUS_ERROR_PROPERTY_READ_ONLY, name)),
        }
    }

    fn methods(&self) -> &[MethodSpec] {
        COUNTER_METHODS
    }
}

fn counter_path() -> ObjectPath {
    ObjectPath::new("/com/example/counter").unwrap()
}

/// A client connection and a serving peer with a `Counter` exported
fn serving_pair() -> (Connection, Connection, EventLoopThread) {
    let (a, b) = UnixStream::pair().unwrap();
    let client = Connection::from_stream(a).unwrap();
    let server = Connection::from_stream(b).unwrap();
    server
        .export_object(&counter_path(), vec![Arc::new(Counter::default()) as Arc<dyn Interface>])
        .unwrap();
    let event_loop = server.enter_event_loop_async().unwrap();
    (client, server, event_loop)
}

fn counter_call(member: &str, body: Vec<Value>) -> Message {
    Message::method_call(None, &counter_path(), COUNTER_INTERFACE, member, body)
}

#[test]
fn test_signature_parsing() {
    assert_eq!(
        Type::parse_single("a{sv}").unwrap(),
        Type::Array(Box::new(Type::DictEntry(
            Box::new(Type::Str),
            Box::new(Type::Variant)
        )))
    );
    assert_eq!(Type::parse_signature("oa{sv}").unwrap().len(), 2);
    assert_eq!(
        Type::parse_single("(ybs)").unwrap(),
        Type::Struct(vec![Type::Byte, Type::Bool, Type::Str])
    );

    // Dict keys must be basic, arrays need an element type
    assert!(Type::parse_signature("a{vs}").is_err());
    assert!(Type::parse_signature("a").is_err());
    assert!(Type::parse_signature("(").is_err());
    assert!(Type::parse_single("ss").is_err());
}

#[test]
fn test_encode_string_and_padding() {
    let mut enc = Encoder::new();
    enc.write_value(&Value::Str("abc".into())).unwrap();
    assert_eq!(enc.into_bytes(), vec![3, 0, 0, 0, b'a', b'b', b'c', 0]);

    let mut enc = Encoder::new();
    enc.write_u8(1);
    enc.write_value(&Value::UInt32(0x0102_0304)).unwrap();
    assert_eq!(enc.into_bytes(), vec![1, 0, 0, 0, 4, 3, 2, 1]);

    // Empty array of 8-byte elements still pads to the element boundary
    let mut enc = Encoder::new();
    enc.write_u8(7);
    enc.write_value(&Value::Array(Type::UInt64, Vec::new())).unwrap();
    assert_eq!(enc.into_bytes(), vec![7, 0, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn test_array_element_type_mismatch() {
    let mut enc = Encoder::new();
    let mixed = Value::Array(Type::Byte, vec![Value::Byte(1), Value::UInt16(2)]);
    assert!(matches!(
        enc.write_value(&mixed),
        Err(ProtocolError::UnexpectedSignature { .. })
    ));
}

#[test]
fn test_decode_property_map() {
    let props = Value::property_map(vec![
        ("Powered".to_string(), Value::Bool(true)),
        ("Alias".to_string(), Value::Str("RK3588_BLE".into())),
        ("UUIDs".to_string(), Value::str_array(["180a", "fff0"])),
    ]);
    let mut enc = Encoder::new();
    enc.write_u8(0xff);
    enc.write_value(&props).unwrap();
    let bytes = enc.into_bytes();

    let mut dec = Decoder::at(&bytes, 1);
    let decoded = dec.read_value(&props.value_type()).unwrap();
    assert!(dec.is_empty());
    assert_eq!(decoded, props);
    assert_eq!(decoded.dict_get("Powered"), Some(&Value::Bool(true)));
    assert_eq!(
        decoded.dict_get("UUIDs").and_then(Value::as_str_array),
        Some(vec!["180a".to_string(), "fff0".to_string()])
    );
}

#[test]
fn test_decoder_rejects_truncated_and_oversized_arrays() {
    let mut dec = Decoder::new(&[5, 0, 0]);
    assert_eq!(dec.read_value(&Type::UInt32), Err(ProtocolError::Truncated));

    // Array claims 100 bytes but only 4 follow
    let bytes = [100, 0, 0, 0, 1, 2, 3, 4];
    let mut dec = Decoder::new(&bytes);
    assert!(dec.read_value(&Type::Array(Box::new(Type::Byte))).is_err());
}

#[test]
fn test_message_encode_decode() {
    let mut msg = Message::method_call(
        Some("org.bluez"),
        &ObjectPath::new("/org/bluez/hci0").unwrap(),
        "org.bluez.GattManager1",
        "RegisterApplication",
        vec![
            Value::ObjectPath(ObjectPath::new("/org/bluez/example").unwrap()),
            Value::property_map(Vec::new()),
        ],
    );
    msg.serial = 7;
    let bytes = msg.encode().unwrap();

    assert_eq!(bytes[0], b'l');
    assert_eq!(bytes[1], 1);
    assert_eq!(Message::frame_length(&bytes).unwrap(), Some(bytes.len()));
    assert_eq!(Message::frame_length(&bytes[..10]).unwrap(), None);

    let decoded = Message::decode(&bytes).unwrap();
    assert_eq!(decoded, msg);
    assert_eq!(decoded.signature(), "oa{sv}");
    assert!(decoded.expects_reply());
    assert!(decoded.check_signature("oa{sv}").is_ok());
    assert!(decoded.check_signature("o").is_err());
}

#[test]
fn test_message_decode_errors() {
    let mut msg = Message::signal(&ObjectPath::root(), "com.example.Test", "Tick", Vec::new());
    assert!(msg.encode().is_err(), "serial must be assigned");
    msg.serial = 1;
    let mut bytes = msg.encode().unwrap();

    assert_eq!(
        Message::decode(&bytes[..bytes.len() - 1]),
        Err(ProtocolError::Truncated)
    );
    bytes[0] = b'B';
    assert_eq!(Message::decode(&bytes), Err(ProtocolError::ByteOrder(b'B')));
}

#[test]
fn test_error_reply_round_trip() {
    let mut call = counter_call("Increment", vec![Value::UInt32(1)]);
    call.serial = 3;
    call.sender = Some(":1.42".into());
    let mut reply = Message::error(&call, &MethodError::new("org.bluez.Error.Failed", "boom"));
    reply.serial = 9;

    let decoded = Message::decode(&reply.encode().unwrap()).unwrap();
    assert_eq!(decoded.message_type, MessageType::Error);
    assert_eq!(decoded.reply_serial, Some(3));
    assert_eq!(decoded.destination.as_deref(), Some(":1.42"));
    assert_eq!(
        decoded.to_method_error(),
        MethodError::new("org.bluez.Error.Failed", "boom")
    );
}

#[test]
fn test_object_path_validation() {
    for valid in ["/", "/org/bluez", "/org/bluez/hci0", "/a_b/C9"] {
        assert!(ObjectPath::new(valid).is_ok(), "{} should be valid", valid);
    }
    for invalid in ["", "org/bluez", "/org/", "/org//bluez", "/org-bluez", "/org.bluez"] {
        assert!(ObjectPath::new(invalid).is_err(), "{} should be invalid", invalid);
    }

    let app = ObjectPath::new("/org/bluez/example").unwrap();
    let service = app.child("serial").unwrap();
    assert_eq!(service.as_str(), "/org/bluez/example/serial");
    assert!(service.is_descendant_of(&app));
    assert!(!app.is_descendant_of(&app));
    assert!(!ObjectPath::new("/org/bluez/example2").unwrap().is_descendant_of(&app));
    assert!(app.is_descendant_of(&ObjectPath::root()));
    assert!(app.child("bad/child").is_err());
    assert!(app.child("").is_err());
    assert!(app.child("/serial").is_err());
    assert_eq!(ObjectPath::root().child("org").unwrap().as_str(), "/org");
}

#[test]
fn test_bus_address_parsing() {
    assert_eq!(
        BusAddress::parse("unix:path=/run/dbus/system_bus_socket").unwrap(),
        BusAddress::UnixPath(PathBuf::from("/run/dbus/system_bus_socket"))
    );
    assert_eq!(
        BusAddress::parse("tcp:host=localhost,port=1;unix:abstract=/tmp/dbus%2dtest,guid=1").unwrap(),
        BusAddress::UnixAbstract("/tmp/dbus-test".into())
    );
    assert!(matches!(
        BusAddress::parse("tcp:host=localhost,port=1"),
        Err(ConnectionError::Address(_))
    ));
    assert!(BusAddress::parse("unix:path=/tmp/bad%2").is_err());
}

#[test]
fn test_signal_match() {
    let path = ObjectPath::new("/org/bluez/hci0").unwrap();
    let rule = SignalMatch::new()
        .sender("org.bluez")
        .path(&path)
        .interface(PROPERTIES_INTERFACE)
        .member("PropertiesChanged");
    assert_eq!(
        rule.rule(),
        "type='signal',sender='org.bluez',path='/org/bluez/hci0',\
         interface='org.freedesktop.DBus.Properties',member='PropertiesChanged'"
    );

    let mut signal = Message::signal(&path, PROPERTIES_INTERFACE, "PropertiesChanged", Vec::new());
    signal.sender = Some(":1.7".into());
    assert!(rule.matches(&signal));

    let other = Message::signal(&counter_path(), PROPERTIES_INTERFACE, "PropertiesChanged", Vec::new());
    assert!(!rule.matches(&other));
    assert!(!rule.matches(&counter_call("Increment", Vec::new())));
}

#[test]
fn test_authenticate_external() {
    let (mut client, server) = UnixStream::pair().unwrap();
    let handle = thread::spawn(move || {
        let mut reader = BufReader::new(server.try_clone().unwrap());
        let mut nul = [0u8; 1];
        reader.read_exact(&mut nul).unwrap();
        assert_eq!(nul[0], 0);

        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let uid_hex = line.trim_end().strip_prefix("AUTH EXTERNAL ").unwrap().to_string();
        let mut writer = server;
        writer.write_all(b"OK 0123456789abcdef\r\n").unwrap();

        let mut begin = String::new();
        reader.read_line(&mut begin).unwrap();
        (uid_hex, begin)
    });

    let guid = authenticate(&mut client).unwrap();
    assert_eq!(guid, "0123456789abcdef");

    let (uid_hex, begin) = handle.join().unwrap();
    let uid = String::from_utf8(hex::decode(uid_hex).unwrap()).unwrap();
    assert_eq!(uid, unsafe { libc::getuid() }.to_string());
    assert_eq!(begin, "BEGIN\r\n");
}

#[test]
fn test_authenticate_rejected() {
    let (mut client, mut server) = UnixStream::pair().unwrap();
    server.write_all(b"REJECTED EXTERNAL\r\n").unwrap();
    assert!(matches!(
        authenticate(&mut client),
        Err(ConnectionError::Auth(reply)) if reply == "REJECTED EXTERNAL"
    ));
}

#[test]
fn test_method_call_between_peers() {
    let (client, _server, _event_loop) = serving_pair();

    let reply = client
        .call_method(counter_call("Increment", vec![Value::UInt32(5)]))
        .unwrap();
    assert_eq!(reply.message_type, MessageType::MethodReturn);
    assert_eq!(reply.body, vec![Value::UInt32(5)]);

    let reply = client
        .call_method(counter_call("Increment", vec![Value::UInt32(2)]))
        .unwrap();
    assert_eq!(reply.body, vec![Value::UInt32(7)]);

    let echoed = client
        .call_method(counter_call(
            "Echo",
            vec![Value::Str("hi".into()), Value::bytes(&[1, 2, 3])],
        ))
        .unwrap();
    assert_eq!(echoed.body, vec![Value::Str("hi".into()), Value::bytes(&[1, 2, 3])]);
}

#[test]
fn test_method_call_without_interface() {
    let (client, _server, _event_loop) = serving_pair();

    let mut msg = counter_call("Increment", vec![Value::UInt32(3)]);
    msg.interface = None;
    let reply = client.call_method(msg).unwrap();
    assert_eq!(reply.body, vec![Value::UInt32(3)]);
}

#[test]
fn test_async_call_reply_callback() {
    let (client, _server, _event_loop) = serving_pair();
    let _client_loop = client.enter_event_loop_async().unwrap();

    let (tx, rx) = mpsc::channel();
    client.call_method_async(
        counter_call("Increment", vec![Value::UInt32(4)]),
        Box::new(move |reply| {
            tx.send(reply.map(|m| m.body)).unwrap();
        }),
    );
    let body = rx.recv_timeout(WAIT).unwrap().unwrap();
    assert_eq!(body, vec![Value::UInt32(4)]);
}

#[test]
fn test_error_replies() {
    let (client, _server, _event_loop) = serving_pair();

    let err = client
        .call_method(counter_call("Decrement", Vec::new()))
        .unwrap_err();
    assert_eq!(err.remote_name(), Some(DBUS_ERROR_UNKNOWN_METHOD));

    let err = client
        .call_method(Message::method_call(
            None,
            &ObjectPath::new("/com/example/missing").unwrap(),
            COUNTER_INTERFACE,
            "Increment",
            Vec::new(),
        ))
        .unwrap_err();
    assert_eq!(err.remote_name(), Some(DBUS_ERROR_UNKNOWN_OBJECT));

    let err = client
        .call_method(Message::method_call(
            None,
            &counter_path(),
            "com.example.Missing",
            "Increment",
            Vec::new(),
        ))
        .unwrap_err();
    assert_eq!(err.remote_name(), Some(DBUS_ERROR_UNKNOWN_INTERFACE));

    // Missing argument
    let err = client
        .call_method(counter_call("Increment", Vec::new()))
        .unwrap_err();
    assert_eq!(err.remote_name(), Some(DBUS_ERROR_INVALID_ARGS));
}

#[test]
fn test_peer_ping_and_introspection() {
    let (client, _server, _event_loop) = serving_pair();

    client
        .call_method(Message::method_call(
            None,
            &counter_path(),
            PEER_INTERFACE,
            "Ping",
            Vec::new(),
        ))
        .unwrap();

    let introspect = |path: &str| {
        let reply = client
            .call_method(Message::method_call(
                None,
                &ObjectPath::new(path).unwrap(),
                INTROSPECTABLE_INTERFACE,
                "Introspect",
                Vec::new(),
            ))
            .unwrap();
        reply.body[0].as_str().unwrap().to_string()
    };

    let parent = introspect("/com/example");
    assert!(parent.starts_with(INTROSPECT_DOCTYPE));
    assert!(parent.contains("<node name=\"counter\"/>"));

    let xml = introspect("/com/example/counter");
    assert!(xml.contains("<interface name=\"com.example.Counter\">"));
    assert!(xml.contains("<method name=\"Increment\">"));
    assert!(xml.contains("<arg type=\"u\" direction=\"in\"/>"));
    assert!(xml.contains("<property name=\"Label\" type=\"s\" access=\"read\"/>"));
}

#[test]
fn test_properties_through_proxy() {
    let (client, _server, _event_loop) = serving_pair();
    let proxy = Proxy::new(&client, "com.example", &counter_path(), COUNTER_INTERFACE);

    proxy.call("Increment", vec![Value::UInt32(9)]).unwrap();
    assert_eq!(proxy.get("Count").unwrap(), Value::UInt32(9));

    proxy.set("Label", Value::Str("kitchen".into())).unwrap();
    let all = proxy.get_all().unwrap();
    assert!(all.contains(&("Label".to_string(), Value::Str("kitchen".into()))));

    let err = proxy.set("Count", Value::UInt32(1)).unwrap_err();
    assert_eq!(err.remote_name(), Some(DBUS_ERROR_PROPERTY_READ_ONLY));
    let err = proxy.get("Missing").unwrap_err();
    assert_eq!(err.remote_name(), Some(DBUS_ERROR_UNKNOWN_PROPERTY));
}

#[test]
fn test_properties_changed_signal() {
    let (client, _server, _event_loop) = serving_pair();
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = received.clone();
    let id = client
        .subscribe_signal(
            SignalMatch::new()
                .path(&counter_path())
                .interface(PROPERTIES_INTERFACE)
                .member("PropertiesChanged"),
            move |msg| sink.lock().unwrap().push(msg.body.clone()),
        )
        .unwrap();
    let _client_loop = client.enter_event_loop_async().unwrap();

    let proxy = Proxy::new(&client, "com.example", &counter_path(), COUNTER_INTERFACE);
    proxy.set("Label", Value::Str("porch".into())).unwrap();

    assert!(wait_until(WAIT, || !received.lock().unwrap().is_empty()));
    let body = received.lock().unwrap()[0].clone();
    assert_eq!(body[0], Value::Str(COUNTER_INTERFACE.into()));
    assert_eq!(body[1].dict_get("Label"), Some(&Value::Str("porch".into())));

    assert!(client.unsubscribe_signal(id));
    assert!(!client.unsubscribe_signal(id));
}

#[test]
fn test_export_and_unexport() {
    let (a, _b) = UnixStream::pair().unwrap();
    let conn = Connection::from_stream(a).unwrap();
    let counter = Arc::new(Counter::default()) as Arc<dyn Interface>;

    conn.export_object(&counter_path(), vec![counter.clone()]).unwrap();
    assert!(conn.is_exported(&counter_path()));
    assert!(matches!(
        conn.export_object(&counter_path(), vec![counter]),
        Err(Error::Validation(_))
    ));
    assert!(conn.unexport_object(&counter_path()));
    assert!(!conn.unexport_object(&counter_path()));
    assert!(!conn.is_exported(&counter_path()));
}

#[test]
fn test_disconnect_fails_pending_calls() {
    let (a, b) = UnixStream::pair().unwrap();
    let client = Connection::from_stream(a).unwrap();
    let hooks = Arc::new(AtomicUsize::new(0));
    let counted = hooks.clone();
    client.on_disconnect(move || {
        counted.fetch_add(1, Ordering::SeqCst);
    });
    let removed = client.on_disconnect(|| panic!("removed hook must not run"));
    client.remove_disconnect_hook(removed);
    let client_loop = client.enter_event_loop_async().unwrap();

    let (tx, rx) = mpsc::channel();
    client.call_method_async(
        counter_call("Increment", vec![Value::UInt32(1)]),
        Box::new(move |reply| {
            tx.send(reply).unwrap();
        }),
    );

    // The peer goes away without answering
    drop(b);
    let reply = rx.recv_timeout(WAIT).unwrap();
    assert!(matches!(reply, Err(Error::Connection(ConnectionError::Closed))));
    assert!(wait_until(WAIT, || hooks.load(Ordering::SeqCst) == 1));
    assert!(client.is_closed());

    client.close();
    assert_eq!(hooks.load(Ordering::SeqCst), 1);
    assert!(client_loop.stop().is_err());

    // Calls on a closed connection fail immediately
    let err = client
        .call_method(counter_call("Increment", Vec::new()))
        .unwrap_err();
    assert!(matches!(err, Error::Connection(ConnectionError::Closed)));
}

#[test]
fn test_call_timeout_reports_no_reply() {
    let (a, _silent_peer) = UnixStream::pair().unwrap();
    let client = Connection::from_stream(a).unwrap();
    client.set_call_timeout(Duration::from_millis(200));

    let err = client
        .call_method(counter_call("Increment", vec![Value::UInt32(1)]))
        .unwrap_err();
    assert_eq!(err.remote_name(), Some(DBUS_ERROR_NO_REPLY));
}

#[test]
fn test_posted_tasks_run_on_loop() {
    let (client, _server, _event_loop) = serving_pair();
    let client_loop = client.enter_event_loop_async().unwrap();

    let (tx, rx) = mpsc::channel();
    client.post(move |conn| {
        tx.send(conn.is_closed()).unwrap();
    });
    assert!(!rx.recv_timeout(WAIT).unwrap());
    client_loop.stop().unwrap();
}

#[test]
fn test_idle_loop_wakes_promptly() {
    let (client, _server, _event_loop) = serving_pair();
    let mut elapsed = Duration::ZERO;
    for _ in 0..3 {
        let client_loop = client.enter_event_loop_async().unwrap();
        // Let the loop block with nothing to read
        thread::sleep(Duration::from_millis(20));

        let (tx, rx) = mpsc::channel();
        let posted = Instant::now();
        client.post(move |_| tx.send(()).unwrap());
        rx.recv_timeout(WAIT).unwrap();
        elapsed += posted.elapsed();

        let stopping = Instant::now();
        client_loop.stop().unwrap();
        elapsed += stopping.elapsed();
    }
    assert!(elapsed < POLL_INTERVAL, "idle loop took {:?} to react", elapsed);
}
