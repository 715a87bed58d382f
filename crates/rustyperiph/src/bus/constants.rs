//! Constants for the bus protocol

// Wire format
pub const LITTLE_ENDIAN: u8 = b'l';
pub const PROTOCOL_VERSION: u8 = 1;

// Header field codes
pub const HEADER_FIELD_PATH: u8 = 1;
pub const HEADER_FIELD_INTERFACE: u8 = 2;
pub const HEADER_FIELD_MEMBER: u8 = 3;
pub const HEADER_FIELD_ERROR_NAME: u8 = 4;
pub const HEADER_FIELD_REPLY_SERIAL: u8 = 5;
pub const HEADER_FIELD_DESTINATION: u8 = 6;
pub const HEADER_FIELD_SENDER: u8 = 7;
pub const HEADER_FIELD_SIGNATURE: u8 = 8;

// Addresses
pub const SYSTEM_BUS_ADDRESS_ENV: &str = "DBUS_SYSTEM_BUS_ADDRESS";
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

// Message bus daemon
pub const DBUS_SERVICE: &str = "org.freedesktop.DBus";
pub const DBUS_PATH: &str = "/org/freedesktop/DBus";
pub const DBUS_INTERFACE: &str = "org.freedesktop.DBus";

// Standard interfaces
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
pub const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
pub const PEER_INTERFACE: &str = "org.freedesktop.DBus.Peer";
pub const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

// Standard error names
pub const DBUS_ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const DBUS_ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";
pub const DBUS_ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
pub const DBUS_ERROR_UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
pub const DBUS_ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const DBUS_ERROR_UNKNOWN_PROPERTY: &str = "org.freedesktop.DBus.Error.UnknownProperty";
pub const DBUS_ERROR_PROPERTY_READ_ONLY: &str = "org.freedesktop.DBus.Error.PropertyReadOnly";
pub const DBUS_ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";

pub const INTROSPECT_DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";
