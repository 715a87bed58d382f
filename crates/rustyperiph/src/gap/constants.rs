// Bluetooth daemon
pub const BLUEZ_SERVICE: &str = "org.bluez";
pub const DEFAULT_ADAPTER_PATH: &str = "/org/bluez/hci0";

// Interfaces
pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";

// Adapter properties
pub const PROP_ADDRESS: &str = "Address";
pub const PROP_ADDRESS_TYPE: &str = "AddressType";
pub const PROP_NAME: &str = "Name";
pub const PROP_ALIAS: &str = "Alias";
pub const PROP_POWERED: &str = "Powered";
pub const PROP_DISCOVERABLE: &str = "Discoverable";
pub const PROP_DISCOVERABLE_TIMEOUT: &str = "DiscoverableTimeout";
pub const PROP_PAIRABLE: &str = "Pairable";

// Device properties
pub const PROP_CONNECTED: &str = "Connected";

// Address types as reported by the daemon
pub const ADDRESS_TYPE_PUBLIC: &str = "public";
pub const ADDRESS_TYPE_RANDOM: &str = "random";
