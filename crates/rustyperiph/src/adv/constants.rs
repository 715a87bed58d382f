// Interfaces
pub const ADVERTISING_MANAGER_INTERFACE: &str = "org.bluez.LEAdvertisingManager1";
pub const ADVERTISEMENT_INTERFACE: &str = "org.bluez.LEAdvertisement1";

// Advertising manager properties
pub const PROP_ACTIVE_INSTANCES: &str = "ActiveInstances";
pub const PROP_SUPPORTED_INSTANCES: &str = "SupportedInstances";
pub const PROP_SUPPORTED_INCLUDES: &str = "SupportedIncludes";

// Registration option keys
pub const OPTION_MIN_INTERVAL: &str = "MinInterval";
pub const OPTION_MAX_INTERVAL: &str = "MaxInterval";
pub const OPTION_TYPE: &str = "Type";

// Include names
pub const INCLUDE_TX_POWER: &str = "tx-power";
pub const INCLUDE_APPEARANCE: &str = "appearance";
pub const INCLUDE_LOCAL_NAME: &str = "local-name";
