use crate::uuid::Uuid;

// Interfaces
pub const GATT_MANAGER_INTERFACE: &str = "org.bluez.GattManager1";
pub const GATT_SERVICE_INTERFACE: &str = "org.bluez.GattService1";
pub const GATT_CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";
pub const GATT_DESCRIPTOR_INTERFACE: &str = "org.bluez.GattDescriptor1";

// Error names understood by the daemon
pub const BLUEZ_ERROR_FAILED: &str = "org.bluez.Error.Failed";
pub const BLUEZ_ERROR_NOT_READY: &str = "org.bluez.Error.NotReady";
pub const BLUEZ_ERROR_NOT_PERMITTED: &str = "org.bluez.Error.NotPermitted";
pub const BLUEZ_ERROR_NOT_SUPPORTED: &str = "org.bluez.Error.NotSupported";
pub const BLUEZ_ERROR_INVALID_OFFSET: &str = "org.bluez.Error.InvalidOffset";
pub const BLUEZ_ERROR_INVALID_VALUE_LENGTH: &str = "org.bluez.Error.InvalidValueLength";
pub const BLUEZ_ERROR_INVALID_ARGUMENTS: &str = "org.bluez.Error.InvalidArguments";
pub const BLUEZ_ERROR_ALREADY_EXISTS: &str = "org.bluez.Error.AlreadyExists";
pub const BLUEZ_ERROR_DOES_NOT_EXIST: &str = "org.bluez.Error.DoesNotExist";

/// Longest attribute value allowed by the ATT protocol
pub const MAX_ATTRIBUTE_VALUE_LEN: usize = 512;

// Services
pub const DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u16(0x180A);
pub const NORDIC_UART_SERVICE: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);
pub const NORDIC_UART_RX: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);
pub const NORDIC_UART_TX: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);
pub const SERIAL_FFF0_SERVICE: Uuid = Uuid::from_u16(0xFFF0);
pub const SERIAL_FFF0_RX: Uuid = Uuid::from_u16(0xFFE1);
pub const SERIAL_FFF0_TX: Uuid = Uuid::from_u16(0xFFE2);

// Device Information characteristics
pub const MODEL_NUMBER_STRING: Uuid = Uuid::from_u16(0x2A24);
pub const SERIAL_NUMBER_STRING: Uuid = Uuid::from_u16(0x2A25);
pub const FIRMWARE_REVISION_STRING: Uuid = Uuid::from_u16(0x2A26);
pub const HARDWARE_REVISION_STRING: Uuid = Uuid::from_u16(0x2A27);
pub const SOFTWARE_REVISION_STRING: Uuid = Uuid::from_u16(0x2A28);
pub const MANUFACTURER_NAME_STRING: Uuid = Uuid::from_u16(0x2A29);

// Descriptors
pub const CHARACTERISTIC_USER_DESCRIPTION: Uuid = Uuid::from_u16(0x2901);
