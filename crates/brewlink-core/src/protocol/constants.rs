//! Protocol constants for the controller's USB serial interface.

// ============================================================================
// Device Identification
// ============================================================================

/// Vendor ID reported by the controller board in both modes.
pub const CONTROLLER_VENDOR_ID: u16 = 0x2341;

/// Product ID while the application firmware is running.
pub const APPLICATION_PRODUCT_ID: u16 = 0x8054;

/// Product ID while the board sits in its bootloader.
pub const BOOTLOADER_PRODUCT_ID: u16 = 0x0054;

// ============================================================================
// Serial Line
// ============================================================================

/// Baud rate used for every regular connection.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Opening the application port at this rate and closing it again makes the
/// board restart into its bootloader.
pub const BOOTLOADER_TOUCH_BAUD_RATE: u32 = 1200;

/// Line terminator on the wire.
pub const LINE_TERMINATOR: u8 = b'\n';

// ============================================================================
// Telemetry
// ============================================================================

/// Prefix of the periodic status line. The first one after power-up marks the
/// end of the boot sequence.
pub const STATUS_PREFIX: &str = "setpoint:";

/// Status field carrying the brew state machine.
pub const BREW_STATE_FIELD: &str = "brew-state";

/// Brew state reported by a commissioned machine at rest.
pub const BREW_STATE_IDLE: &str = "idle";

// ============================================================================
// Commands (Host -> Device)
// ============================================================================

pub const CMD_GET_INFO: &str = "GET info";
pub const CMD_GET_SETTINGS: &str = "GET settings";
pub const CMD_PUT_SETTINGS: &str = "PUT settings";

/// Success token following "VERB OBJECT".
pub const REPLY_OK: &str = "OK";
/// Failure token following "VERB OBJECT".
pub const REPLY_NOK: &str = "NOK";

/// Key of the version line in a `GET info` reply.
pub const FIRMWARE_VERSION_KEY: &str = "firmwareVersion";

// ============================================================================
// Firmware Version Markers
// ============================================================================

pub const VERSION_BOOTLOADER: &str = "bootloader";
pub const VERSION_UNKNOWN: &str = "unknown";
/// Firmware predating the command API.
pub const VERSION_LEGACY: &str = "pre-1.6.2";
/// Firmware answering `GET info` without a version line.
pub const VERSION_API_UNVERSIONED: &str = "1.6.2+";

// ============================================================================
// Settings
// ============================================================================

/// Read-only keys that are never sent back to the device.
pub const RESERVED_KEYS: &[&str] = &["crc", "version"];

/// Derived key, only ever present in boot telemetry.
pub const COMMISSIONING_KEY: &str = "commissioningDone";

/// A plausible settings map never has fewer entries than this.
pub const MIN_SETTINGS_COUNT: usize = 12;

// ============================================================================
// Firmware Images
// ============================================================================

/// Anything smaller is not a firmware image.
pub const MIN_IMAGE_SIZE: u64 = 1024;
