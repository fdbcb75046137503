//! brewlink-core: support tooling for espresso-machine controllers on USB serial.
//!
//! This crate finds a controller on the USB bus, talks to it over its line
//! based command protocol, backs up and restores its settings and drives a
//! firmware upgrade through the board's bootloader.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, request/reply classification, status lines
//! - **Transport**: Serial line abstraction plus USB discovery (serialport, mock)
//! - **State**: Session state machine
//! - **Session**: Connect, command exchange, bootloader transition
//! - **Settings**: Read/write/validate settings, JSON backups
//! - **Firmware**: Image checks and the external programmer
//! - **Upgrade**: Backup, flash and restore orchestrator
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use brewlink_core::{CancelToken, DeviceSession, ToolConfig, settings};
//!
//! let config = ToolConfig::default();
//! let mut session = DeviceSession::serial(&config, CancelToken::new());
//! let conn = session.wait_for_device().expect("no controller");
//! let current = settings::read_settings(&mut session, &conn.boot_log).expect("read failed");
//! println!("{} settings", current.len());
//! ```

pub mod cancel;
pub mod config;
pub mod device;
pub mod events;
pub mod firmware;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod state;
pub mod transport;
pub mod upgrade;

// Re-exports for convenience
pub use cancel::CancelToken;
pub use config::{ConfigError, Timings, ToolConfig};
pub use device::{DeviceIdentity, DeviceInfo, DeviceMode, DiscoveredPort, FirmwareVersion};
pub use events::{NullObserver, TracingObserver, UpgradeEvent, UpgradeObserver, UpgradeStep};
pub use firmware::{BossacProgrammer, FirmwareImage, FirmwareProgrammer, ImageError, ProgramError};
pub use protocol::{Request, StatusLine};
pub use session::{BootLog, CommandError, ConnectError, Connection, DeviceSession};
pub use settings::{Settings, SettingsError};
pub use state::SessionState;
pub use transport::{MockTransport, SerialTransport, Transport};
pub use upgrade::{Consent, FirmwareUpgrade, UpgradeError, UpgradeOutcome, UpgradePlan};
