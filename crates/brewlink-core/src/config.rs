//! Tool configuration.
//!
//! Every wait the core performs is listed in [`Timings`] so tests and unusual
//! hosts can shorten or stretch them. [`ToolConfig`] adds the few remaining
//! knobs and round-trips through TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::constants::DEFAULT_BAUD_RATE;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Wait budgets, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Window for the first status line after connecting.
    pub boot_capture_ms: u64,
    /// Timeout for the `GET info` probe.
    pub info_timeout_ms: u64,
    /// Timeout for settings commands.
    pub command_timeout_ms: u64,
    /// Pause after closing the port before the 1200 baud touch.
    pub release_settle_ms: u64,
    /// Pause after the touch before looking for the bootloader.
    pub reset_settle_ms: u64,
    /// Interval between discovery polls.
    pub discovery_poll_ms: u64,
    /// How long to look for the bootloader after the touch.
    pub bootloader_window_ms: u64,
    /// Pause before handing the port to the programmer.
    pub flash_settle_ms: u64,
    /// Pause for the application firmware to boot after flashing.
    pub reboot_settle_ms: u64,
    /// How long the front-end waits for a device to show up.
    pub connect_window_ms: u64,
    /// Sleep between unsuccessful serial reads.
    pub read_poll_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            boot_capture_ms: 10_000,
            info_timeout_ms: 2_000,
            command_timeout_ms: 5_000,
            release_settle_ms: 1_000,
            reset_settle_ms: 1_000,
            discovery_poll_ms: 500,
            bootloader_window_ms: 10_000,
            flash_settle_ms: 2_000,
            reboot_settle_ms: 4_000,
            connect_window_ms: 30_000,
            read_poll_ms: 1,
        }
    }
}

impl Timings {
    /// Near-zero waits for scripted transports.
    pub fn immediate() -> Self {
        Self {
            boot_capture_ms: 50,
            info_timeout_ms: 20,
            command_timeout_ms: 20,
            release_settle_ms: 0,
            reset_settle_ms: 0,
            discovery_poll_ms: 1,
            bootloader_window_ms: 20,
            flash_settle_ms: 0,
            reboot_settle_ms: 0,
            connect_window_ms: 20,
            read_poll_ms: 0,
        }
    }

    pub fn boot_capture(&self) -> Duration {
        Duration::from_millis(self.boot_capture_ms)
    }

    pub fn info_timeout(&self) -> Duration {
        Duration::from_millis(self.info_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn release_settle(&self) -> Duration {
        Duration::from_millis(self.release_settle_ms)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    pub fn discovery_poll(&self) -> Duration {
        Duration::from_millis(self.discovery_poll_ms)
    }

    pub fn bootloader_window(&self) -> Duration {
        Duration::from_millis(self.bootloader_window_ms)
    }

    pub fn flash_settle(&self) -> Duration {
        Duration::from_millis(self.flash_settle_ms)
    }

    pub fn reboot_settle(&self) -> Duration {
        Duration::from_millis(self.reboot_settle_ms)
    }

    pub fn connect_window(&self) -> Duration {
        Duration::from_millis(self.connect_window_ms)
    }

    pub fn read_poll(&self) -> Duration {
        Duration::from_millis(self.read_poll_ms)
    }
}

/// Configuration for a tool run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Baud rate for regular connections.
    pub baud_rate: u32,
    /// Directory receiving settings backups.
    pub backup_dir: PathBuf,
    /// Programmer executable; looked up next to the binary when unset.
    pub programmer_path: Option<PathBuf>,
    /// Firmware image; looked up next to the binary when unset.
    pub firmware_path: Option<PathBuf>,
    pub timings: Timings,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            backup_dir: PathBuf::from("."),
            programmer_path: None,
            firmware_path: None,
            timings: Timings::default(),
        }
    }
}

impl ToolConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ToolConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ToolConfig = toml::from_str(
            r#"
            baud_rate = 57600

            [timings]
            connect_window_ms = 60000
            "#,
        )
        .unwrap();

        assert_eq!(config.baud_rate, 57_600);
        assert_eq!(config.timings.connect_window(), Duration::from_secs(60));
        assert_eq!(config.timings.discovery_poll(), Duration::from_millis(500));
        assert!(config.programmer_path.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("brewlink.toml");

        let config = ToolConfig {
            programmer_path: Some(PathBuf::from("/opt/bossac/bossac")),
            timings: Timings::immediate(),
            ..Default::default()
        };
        config.save_to_file(&path).unwrap();

        assert_eq!(ToolConfig::load_from_file(&path).unwrap(), config);
    }
}
