//! Device identity and per-connection information.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::protocol::constants::{
    APPLICATION_PRODUCT_ID, BOOTLOADER_PRODUCT_ID, CONTROLLER_VENDOR_ID, FIRMWARE_VERSION_KEY,
    VERSION_API_UNVERSIONED, VERSION_BOOTLOADER, VERSION_LEGACY, VERSION_UNKNOWN,
};
use crate::session::CommandError;

/// What the board is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceMode {
    Application,
    Bootloader,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMode::Application => write!(f, "Application"),
            DeviceMode::Bootloader => write!(f, "Bootloader"),
        }
    }
}

/// USB identity of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub mode: DeviceMode,
}

impl DeviceIdentity {
    /// Map USB IDs to an identity. Returns `None` for foreign devices.
    pub fn from_ids(vendor_id: u16, product_id: u16) -> Option<Self> {
        if vendor_id != CONTROLLER_VENDOR_ID {
            return None;
        }
        let mode = match product_id {
            APPLICATION_PRODUCT_ID => DeviceMode::Application,
            BOOTLOADER_PRODUCT_ID => DeviceMode::Bootloader,
            _ => return None,
        };
        Some(Self {
            vendor_id,
            product_id,
            mode,
        })
    }

    pub fn application() -> Self {
        Self {
            vendor_id: CONTROLLER_VENDOR_ID,
            product_id: APPLICATION_PRODUCT_ID,
            mode: DeviceMode::Application,
        }
    }

    pub fn bootloader() -> Self {
        Self {
            vendor_id: CONTROLLER_VENDOR_ID,
            product_id: BOOTLOADER_PRODUCT_ID,
            mode: DeviceMode::Bootloader,
        }
    }

    pub fn is_bootloader(&self) -> bool {
        self.mode == DeviceMode::Bootloader
    }
}

/// A controller found by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPort {
    /// OS serial device name. May differ between resets of the same board.
    pub port: String,
    pub identity: DeviceIdentity,
}

impl DiscoveredPort {
    pub fn new(port: impl Into<String>, identity: DeviceIdentity) -> Self {
        Self {
            port: port.into(),
            identity,
        }
    }
}

/// Firmware generation as far as the host can tell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareVersion {
    /// Version reported by `GET info`.
    Release(String),
    /// Command API present, no version line.
    ApiUnversioned,
    /// No command API; settings only appear in boot telemetry.
    Legacy,
    Bootloader,
    /// Boot sequence never completed.
    Unknown,
}

impl FirmwareVersion {
    /// Classify the outcome of the `GET info` probe.
    ///
    /// A timeout or refusal is how legacy firmware is recognised: it simply
    /// does not know the command.
    pub fn from_info_reply(reply: &Result<Vec<String>, CommandError>) -> Self {
        match reply {
            Ok(lines) => lines
                .iter()
                .find_map(|line| {
                    line.strip_prefix(FIRMWARE_VERSION_KEY)
                        .and_then(|rest| rest.strip_prefix('='))
                })
                .map(|v| FirmwareVersion::Release(v.trim().to_string()))
                .unwrap_or(FirmwareVersion::ApiUnversioned),
            Err(CommandError::Timeout { .. }) | Err(CommandError::Rejected { .. }) => {
                FirmwareVersion::Legacy
            }
            Err(_) => FirmwareVersion::Unknown,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FirmwareVersion::Release(v) => v,
            FirmwareVersion::ApiUnversioned => VERSION_API_UNVERSIONED,
            FirmwareVersion::Legacy => VERSION_LEGACY,
            FirmwareVersion::Bootloader => VERSION_BOOTLOADER,
            FirmwareVersion::Unknown => VERSION_UNKNOWN,
        }
    }

    /// Whether settings can be exchanged with `GET`/`PUT settings`.
    pub fn supports_api(&self) -> bool {
        matches!(
            self,
            FirmwareVersion::Release(_) | FirmwareVersion::ApiUnversioned
        )
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, FirmwareVersion::Legacy)
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FirmwareVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Snapshot taken at every connection change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub port: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bootloader_mode: bool,
    pub firmware_version: FirmwareVersion,
}

impl DeviceInfo {
    pub fn new(port: &DiscoveredPort, firmware_version: FirmwareVersion) -> Self {
        Self {
            port: port.port.clone(),
            vendor_id: port.identity.vendor_id,
            product_id: port.identity.product_id,
            bootloader_mode: port.identity.is_bootloader(),
            firmware_version,
        }
    }

    pub fn mode(&self) -> DeviceMode {
        if self.bootloader_mode {
            DeviceMode::Bootloader
        } else {
            DeviceMode::Application
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_identity_from_ids() {
        let app = DeviceIdentity::from_ids(0x2341, 0x8054).unwrap();
        assert_eq!(app.mode, DeviceMode::Application);
        let boot = DeviceIdentity::from_ids(0x2341, 0x0054).unwrap();
        assert!(boot.is_bootloader());
        assert!(DeviceIdentity::from_ids(0x2341, 0x1234).is_none());
        assert!(DeviceIdentity::from_ids(0x8086, 0x8054).is_none());
    }

    #[test]
    fn test_classify_reported_version() {
        let reply = Ok(vec![
            "firmwareVersion=1.7.0".to_string(),
            "GET info OK".to_string(),
        ]);
        assert_eq!(
            FirmwareVersion::from_info_reply(&reply),
            FirmwareVersion::Release("1.7.0".into())
        );
    }

    #[test]
    fn test_classify_unversioned_api() {
        let reply = Ok(vec!["GET info OK".to_string()]);
        let version = FirmwareVersion::from_info_reply(&reply);
        assert_eq!(version, FirmwareVersion::ApiUnversioned);
        assert_eq!(version.as_str(), "1.6.2+");
        assert!(version.supports_api());
    }

    #[test]
    fn test_classify_timeout_as_legacy() {
        let reply = Err(CommandError::Timeout {
            request: "GET info".into(),
            timeout: Duration::from_secs(2),
        });
        let version = FirmwareVersion::from_info_reply(&reply);
        assert!(version.is_legacy());
        assert_eq!(version.to_string(), "pre-1.6.2");
        assert!(!version.supports_api());
    }

    #[test]
    fn test_classify_cancel_is_unknown() {
        let reply = Err(CommandError::Cancelled);
        assert_eq!(
            FirmwareVersion::from_info_reply(&reply),
            FirmwareVersion::Unknown
        );
    }

    #[test]
    fn test_info_json() {
        let info = DeviceInfo::new(
            &DiscoveredPort::new("/dev/ttyACM0", DeviceIdentity::application()),
            FirmwareVersion::Release("1.7.0".into()),
        );
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["port"], "/dev/ttyACM0");
        assert_eq!(json["vendor_id"], 0x2341);
        assert_eq!(json["bootloader_mode"], false);
        assert_eq!(json["firmware_version"], "1.7.0");
    }
}
