//! Controller settings: reading, writing, validation and JSON backups.
//!
//! Settings are flat `key=value` pairs. Firmware with the command API lists
//! them in reply to `GET settings`; legacy firmware only prints them while
//! booting, before the first status line.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use serde_json::Value;
use serde_json::ser::PrettyFormatter;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::protocol::constants::{
    CMD_GET_SETTINGS, CMD_PUT_SETTINGS, COMMISSIONING_KEY, MIN_SETTINGS_COUNT, RESERVED_KEYS,
};
use crate::session::{BootLog, CommandError, DeviceSession};
use crate::transport::Transport;

/// Settings keyed by name. Iteration order is key order.
pub type Settings = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Controller is in bootloader mode, settings are not available")]
    ModeConflict,

    #[error("Legacy firmware: disconnect the controller and plug it in again while the tool waits")]
    NeedsPowerCycle,

    #[error("No settings to write")]
    Empty,

    #[error("Only {count} settings found, expected at least {}", MIN_SETTINGS_COUNT)]
    Invalid { count: usize },

    #[error("Settings file is not a JSON object")]
    NotAnObject,

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parse one `key=value` line. The key is made of word characters, the value
/// is the non-empty remainder and may itself contain `=`.
pub fn parse_setting_line(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let is_word = |c: char| c.is_ascii_alphanumeric() || c == '_';
    if key.is_empty() || value.is_empty() || !key.chars().all(is_word) {
        return None;
    }
    Some((key, value))
}

/// Collect settings from reply or boot lines, stopping at the
/// `GET settings OK` marker.
pub fn parse_setting_lines<S: AsRef<str>>(lines: &[S]) -> Settings {
    let end_marker = format!("{CMD_GET_SETTINGS} OK");
    lines
        .iter()
        .map(AsRef::as_ref)
        .take_while(|line| *line != end_marker)
        .filter_map(parse_setting_line)
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Add `commissioningDone=1` when the boot log shows an idle brew state and
/// the flag is missing. Returns whether it was added.
pub fn derive_commissioning(settings: &mut Settings, boot_log: &BootLog) -> bool {
    if settings.contains_key(COMMISSIONING_KEY) || !boot_log.saw_idle() {
        return false;
    }
    settings.insert(COMMISSIONING_KEY.to_string(), "1".to_string());
    true
}

/// Whether a settings set is complete enough to be trusted.
pub fn validate(settings: &Settings) -> bool {
    settings.len() >= MIN_SETTINGS_COUNT
}

/// [`validate`] as a `Result`.
pub fn ensure_valid(settings: &Settings) -> Result<(), SettingsError> {
    if validate(settings) {
        Ok(())
    } else {
        Err(SettingsError::Invalid {
            count: settings.len(),
        })
    }
}

/// `k=v,k=v` in key order, reserved keys left out. Values are not escaped.
pub fn format_put_payload(settings: &Settings) -> String {
    settings
        .iter()
        .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Read the settings of the connected controller.
///
/// `boot_log` must come from the current connection.
#[instrument(skip_all)]
pub fn read_settings<T: Transport>(
    session: &mut DeviceSession<T>,
    boot_log: &BootLog,
) -> Result<Settings, SettingsError> {
    let Some(info) = session.info() else {
        return Err(CommandError::NotConnected.into());
    };
    if info.bootloader_mode {
        return Err(SettingsError::ModeConflict);
    }

    let mut settings = if info.firmware_version.is_legacy() {
        let settings = parse_setting_lines(boot_log.before_status());
        if settings.is_empty() {
            warn!(lines = boot_log.len(), "No settings in boot output");
            return Err(SettingsError::NeedsPowerCycle);
        }
        debug!(count = settings.len(), "Settings taken from boot output");
        settings
    } else {
        let lines = session.command(CMD_GET_SETTINGS)?;
        parse_setting_lines(&lines)
    };

    if derive_commissioning(&mut settings, boot_log) {
        debug!("Controller is commissioned, added {COMMISSIONING_KEY}=1");
    }
    info!(count = settings.len(), "Settings read");
    Ok(settings)
}

/// Write settings to the connected controller in one `PUT settings`.
#[instrument(skip_all, fields(count = settings.len()))]
pub fn write_settings<T: Transport>(
    session: &mut DeviceSession<T>,
    settings: &Settings,
) -> Result<(), SettingsError> {
    if session.is_bootloader() {
        return Err(SettingsError::ModeConflict);
    }
    let payload = format_put_payload(settings);
    if payload.is_empty() {
        return Err(SettingsError::Empty);
    }

    session.command(&format!("{CMD_PUT_SETTINGS} {payload}"))?;
    info!("Settings written");
    Ok(())
}

/// Render settings as a 4-space indented JSON object with a trailing newline.
pub fn to_json(settings: &Settings) -> Result<String, SettingsError> {
    let mut buf = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    settings.serialize(&mut ser)?;
    buf.push(b'\n');
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Parse a settings document. Non-string values are kept as their JSON text.
pub fn from_json(text: &str) -> Result<Settings, SettingsError> {
    let Value::Object(map) = serde_json::from_str::<Value>(text)? else {
        return Err(SettingsError::NotAnObject);
    };
    Ok(map
        .into_iter()
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, value)
        })
        .collect())
}

pub fn persist(settings: &Settings, path: &Path) -> Result<(), SettingsError> {
    fs::write(path, to_json(settings)?)?;
    info!(path = %path.display(), count = settings.len(), "Settings saved");
    Ok(())
}

pub fn load(path: &Path) -> Result<Settings, SettingsError> {
    let settings = from_json(&fs::read_to_string(path)?)?;
    debug!(path = %path.display(), count = settings.len(), "Settings loaded");
    Ok(settings)
}

/// `settings_YYYYmmdd_HHMMSS.json` for the given local time.
pub fn backup_filename_at(time: NaiveDateTime) -> String {
    time.format("settings_%Y%m%d_%H%M%S.json").to_string()
}

pub fn backup_filename() -> String {
    backup_filename_at(Local::now().naive_local())
}

/// Read, validate and save the controller's settings into `dir`.
///
/// Nothing is written when validation fails.
pub fn backup_settings<T: Transport>(
    session: &mut DeviceSession<T>,
    boot_log: &BootLog,
    dir: &Path,
) -> Result<(PathBuf, Settings), SettingsError> {
    let settings = read_settings(session, boot_log)?;
    ensure_valid(&settings)?;

    let path = dir.join(backup_filename());
    persist(&settings, &path)?;
    Ok((path, settings))
}

/// Load a backup, validate it and write it to the controller.
pub fn restore_from_backup<T: Transport>(
    session: &mut DeviceSession<T>,
    path: &Path,
) -> Result<Settings, SettingsError> {
    let settings = load(path)?;
    ensure_valid(&settings)?;
    write_settings(session, &settings)?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::config::Timings;
    use crate::device::{DeviceIdentity, DiscoveredPort};
    use crate::transport::{MockHandle, MockTransport};

    const STATUS_IDLE: &str = "setpoint:98.00, power:0.00, brew-state:idle";
    const STATUS_HEATING: &str = "setpoint:98.00, power:70.63, brew-state:heating";

    fn sample(count: usize) -> Settings {
        (0..count)
            .map(|i| (format!("key{i:02}"), i.to_string()))
            .collect()
    }

    fn device_store() -> Settings {
        let mut store = sample(12);
        store.insert("crc".into(), "8F2A".into());
        store.insert("version".into(), "7".into());
        store
    }

    fn connected(
        boot: &[&str],
        info_reply: &[&str],
    ) -> (DeviceSession<MockTransport>, MockHandle, BootLog) {
        let mock = MockTransport::new();
        let handle = mock.handle();
        handle.set_present(Some(DiscoveredPort::new(
            "/dev/ttyACM0",
            DeviceIdentity::application(),
        )));
        handle.set_boot_lines(boot.iter().copied());
        if !info_reply.is_empty() {
            handle.set_reply("GET info", info_reply.iter().copied());
        }
        let mut session = DeviceSession::new(mock, Timings::immediate(), CancelToken::new());
        let conn = session.connect().unwrap();
        (session, handle, conn.boot_log)
    }

    #[test]
    fn test_parse_setting_line() {
        assert_eq!(parse_setting_line("tempOffset=2"), Some(("tempOffset", "2")));
        assert_eq!(parse_setting_line("wifi_ssid=a=b"), Some(("wifi_ssid", "a=b")));
        assert_eq!(parse_setting_line("bad key=1"), None);
        assert_eq!(parse_setting_line("empty="), None);
        assert_eq!(parse_setting_line("=1"), None);
        assert_eq!(parse_setting_line("no separator"), None);
    }

    #[test]
    fn test_parse_lines_stop_at_ok() {
        let lines = ["a=1", "b=2", "GET settings OK", "c=3"];
        let settings = parse_setting_lines(&lines);
        assert_eq!(settings.len(), 2);
        assert_eq!(settings["b"], "2");
    }

    #[test]
    fn test_validate_boundaries() {
        assert!(!validate(&Settings::new()));
        assert!(!validate(&sample(11)));
        assert!(validate(&sample(12)));
        assert!(matches!(
            ensure_valid(&sample(11)),
            Err(SettingsError::Invalid { count: 11 })
        ));
    }

    #[test]
    fn test_commissioning_only_when_absent() {
        let idle = BootLog::new(vec![STATUS_IDLE.into()]);
        let mut settings = sample(2);
        assert!(derive_commissioning(&mut settings, &idle));
        assert_eq!(settings[COMMISSIONING_KEY], "1");

        let mut existing = sample(2);
        existing.insert(COMMISSIONING_KEY.into(), "0".into());
        assert!(!derive_commissioning(&mut existing, &idle));
        assert_eq!(existing[COMMISSIONING_KEY], "0");

        let heating = BootLog::new(vec![STATUS_HEATING.into()]);
        let mut fresh = sample(2);
        assert!(!derive_commissioning(&mut fresh, &heating));
        assert!(!fresh.contains_key(COMMISSIONING_KEY));
    }

    #[test]
    fn test_put_payload_skips_reserved_keys() {
        let mut settings = Settings::new();
        settings.insert("version".into(), "7".into());
        settings.insert("b".into(), "2".into());
        settings.insert("crc".into(), "1".into());
        settings.insert("a".into(), "1".into());
        assert_eq!(format_put_payload(&settings), "a=1,b=2");
    }

    #[test]
    fn test_device_round_trip() {
        let (mut session, handle, boot_log) = connected(
            &[STATUS_IDLE],
            &["firmwareVersion=1.7.0", "GET info OK"],
        );
        handle.set_settings(device_store());

        let first = read_settings(&mut session, &boot_log).unwrap();
        assert_eq!(first.len(), 15);
        assert_eq!(first[COMMISSIONING_KEY], "1");

        write_settings(&mut session, &first).unwrap();
        let put = handle.writes().last().unwrap().clone();
        assert!(put.starts_with("PUT settings commissioningDone=1,key00=0,"));
        assert!(!put.contains("crc="));
        assert!(!put.contains("version="));

        let second = read_settings(&mut session, &boot_log).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_legacy_reads_boot_output() {
        let (mut session, _handle, boot_log) = connected(
            &["Booting", "tempOffset=2", "brewTemp=98", STATUS_IDLE],
            &[],
        );

        let settings = read_settings(&mut session, &boot_log).unwrap();
        assert_eq!(settings["tempOffset"], "2");
        assert_eq!(settings["brewTemp"], "98");
        assert_eq!(settings[COMMISSIONING_KEY], "1");
    }

    #[test]
    fn test_legacy_without_boot_output_needs_power_cycle() {
        let (mut session, _handle, boot_log) = connected(&[STATUS_HEATING], &[]);
        assert!(session.info().unwrap().firmware_version.is_legacy());

        let err = read_settings(&mut session, &BootLog::default()).unwrap_err();
        assert!(matches!(err, SettingsError::NeedsPowerCycle));
        let err = read_settings(&mut session, &boot_log).unwrap_err();
        assert!(matches!(err, SettingsError::NeedsPowerCycle));
    }

    #[test]
    fn test_bootloader_is_mode_conflict() {
        let mock = MockTransport::new();
        mock.handle().set_present(Some(DiscoveredPort::new(
            "/dev/ttyACM1",
            DeviceIdentity::bootloader(),
        )));
        let mut session = DeviceSession::new(mock, Timings::immediate(), CancelToken::new());
        let conn = session.connect().unwrap();

        assert!(matches!(
            read_settings(&mut session, &conn.boot_log),
            Err(SettingsError::ModeConflict)
        ));
        assert!(matches!(
            write_settings(&mut session, &sample(12)),
            Err(SettingsError::ModeConflict)
        ));
    }

    #[test]
    fn test_write_only_reserved_is_empty() {
        let (mut session, handle, _) = connected(&[STATUS_IDLE], &["GET info OK"]);
        let before = handle.writes().len();

        let mut settings = Settings::new();
        settings.insert("crc".into(), "1".into());
        assert!(matches!(
            write_settings(&mut session, &settings),
            Err(SettingsError::Empty)
        ));
        assert_eq!(handle.writes().len(), before);
    }

    #[test]
    fn test_write_rejected() {
        let (mut session, handle, _) = connected(&[STATUS_IDLE], &["GET info OK"]);
        handle.set_reply("PUT settings", ["PUT settings NOK"]);

        let err = write_settings(&mut session, &sample(12)).unwrap_err();
        assert!(matches!(
            err,
            SettingsError::Command(CommandError::Rejected { .. })
        ));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = device_store();

        persist(&settings, &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("{\n    \"crc\": \"8F2A\",\n"));
        assert!(text.ends_with("}\n"));

        assert_eq!(load(&path).unwrap(), settings);
    }

    #[test]
    fn test_load_coerces_non_strings() {
        let settings = from_json(r#"{"a": 1, "b": true, "c": "x", "d": 1.5}"#).unwrap();
        assert_eq!(settings["a"], "1");
        assert_eq!(settings["b"], "true");
        assert_eq!(settings["c"], "x");
        assert_eq!(settings["d"], "1.5");

        assert!(matches!(from_json("[1, 2]"), Err(SettingsError::NotAnObject)));
        assert!(matches!(from_json("{"), Err(SettingsError::Json(_))));
    }

    #[test]
    fn test_backup_filename() {
        let time = NaiveDateTime::parse_from_str("2024-03-05 07:08:09", "%Y-%m-%d %H:%M:%S")
            .unwrap();
        assert_eq!(backup_filename_at(time), "settings_20240305_070809.json");
    }

    #[test]
    fn test_backup_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, handle, boot_log) =
            connected(&[STATUS_IDLE], &["GET info OK"]);
        handle.set_settings(device_store());

        let (path, saved) = backup_settings(&mut session, &boot_log, dir.path()).unwrap();
        assert!(path.starts_with(dir.path()));
        assert_eq!(load(&path).unwrap(), saved);

        handle.set_settings(Settings::new());
        restore_from_backup(&mut session, &path).unwrap();
        let store = handle.settings().unwrap();
        assert_eq!(store.len(), 13);
        assert!(!store.contains_key("crc"));
    }

    #[test]
    fn test_backup_refuses_incomplete_settings() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, handle, boot_log) =
            connected(&[STATUS_HEATING], &["GET info OK"]);
        handle.set_settings(sample(5));

        let err = backup_settings(&mut session, &boot_log, dir.path()).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { count: 5 }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
