//! Status telemetry parsing.
//!
//! The controller prints one status line per second once booted:
//!
//! ```text
//! setpoint:98.00, power:70.63, average:67.47, act_temp:85.47, boiler-state:heating, boiler-error:OK, brew-state:idle, weight:-1160.40
//! ```

use std::fmt;

use super::constants::{BREW_STATE_FIELD, BREW_STATE_IDLE, STATUS_PREFIX};

/// One parsed status line, fields kept in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    fields: Vec<(String, String)>,
}

impl StatusLine {
    /// Whether a raw line is status telemetry.
    pub fn is_status(line: &str) -> bool {
        line.starts_with(STATUS_PREFIX)
    }

    /// Parse a status line. Returns `None` for anything else.
    pub fn parse(line: &str) -> Option<Self> {
        if !Self::is_status(line) {
            return None;
        }

        let fields = line
            .split(',')
            .filter_map(|token| {
                let (key, value) = token.trim().split_once(':')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some((key.to_string(), value.trim().to_string()))
            })
            .collect();

        Some(Self { fields })
    }

    /// Value of a field, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn brew_state(&self) -> Option<&str> {
        self.get(BREW_STATE_FIELD)
    }

    /// Boiler setpoint in degrees Celsius.
    pub fn setpoint(&self) -> Option<f32> {
        self.get("setpoint")?.parse().ok()
    }

    /// An idle brew state only occurs after commissioning has been completed.
    pub fn is_idle(&self) -> bool {
        self.brew_state() == Some(BREW_STATE_IDLE)
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k}:{v}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "setpoint:98.00, power:70.63, average:67.47, act_temp:85.47, \
                          boiler-state:heating, boiler-error:OK, brew-state:idle, weight:-1160.40";

    #[test]
    fn test_parse_sample() {
        let status = StatusLine::parse(SAMPLE).unwrap();
        assert_eq!(status.setpoint(), Some(98.0));
        assert_eq!(status.get("boiler-state"), Some("heating"));
        assert_eq!(status.get("weight"), Some("-1160.40"));
        assert!(status.is_idle());
        assert_eq!(status.fields().count(), 8);
    }

    #[test]
    fn test_not_status() {
        assert!(StatusLine::parse("tempOffset=2").is_none());
        assert!(!StatusLine::is_status("GET info OK"));
    }

    #[test]
    fn test_brewing_is_not_idle() {
        let status = StatusLine::parse("setpoint:98.00, brew-state:brewing").unwrap();
        assert!(!status.is_idle());
    }

    #[test]
    fn test_display_normalizes_spacing() {
        let status = StatusLine::parse("setpoint:98.00,brew-state: idle").unwrap();
        assert_eq!(status.to_string(), "setpoint:98.00, brew-state:idle");
    }
}
