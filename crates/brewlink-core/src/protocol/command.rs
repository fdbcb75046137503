//! Request parsing and reply classification.
//!
//! A request is `VERB OBJECT [args...]`. The device answers with any number of
//! body lines followed by `VERB OBJECT OK` or `VERB OBJECT NOK`. Status lines
//! may arrive at any point in between and belong to no request.

use std::fmt;

use super::constants::{REPLY_NOK, REPLY_OK, STATUS_PREFIX};

/// A parsed command line.
#[derive(Clone, PartialEq, Eq)]
pub struct Request {
    line: String,
    ok_marker: String,
    nok_marker: String,
}

/// How a received line relates to an outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyLine {
    /// Unsolicited status telemetry.
    Telemetry,
    /// The request succeeded; the exchange is over.
    Ok,
    /// The request was refused; the exchange is over.
    Rejected,
    /// Part of the reply body.
    Body,
}

impl Request {
    /// Parse a command line. Returns `None` unless it has at least a verb and
    /// an object.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let mut words = line.split_whitespace();
        let verb = words.next()?;
        let object = words.next()?;

        Some(Self {
            line: line.to_string(),
            ok_marker: format!("{verb} {object} {REPLY_OK}"),
            nok_marker: format!("{verb} {object} {REPLY_NOK}"),
        })
    }

    /// The line as sent on the wire, without terminator.
    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn ok_marker(&self) -> &str {
        &self.ok_marker
    }

    pub fn nok_marker(&self) -> &str {
        &self.nok_marker
    }

    /// Classify one received line (terminator already stripped).
    pub fn classify(&self, line: &str) -> ReplyLine {
        if line.starts_with(STATUS_PREFIX) {
            ReplyLine::Telemetry
        } else if line.starts_with(&self.ok_marker) {
            ReplyLine::Ok
        } else if line.starts_with(&self.nok_marker) {
            ReplyLine::Rejected
        } else {
            ReplyLine::Body
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Request({:?})", self.line)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_markers() {
        let req = Request::parse("PUT settings a=1,b=2").unwrap();
        assert_eq!(req.line(), "PUT settings a=1,b=2");
        assert_eq!(req.ok_marker(), "PUT settings OK");
        assert_eq!(req.nok_marker(), "PUT settings NOK");
    }

    #[test]
    fn test_parse_rejects_single_word() {
        assert!(Request::parse("GET").is_none());
        assert!(Request::parse("   ").is_none());
    }

    #[test]
    fn test_classify() {
        let req = Request::parse("GET settings").unwrap();
        assert_eq!(
            req.classify("setpoint:98.00, brew-state:idle"),
            ReplyLine::Telemetry
        );
        assert_eq!(req.classify("GET settings OK"), ReplyLine::Ok);
        assert_eq!(req.classify("GET settings NOK bad key"), ReplyLine::Rejected);
        assert_eq!(req.classify("tempOffset=2"), ReplyLine::Body);
        // A reply to some other request is just body text.
        assert_eq!(req.classify("GET info OK"), ReplyLine::Body);
    }
}
