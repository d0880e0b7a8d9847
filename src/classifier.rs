//! Response classification.
//!
//! [`classify`] is a pure function: the same command, reply and error-queue
//! reading always produce the same [`Outcome`]. Instrument error conventions
//! live in one table, [`ERROR_PATTERNS`], instead of being scattered across
//! call sites.

use colored::{ColoredString, Colorize};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::fmt;

/// Classified result of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Outcome {
    /// Plausible, non-error reply (or an accepted set-only command)
    Confirmed,
    /// Reply follows the device's error-reporting convention
    InstrumentError,
    /// Nothing arrived before the deadline
    Timeout,
    /// Something arrived but it is not a usable ASCII reply
    Malformed,
}

impl Outcome {
    pub const ALL: [Outcome; 4] = [
        Outcome::Confirmed,
        Outcome::InstrumentError,
        Outcome::Timeout,
        Outcome::Malformed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Confirmed => "CONFIRMED",
            Outcome::InstrumentError => "INSTRUMENT_ERROR",
            Outcome::Timeout => "TIMEOUT",
            Outcome::Malformed => "MALFORMED",
        }
    }

    /// Tag colored the way progress lines show it.
    pub fn colored(&self) -> ColoredString {
        match self {
            Outcome::Confirmed => self.as_str().green(),
            Outcome::Timeout => self.as_str().yellow(),
            Outcome::InstrumentError | Outcome::Malformed => self.as_str().red(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What came back from the transport for one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Payload(Vec<u8>),
    Timeout,
}

/// Named instrument-error convention
pub struct ErrorPattern {
    pub name: &'static str,
    pub regex: Regex,
}

fn pattern(name: &'static str, re: &str) -> ErrorPattern {
    ErrorPattern {
        name,
        regex: Regex::new(re).unwrap(),
    }
}

lazy_static! {
    /// Recognized instrument error replies, checked in order.
    pub static ref ERROR_PATTERNS: Vec<ErrorPattern> = vec![
        // SCPI error queue entry, codes -100 to -499: -113,"Undefined header"
        pattern("scpi-error-queue", r#"^\s*-[1-4]\d{2}\s*,\s*".*"\s*$"#),
        // Same, without the quotes some firmwares drop: -222,Data out of range
        pattern("scpi-error-code", r"^\s*-[1-4]\d{2}\s*,\s*[A-Za-z]"),
        // Bare ERROR / ERR replies
        pattern("error-word", r"(?i)^\s*err(or)?\b"),
        // SCPI error class names echoed as text
        pattern(
            "scpi-error-class",
            r"(?i)\b(command|execution|device[- ]specific|query|syntax|hardware)\s+error\b",
        ),
        pattern(
            "scpi-error-message",
            r"(?i)\b(undefined header|invalid (character|separator|suffix|string data)|header suffix out of range|data out of range|parameter not allowed|missing parameter|query (interrupted|unterminated))\b",
        ),
        pattern("unknown-command", r"(?i)\b(unknown|unrecognized|unsupported) command\b"),
    ];

    /// Empty error queue: `0,"No error"`, `+0,"No error"` or a bare `0`
    static ref RE_NO_ERROR: Regex = Regex::new(r#"(?i)^\s*[+-]?0+\s*(,\s*"?\s*no error\s*"?)?\s*$"#).unwrap();

    /// IEEE 488.2 definite-length binary block header
    static ref RE_BINARY_BLOCK: Regex = Regex::new(r"^#[1-9]").unwrap();
}

/// Name of the first error pattern matching `text`, if any.
pub fn matched_error_pattern(text: &str) -> Option<&'static str> {
    ERROR_PATTERNS
        .iter()
        .find(|p| p.regex.is_match(text))
        .map(|p| p.name)
}

/// True for the device's "no error" sentinel.
pub fn is_no_error(text: &str) -> bool {
    RE_NO_ERROR.is_match(text)
}

fn is_printable_ascii(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .all(|&b| (0x20..0x7f).contains(&b) || matches!(b, b'\r' | b'\n' | b'\t'))
}

/// Classify one probe.
///
/// `error_queue` is the error-queue reading taken after an empty reply; it
/// decides whether silence meant "accepted" or "rejected".
pub fn classify(command: &str, reply: &Reply, error_queue: Option<&str>) -> Outcome {
    let payload = match reply {
        Reply::Timeout => return Outcome::Timeout,
        Reply::Payload(bytes) => bytes,
    };

    let text = match std::str::from_utf8(payload) {
        Ok(text) => text.trim(),
        Err(_) => return Outcome::Malformed,
    };

    if text.is_empty() {
        return match error_queue {
            Some(queue) if is_no_error(queue) => Outcome::Confirmed,
            _ => Outcome::InstrumentError,
        };
    }

    if matched_error_pattern(text).is_some() {
        return Outcome::InstrumentError;
    }

    let is_query = command.contains('?');
    if !is_printable_ascii(text.as_bytes()) || (is_query && RE_BINARY_BLOCK.is_match(text)) {
        return Outcome::Malformed;
    }

    Outcome::Confirmed
}
