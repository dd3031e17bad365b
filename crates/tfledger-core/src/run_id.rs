// ABOUTME: Run identifier generation, validation, and date-partition derivation.
// ABOUTME: IDs embed a UTC timestamp so ordering and storage partition need no record body.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;
use ulid::Ulid;

const PREFIX: &str = "run_";
const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S";
const STAMP_LEN: usize = 15;
const SUFFIX_LEN: usize = 8;

/// Returned when a string does not have the shape of a run identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid run id: {0:?}")]
pub struct InvalidRunId(pub String);

/// A validated run identifier.
///
/// The current shape is `run_<YYYYMMDDTHHMMSS>_<8 hex>`. The older
/// `run_<8 hex>` shape is still accepted but carries no timestamp, so it
/// cannot be partitioned by date.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId {
    raw: String,
    timestamp: Option<DateTime<Utc>>,
}

impl RunId {
    /// Generate a fresh identifier stamped with the current time.
    pub fn generate() -> Self {
        Self::generate_at(Utc::now())
    }

    /// Generate an identifier stamped with the given time (truncated to seconds).
    pub fn generate_at(at: DateTime<Utc>) -> Self {
        let stamp = at.format(STAMP_FORMAT).to_string();
        // Low 32 bits of the ULID's 80 random bits.
        let suffix = (Ulid::new().random() & 0xffff_ffff) as u32;
        let raw = format!("{PREFIX}{stamp}_{suffix:08x}");
        let timestamp = parse_stamp(&stamp);
        Self { raw, timestamp }
    }

    /// Validate a string as a run identifier. No repair is attempted.
    pub fn parse(raw: &str) -> Result<Self, InvalidRunId> {
        let invalid = || InvalidRunId(raw.to_string());
        let rest = raw.strip_prefix(PREFIX).ok_or_else(invalid)?;

        match rest.split_once('_') {
            Some((stamp, suffix)) => {
                if !is_stamp(stamp) || !is_hex_suffix(suffix) {
                    return Err(invalid());
                }
                let timestamp = parse_stamp(stamp).ok_or_else(invalid)?;
                Ok(Self {
                    raw: raw.to_string(),
                    timestamp: Some(timestamp),
                })
            }
            None if is_hex_suffix(rest) => Ok(Self {
                raw: raw.to_string(),
                timestamp: None,
            }),
            None => Err(invalid()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The UTC timestamp embedded in the identifier, if it has one.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// The `YYYY/MM/DD` partition this identifier belongs to, or None for
    /// legacy identifiers that live at the root of the runs namespace.
    pub fn partition(&self) -> Option<String> {
        self.timestamp.map(|ts| ts.format("%Y/%m/%d").to_string())
    }

    /// True for identifiers that predate embedded timestamps.
    pub fn is_legacy(&self) -> bool {
        self.timestamp.is_none()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for RunId {
    type Err = InvalidRunId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for RunId {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

fn is_stamp(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == STAMP_LEN
        && bytes[8] == b'T'
        && bytes[..8].iter().all(u8::is_ascii_digit)
        && bytes[9..].iter().all(u8::is_ascii_digit)
}

fn is_hex_suffix(s: &str) -> bool {
    s.len() == SUFFIX_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}
