//! LSN and WAL-segment arithmetic
//!
//! A log sequence number is a 64-bit position in the source write-ahead log,
//! rendered as two hex 32-bit halves separated by `/` (the PostgreSQL
//! `%X/%X` form). Zero is reserved as the invalid LSN and sorts below every
//! valid position.

use crate::errors::{CdcError, CdcResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Smallest accepted WAL segment size (1 MiB)
pub const WAL_SEG_MIN_SIZE: u64 = 1024 * 1024;
/// Largest accepted WAL segment size (1 GiB)
pub const WAL_SEG_MAX_SIZE: u64 = 1024 * 1024 * 1024;
/// Default WAL segment size (16 MiB)
pub const WAL_SEG_DEFAULT_SIZE: u64 = 16 * 1024 * 1024;

/// A position in the source write-ahead log
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The reserved invalid position
    pub const INVALID: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Number of the WAL segment containing this position
    pub fn segment_number(self, wal_segment_size: u64) -> u64 {
        self.0 / wal_segment_size
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

impl FromStr for Lsn {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| CdcError::parse_with_context("LSN is missing the '/' separator", s))?;
        let hi = u32::from_str_radix(hi, 16)
            .map_err(|_| CdcError::parse_with_context("Invalid LSN high half", s))?;
        let lo = u32::from_str_radix(lo, 16)
            .map_err(|_| CdcError::parse_with_context("Invalid LSN low half", s))?;
        Ok(Lsn(((hi as u64) << 32) | lo as u64))
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Check a WAL segment size: a power of two between 1 MiB and 1 GiB
pub fn wal_segment_size_is_valid(wal_segment_size: u64) -> bool {
    wal_segment_size.is_power_of_two()
        && (WAL_SEG_MIN_SIZE..=WAL_SEG_MAX_SIZE).contains(&wal_segment_size)
}

/// Parse the server's `SHOW wal_segment_size` output (`16MB`, `1GB`, or a
/// plain byte count) into bytes, validating the result.
pub fn parse_wal_segment_size(text: &str) -> CdcResult<u64> {
    let text = text.trim();
    let (digits, unit): (String, String) = {
        let split = text.find(|c: char| !c.is_ascii_digit()).unwrap_or(text.len());
        (text[..split].to_string(), text[split..].trim().to_string())
    };

    let number: u64 = digits
        .parse()
        .map_err(|_| CdcError::parse_with_context("Invalid wal_segment_size", text))?;

    let bytes = match unit.as_str() {
        "" | "B" => number,
        "kB" => number * 1024,
        "MB" => number * 1024 * 1024,
        "GB" => number * 1024 * 1024 * 1024,
        _ => {
            return Err(CdcError::parse_with_context(
                "Unknown wal_segment_size unit",
                text,
            ));
        }
    };

    if !wal_segment_size_is_valid(bytes) {
        return Err(CdcError::parse_with_context(
            "wal_segment_size must be a power of two between 1MB and 1GB",
            text,
        ));
    }

    Ok(bytes)
}

/// Build the canonical 24-hex-digit WAL segment filename from a timeline and
/// a segment number, the way the server names physical segments.
pub fn wal_segment_filename(timeline: u32, segment_number: u64, wal_segment_size: u64) -> String {
    let segments_per_xlogid = 0x1_0000_0000u64 / wal_segment_size;
    format!(
        "{:08X}{:08X}{:08X}",
        timeline,
        segment_number / segments_per_xlogid,
        segment_number % segments_per_xlogid
    )
}
