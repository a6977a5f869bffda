//! Timestamp conversion utilities for PostgreSQL replication
//!
//! Provides functions for converting between different timestamp formats
//! used by PostgreSQL and standard Unix timestamps.

use crate::utils::binary::TimestampTz;
use chrono::{DateTime, Utc};
use std::time::{SystemTime, UNIX_EPOCH};

// PostgreSQL epoch constants
const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800; // Seconds from Unix epoch (1970) to PostgreSQL epoch (2000)

/// Convert SystemTime to PostgreSQL timestamp format.
///
/// This function converts a standard Unix SystemTime to a PostgreSQL-compatible
/// timestamp by shifting the epoch from Unix (1970-01-01) to PostgreSQL (2000-01-01).
/// The result is in microseconds since the PostgreSQL epoch.
///
/// # Arguments
/// * `time` - The SystemTime to convert
///
/// # Returns
/// A TimestampTz value representing the time in PostgreSQL format
pub fn system_time_to_postgres_timestamp(time: SystemTime) -> TimestampTz {
    let duration_since_unix = time
        .duration_since(UNIX_EPOCH)
        .expect("SystemTime is before Unix epoch");

    let unix_secs = duration_since_unix.as_secs() as i64;
    let unix_micros = unix_secs * 1_000_000 + (duration_since_unix.subsec_micros() as i64);

    // Shift Unix epoch to PostgreSQL epoch
    unix_micros - PG_EPOCH_OFFSET_SECS * 1_000_000
}

/// Render a PostgreSQL timestamp (microseconds since the 2000-01-01 epoch)
/// the way the server prints a `timestamptz` in UTC, e.g.
/// `2024-01-01 00:00:00+00`.
///
/// Sub-second digits are included only when present, matching the server's
/// output style.
pub fn format_pg_timestamp_tz(ts: TimestampTz) -> String {
    let secs = ts.div_euclid(1_000_000) + PG_EPOCH_OFFSET_SECS;
    let micros = ts.rem_euclid(1_000_000);

    let datetime =
        DateTime::from_timestamp(secs, (micros * 1_000) as u32).expect("Invalid timestamp");

    if micros == 0 {
        format!("{}+00", datetime.format("%Y-%m-%d %H:%M:%S"))
    } else {
        format!("{}+00", datetime.format("%Y-%m-%d %H:%M:%S%.6f"))
    }
}

/// Current wall-clock time in the `timestamptz` text form used by the
/// JSON-lines envelope and the SQL stream metadata records.
pub fn now_pg_timestamp_text() -> String {
    let now: DateTime<Utc> = Utc::now();
    if now.timestamp_subsec_micros() == 0 {
        format!("{}+00", now.format("%Y-%m-%d %H:%M:%S"))
    } else {
        format!("{}+00", now.format("%Y-%m-%d %H:%M:%S%.6f"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pg_epoch_renders_as_2000() {
        assert_eq!(format_pg_timestamp_tz(0), "2000-01-01 00:00:00+00");
    }

    #[test]
    fn sub_second_digits_only_when_present() {
        // 2024-01-01 00:00:00 UTC is 757382400 seconds past the PG epoch
        let ts = 757_382_400i64 * 1_000_000;
        assert_eq!(format_pg_timestamp_tz(ts), "2024-01-01 00:00:00+00");
        assert_eq!(
            format_pg_timestamp_tz(ts + 250_000),
            "2024-01-01 00:00:00.250000+00"
        );
    }

    #[test]
    fn system_time_round_trip() {
        let ts = system_time_to_postgres_timestamp(UNIX_EPOCH);
        assert_eq!(ts, -PG_EPOCH_OFFSET_SECS * 1_000_000);
        assert_eq!(format_pg_timestamp_tz(ts), "1970-01-01 00:00:00+00");
    }
}
