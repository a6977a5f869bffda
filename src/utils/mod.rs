//! Utility functions for PostgreSQL replication
//!
//! This module provides utility functions organized by category:
//! - Binary data manipulation
//! - Timestamp conversion
//! - PostgreSQL connection handling

pub mod binary;
pub mod connection;
pub mod timestamp;

// Re-export for convenience
pub use binary::{
    Oid, TimestampTz, Xid, buf_recv_i64, buf_recv_u64, buf_send_i64, buf_send_u64,
};
pub use connection::{ConnKind, CopyData, PgConnection, PgResult};
pub use timestamp::{
    format_pg_timestamp_tz, now_pg_timestamp_text, system_time_to_postgres_timestamp,
};
