//! Binary data manipulation utilities for PostgreSQL protocol handling
//!
//! Provides functions for reading and writing binary data with proper endianness
//! handling for network byte order communication with PostgreSQL.

// Type aliases matching PostgreSQL internal types
pub type Xid = u32; // Transaction ID
pub type Oid = u32; // Object ID
pub type TimestampTz = i64; // Timestamp with timezone

/// Specialized function for reading network byte order 64-bit unsigned integers.
///
/// Reads a u64 value from a byte slice in big-endian format.
///
/// # Arguments
/// * `buf` - The byte slice to read from
///
/// # Returns
/// A u64 value read from the buffer
pub fn buf_recv_u64(buf: &[u8]) -> u64 {
    assert!(buf.len() >= 8);
    u64::from_be_bytes(buf[..8].try_into().unwrap())
}

/// Specialized function for reading network byte order 64-bit signed integers.
///
/// Reads an i64 value from a byte slice in big-endian format.
///
/// # Arguments
/// * `buf` - The byte slice to read from
///
/// # Returns
/// An i64 value read from the buffer
pub fn buf_recv_i64(buf: &[u8]) -> i64 {
    assert!(buf.len() >= 8);
    i64::from_be_bytes(buf[..8].try_into().unwrap())
}

/// Specialized functions for writing network byte order 64-bit unsigned integers.
///
/// Writes a u64 value to a mutable byte slice in big-endian format.
///
/// # Arguments
/// * `val` - The u64 value to write
/// * `buf` - The mutable byte slice to write to
pub fn buf_send_u64(val: u64, buf: &mut [u8]) {
    assert!(buf.len() >= 8);
    buf[..8].copy_from_slice(&val.to_be_bytes());
}

/// Specialized functions for writing network byte order 64-bit signed integers.
///
/// Writes an i64 value to a mutable byte slice in big-endian format.
///
/// # Arguments
/// * `val` - The i64 value to write
/// * `buf` - The mutable byte slice to write to
pub fn buf_send_i64(val: i64, buf: &mut [u8]) {
    assert!(buf.len() >= 8);
    buf[..8].copy_from_slice(&val.to_be_bytes());
}
