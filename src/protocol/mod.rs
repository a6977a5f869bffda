//! Protocol module for PostgreSQL replication protocol handling
//!
//! Contains the codecs for the replication COPY BOTH sub-protocol: XLogData
//! and primary keepalive messages read from the server, and the standby
//! status update the receiver sends back as feedback.

pub mod messages;

// Re-export for convenience
pub use messages::{KeepaliveMessage, StandbyStatusUpdateMessage, XLogDataMessage};
