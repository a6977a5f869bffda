//! The CDC stream pipeline
//!
//! Three workers connected by files, a queue, or pipes:
//! - `receive` consumes the replication protocol and buffers JSON lines
//! - `transform` parses those lines and emits prepared-statement SQL
//! - `apply` executes the SQL against the target behind a replication origin
//!
//! `follow` owns their lifecycles and switches between the disk-buffered
//! prefetch/catchup mode and the piped replay mode.

pub mod apply;
pub mod context;
pub mod emit;
pub mod follow;
pub mod parser;
pub mod receive;
pub mod transaction;
pub mod transform;
