//! Core types for the cask partitioned key/value store.
//!
//! This crate provides the foundational types used throughout cask:
//! - The [`Item`] value record and its CAS sequencing
//! - Partition states, key-range configuration and split payloads
//! - Protocol value types (opcodes, statuses, requests, responses)
//! - Per-partition statistics
//! - Bucket settings and memory-only levels
//! - Postcard codec helpers for store-file records

pub mod codec;
pub mod protocol;
pub mod stats;
pub mod types;

// Re-export commonly used types at crate root
pub use codec::{decode, encode, CodecError};
pub use protocol::{OpCode, Request, Response, Status};
pub use stats::PartitionStats;
pub use types::*;
