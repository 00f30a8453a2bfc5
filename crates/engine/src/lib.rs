//! cask-engine: the partition concurrency core and its view-refresh
//! companion.
//!
//! Each partition is owned by one long-running task that serializes
//! mutation, read, range-copy and configuration commands against an
//! in-memory ordered index and a change log. An asynchronous indexer
//! observes mutations, executes map functions behind a capability seam,
//! and materialises the emitted rows into searchable vindexes. Around
//! them sit the sequence pub/sub hub, the mutation broadcaster, the
//! shared periodic drivers, and the bucket registry with its quiescer.

pub mod broadcast;
pub mod bucket;
pub mod error;
pub mod partition;
pub mod periodic;
pub mod refresh;
pub mod registry;
pub mod seq;

pub use broadcast::{Broadcaster, MUTATION_BROADCAST_BUFFER};
pub use bucket::{LiveBucket, DATA_FILE_SUFFIX, VIEWS_FILE_SUFFIX};
pub use error::{EngineError, Result};
pub use partition::{Partition, PartitionState};
pub use periodic::Periodically;
pub use refresh::{view_rows, views_refresh};
pub use registry::{Buckets, BucketsConfig};
pub use seq::{partition_seq_key, SequencePubSub};
