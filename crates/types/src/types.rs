//! Core data model: items, mutations, partition states and configuration.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifier of a partition (vbucket). Keys are deterministically mapped
/// to exactly one partition by the caller.
pub type PartitionId = u16;

/// Upper bound on partition identifiers within a bucket.
pub const MAX_PARTITIONS: usize = 1024;

/// A single value record.
///
/// `data == None` marks a tombstone in the change log; the by-key tree
/// never holds tombstones. An empty key in the change log represents a
/// metadata event and is skipped by view refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Record key. Non-empty for value items.
    pub key: Bytes,
    /// Client-supplied flags, echoed back on reads.
    pub flag: u32,
    /// Expiration field; carried but not enforced by the core.
    pub exp: u32,
    /// The per-partition sequence assigned at mutation time.
    pub cas: u64,
    /// Record body, or `None` for a deletion tombstone.
    pub data: Option<Bytes>,
}

impl Item {
    /// True when this change-log record marks a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.data.is_none()
    }

    /// Length of the body in bytes (0 for tombstones).
    pub fn data_len(&self) -> usize {
        self.data.as_ref().map_or(0, Bytes::len)
    }
}

/// Message published on every object change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Partition the change happened in.
    pub vbid: PartitionId,
    /// Mutated key.
    pub key: Bytes,
    /// Sequence assigned to the mutation.
    pub cas: u64,
    /// True for deletions.
    pub deleted: bool,
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sym = if self.deleted { "D" } else { "M" };
        write!(f, "{}: vb:{} {:?} -> {}", sym, self.vbid, self.key, self.cas)
    }
}

/// Operational state of a partition.
///
/// Partitions are created `Dead`; transitions are operator-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VBucketState {
    /// Serving reads and writes.
    Active,
    /// Receiving replicated data only.
    Replica,
    /// Being transferred in.
    Pending,
    /// Not serving; the initial and post-split state.
    Dead,
}

impl VBucketState {
    /// Lowercase name as exposed to operators.
    pub fn as_str(self) -> &'static str {
        match self {
            VBucketState::Active => "active",
            VBucketState::Replica => "replica",
            VBucketState::Pending => "pending",
            VBucketState::Dead => "dead",
        }
    }
}

impl fmt::Display for VBucketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serde adapter rendering key bytes as JSON strings, the way the wire
/// protocol's admin surface expects range bounds to look.
pub mod key_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes bytes as a (lossy) UTF-8 string.
    pub fn serialize<S: Serializer>(b: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&String::from_utf8_lossy(b))
    }

    /// Deserializes a JSON string back into raw bytes.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        String::deserialize(d).map(|s| Bytes::from(s.into_bytes()))
    }
}

/// Key-range configuration of a partition.
///
/// Either bound may be empty, meaning that side of the range is open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Lowest key served, inclusive. Empty = open.
    #[serde(rename = "minKeyInclusive", with = "key_bytes", default)]
    pub min_key_inclusive: Bytes,
    /// Lowest key *not* served, exclusive upper bound. Empty = open.
    #[serde(rename = "maxKeyExclusive", with = "key_bytes", default)]
    pub max_key_exclusive: Bytes,
}

impl PartitionConfig {
    /// Whether `key` falls inside the configured range.
    pub fn contains(&self, key: &[u8]) -> bool {
        if !self.min_key_inclusive.is_empty() && key < &self.min_key_inclusive[..] {
            return false;
        }
        if !self.max_key_exclusive.is_empty() && key >= &self.max_key_exclusive[..] {
            return false;
        }
        true
    }
}

/// One destination of a split-range request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitRangePart {
    /// Destination partition id. Signed so out-of-range ids can be
    /// rejected with a message instead of failing JSON decode.
    #[serde(rename = "vbucketId")]
    pub vbucket_id: i32,
    /// Inclusive lower bound of the keys this destination takes.
    #[serde(rename = "minKeyInclusive", with = "key_bytes", default)]
    pub min_key_inclusive: Bytes,
    /// Exclusive upper bound of the keys this destination takes.
    #[serde(rename = "maxKeyExclusive", with = "key_bytes", default)]
    pub max_key_exclusive: Bytes,
}

/// Body of a `SPLIT_RANGE` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitRange {
    /// Destinations, at least one.
    pub splits: Vec<SplitRangePart>,
}

/// How much a bucket persists.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOnlyLevel {
    /// Everything is persisted through the store engine.
    #[default]
    Persist,
    /// Files are written but ignored on reopen.
    NoRecovery,
    /// No files are touched at all.
    Nothing,
}

impl MemoryOnlyLevel {
    /// True when store files should not be consulted on open.
    pub fn skips_recovery(self) -> bool {
        self >= MemoryOnlyLevel::NoRecovery
    }

    /// True when no files should be written at all.
    pub fn skips_disk(self) -> bool {
        self >= MemoryOnlyLevel::Nothing
    }
}

/// Settings shared by all partitions of a bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSettings {
    /// Unique id minted at bucket creation; part of store file names.
    pub uuid: String,
    /// Persistence level.
    #[serde(default)]
    pub memory_only: MemoryOnlyLevel,
}
