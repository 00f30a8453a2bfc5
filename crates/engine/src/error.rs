//! Error types for the engine crate.

use std::path::PathBuf;

use snafu::{Location, Snafu};

use cask_types::{CodecError, PartitionId};
use cask_views::{MapError, ViewError};

/// Result type for engine operations.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors surfaced by buckets, the registry and the refresh engine.
///
/// Client-visible protocol failures are statuses on [`cask_types::Response`],
/// not variants here.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    /// Bucket names are restricted to `[A-Za-z0-9_-]+`.
    #[snafu(display("bad bucket name: {name}"))]
    BadBucketName {
        /// Offending name.
        name: String,
    },

    /// The registry root is not a directory.
    #[snafu(display("not a directory: {}", path.display()))]
    NotADirectory {
        /// Offending path.
        path: PathBuf,
    },

    /// A bucket with this name is already registered.
    #[snafu(display("bucket already exists: {name}"))]
    BucketExists {
        /// Offending name.
        name: String,
    },

    /// The partition's actor has shut down.
    #[snafu(display("partition {vbid} is closed"))]
    PartitionClosed {
        /// Partition id.
        vbid: PartitionId,
    },

    /// The owning bucket has been dropped.
    #[snafu(display("bucket is gone"))]
    BucketGone,

    /// Filesystem operation failed.
    #[snafu(display("I/O error at {location}: {source}"))]
    Io {
        /// Underlying I/O error.
        source: std::io::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Store engine operation failed.
    #[snafu(display("store error at {location}: {source}"))]
    Store {
        /// Underlying store error.
        source: cask_store::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// A store-file record failed to encode or decode.
    #[snafu(display("codec error at {location}: {source}"))]
    Codec {
        /// Underlying codec error.
        source: CodecError,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// A JSON surface failed to encode or decode.
    #[snafu(display("JSON error at {location}: {source}"))]
    Json {
        /// Underlying JSON error.
        source: serde_json::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// A map function failed to compile or evaluate.
    #[snafu(display("map function error: {source}"))]
    Map {
        /// Underlying map error.
        source: MapError,
    },

    /// Vindex key or back-index handling failed.
    #[snafu(display("view error: {source}"))]
    View {
        /// Underlying view error.
        source: ViewError,
    },
}
