//! Error types for the store engine.

use snafu::{Location, Snafu};

use cask_types::CodecError;

/// Result type for store operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by [`BucketStore`](crate::BucketStore) operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Filesystem operation failed.
    #[snafu(display("I/O error at {location}: {source}"))]
    Io {
        /// Underlying I/O error.
        source: std::io::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Store-file record failed to encode or decode.
    #[snafu(display("Codec error at {location}: {source}"))]
    Codec {
        /// Underlying codec error.
        source: CodecError,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// `set_with_callback` found a record other than the expected one.
    #[snafu(display(
        "swap conflict on {key:?}: stored cas {stored:?}, expected {expected:?}"
    ))]
    SwapConflict {
        /// Key of the conflicting record.
        key: Vec<u8>,
        /// CAS currently stored, if any.
        stored: Option<u64>,
        /// CAS the caller expected, if any.
        expected: Option<u64>,
    },

    /// A change-log key was not 8 big-endian CAS bytes.
    #[snafu(display("bad change-log key length {len}"))]
    BadChangeKey {
        /// Observed key length.
        len: usize,
    },
}
