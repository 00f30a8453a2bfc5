//! Error types for view representation and key handling.

use snafu::Snafu;

/// Errors from vindex key handling and back-index codecs.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ViewError {
    /// An emit key could not be rendered as JSON.
    #[snafu(display("emit key is not valid JSON: {source}"))]
    EmitKeyEncode {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// A vindex key had no `0x00` separator.
    #[snafu(display("vindex key has no separator"))]
    VindexKeySplit,

    /// The emit-key half of a vindex key failed to parse.
    #[snafu(display("vindex emit key failed to parse: {source}"))]
    VindexKeyParse {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// A back-index entry failed to decode.
    #[snafu(display("back-index entry decode failed: {source}"))]
    BackIndexDecode {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// A back-index entry failed to encode.
    #[snafu(display("back-index entry encode failed: {source}"))]
    BackIndexEncode {
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}
