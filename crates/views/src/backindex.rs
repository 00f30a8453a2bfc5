//! The per-document back-index entry.
//!
//! For every indexed document the back-index records which rows the
//! document currently owns in each vindex. That makes updates and
//! deletes O(own rows) instead of a reverse scan, and re-running refresh
//! over already-indexed changes a no-op. The CAS the entry was indexed
//! at is tracked by the store layer alongside this payload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use crate::ddoc::Emit;
use crate::error::{self, ViewError};

/// A document's current emits, keyed by vindex name (`ddocId/viewId`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackIndexEntry {
    /// Emits per vindex.
    pub emits: BTreeMap<String, Vec<Emit>>,
}

impl BackIndexEntry {
    /// Encodes the entry as JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, ViewError> {
        serde_json::to_vec(self).context(error::BackIndexEncodeSnafu)
    }

    /// Decodes an entry from JSON.
    pub fn from_json(data: &[u8]) -> Result<Self, ViewError> {
        serde_json::from_slice(data).context(error::BackIndexDecodeSnafu)
    }

    /// Total number of rows this document owns across all vindexes.
    pub fn row_count(&self) -> usize {
        self.emits.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn round_trip() {
        let mut entry = BackIndexEntry::default();
        entry.emits.insert(
            "d/v".to_string(),
            vec![Emit { id: "k1".to_string(), key: json!("x"), value: json!(1) }],
        );
        let raw = entry.to_json().unwrap();
        let back = BackIndexEntry::from_json(&raw).unwrap();
        assert_eq!(entry, back);
        assert_eq!(back.row_count(), 1);
    }

    #[test]
    fn serializes_as_bare_map() {
        let entry = BackIndexEntry::default();
        assert_eq!(entry.to_json().unwrap(), b"{}");
    }

    #[test]
    fn decode_failure_is_reported() {
        assert!(matches!(
            BackIndexEntry::from_json(b"not json"),
            Err(ViewError::BackIndexDecode { .. })
        ));
    }
}
