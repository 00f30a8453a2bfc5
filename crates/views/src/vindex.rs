//! The vindex key codec.
//!
//! A vindex row key is `emitKeyJSON ∥ 0x00 ∥ docId`. JSON text never
//! contains a raw NUL (it must be escaped), so the first `0x00` always
//! separates the halves even when the doc id contains NULs. Rows order
//! by JSON collation on the parsed emit key, then by doc-id bytes.

use std::cmp::Ordering;

use bytes::Bytes;
use serde_json::Value;
use snafu::ResultExt;

use crate::collate::collate_json;
use crate::error::{self, ViewError};

/// Builds the vindex row key for a document's emit.
pub fn vindex_key(doc_id: &[u8], emit_key: &Value) -> Result<Bytes, ViewError> {
    let mut out = serde_json::to_vec(emit_key).context(error::EmitKeyEncodeSnafu)?;
    out.push(0);
    out.extend_from_slice(doc_id);
    Ok(Bytes::from(out))
}

/// Splits a vindex row key back into `(emitKey, docId)`.
pub fn vindex_key_parse(key: &[u8]) -> Result<(Value, Bytes), ViewError> {
    let sep = key
        .iter()
        .position(|&b| b == 0)
        .ok_or(ViewError::VindexKeySplit)?;
    let emit_key: Value =
        serde_json::from_slice(&key[..sep]).context(error::VindexKeyParseSnafu)?;
    Ok((emit_key, Bytes::copy_from_slice(&key[sep + 1..])))
}

/// Orders vindex row keys: collation on the emit key, doc-id bytes on
/// ties. Keys that fail to parse fall back to byte order, so a damaged
/// row cannot poison the whole collection's ordering.
pub fn vindex_key_compare(a: &[u8], b: &[u8]) -> Ordering {
    let (Ok((ka, da)), Ok((kb, db))) = (vindex_key_parse(a), vindex_key_parse(b)) else {
        return a.cmp(b);
    };
    match collate_json(&ka, &kb) {
        Ordering::Equal => da.cmp(&db),
        c => c,
    }
}
