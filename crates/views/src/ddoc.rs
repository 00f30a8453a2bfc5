//! Design documents and emitted view rows.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named view inside a design document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    /// Map function source, compiled by the bucket's [`MapRuntime`]
    /// (see [`crate::mapfn`]).
    pub map: String,
    /// Reduce function source. Carried but not evaluated by the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce: Option<String>,
}

/// A design document: a bag of named views.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DDoc {
    /// Views by view id.
    pub views: BTreeMap<String, View>,
}

/// All design documents of a bucket, by design-doc id.
pub type DDocs = BTreeMap<String, DDoc>;

/// The vindex collection name for a (design doc, view) pair.
pub fn vindex_name(ddoc_id: &str, view_id: &str) -> String {
    format!("{ddoc_id}/{view_id}")
}

/// One `(key, value)` pair produced by a map function for a document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Emit {
    /// Id of the document that produced the emit; filled in by the
    /// refresh engine after evaluation.
    #[serde(default)]
    pub id: String,
    /// Emit key, ordered by JSON collation in the vindex.
    pub key: Value,
    /// Emit value, stored JSON-encoded as the vindex row value.
    pub value: Value,
}
