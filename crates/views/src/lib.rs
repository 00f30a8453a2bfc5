//! cask-views: the representation layer of cask's secondary indexes.
//!
//! Holds everything the view refresh engine needs that is independent of
//! the partition actor:
//!
//! - design documents and their named map functions
//! - the [`MapFunction`]/[`MapRuntime`] capability seam hiding the
//!   embeddable scripting runtime
//! - JSON collation, the ordering of emit keys in vindexes
//! - the vindex key codec (`emitKeyJSON ∥ 0x00 ∥ docId`)
//! - the per-document back-index entry

pub mod backindex;
pub mod collate;
pub mod ddoc;
pub mod error;
pub mod mapfn;
pub mod vindex;

pub use backindex::BackIndexEntry;
pub use collate::collate_json;
pub use ddoc::{vindex_name, DDoc, DDocs, Emit, View};
pub use error::ViewError;
pub use mapfn::{parse_doc, DocMeta, DocType, FnMapFunction, FnMapRuntime, MapError, MapFunction, MapRuntime};
pub use vindex::{vindex_key, vindex_key_compare, vindex_key_parse};
