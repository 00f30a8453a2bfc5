//! cask-store: the embedded store engine behind cask's views and
//! partition persistence.
//!
//! The engine is deliberately small: a [`BucketStore`] holds named
//! key-ordered [`Collection`]s behind one lock, flushes the whole store
//! atomically to generation-numbered files, and picks the latest
//! generation on open. That gives the contracts the partition core needs:
//!
//! - ordered `set`/`get`/`delete` with a byte comparator or a caller
//!   supplied comparator
//! - `min_item`/`max_item` and ascending visits from a seek key
//! - `set_with_callback` on the per-partition back-index pair, invoking
//!   the transition at most once under the store lock
//! - partition-scoped `(keys, changes)` sub-collections, the change side
//!   keyed by big-endian CAS bytes
//! - memory-only operation that never touches disk
//!
//! Collections are kept as sorted vectors searched by binary search; the
//! whole-store generation flush means there are no pages to manage.

pub mod bucket_store;
pub mod collection;
pub mod error;
pub mod file;

pub use bucket_store::{BucketStore, IndexedDoc, StoreInner};
pub use collection::{byte_compare, Collection, KeyCompare};
pub use error::{Error, Result};
pub use file::{cas_bytes, cas_bytes_parse, latest_store_file, make_store_file_name};
