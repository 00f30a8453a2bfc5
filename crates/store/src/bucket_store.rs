//! The bucket store: named collections behind one lock, with atomic
//! whole-store generation flushes and the partition back-index pair.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::debug;

use cask_types::{decode, encode, PartitionId};

use crate::collection::{Collection, KeyCompare};
use crate::error::{self, Result};
use crate::file::{cas_bytes, cas_bytes_parse, latest_store_file, make_store_file_name};

/// A back-index record: the per-document entry plus the CAS it was
/// indexed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedDoc {
    /// Document key.
    pub key: Bytes,
    /// CAS of the mutation this record was derived from.
    pub cas: u64,
    /// Opaque entry payload (JSON in the views engine).
    pub data: Bytes,
}

/// On-disk encoding of an [`IndexedDoc`] value.
#[derive(Debug, Serialize, Deserialize)]
struct StoredDoc {
    cas: u64,
    data: Vec<u8>,
}

fn back_keys_name(vbid: PartitionId) -> String {
    format!("{vbid}/backindex")
}

fn back_changes_name(vbid: PartitionId) -> String {
    format!("{vbid}/backindex-changes")
}

/// The collections of one store, accessed under the store lock via
/// [`BucketStore::with`].
pub struct StoreInner {
    colls: BTreeMap<String, Collection>,
}

impl StoreInner {
    /// Returns the named collection under byte order, creating it on
    /// first use.
    pub fn coll(&mut self, name: &str) -> &mut Collection {
        self.colls.entry(name.to_string()).or_default()
    }

    /// Returns the named collection under a caller-supplied comparator.
    /// The comparator is attached once; entries loaded from disk are
    /// re-sorted at that point.
    pub fn coll_with_compare(&mut self, name: &str, cmp: KeyCompare) -> &mut Collection {
        let coll = self.colls.entry(name.to_string()).or_default();
        coll.attach_compare(cmp);
        coll
    }

    /// Read-only view of a collection, if it exists.
    pub fn peek(&self, name: &str) -> Option<&Collection> {
        self.colls.get(name)
    }

    /// Names of all collections.
    pub fn names(&self) -> Vec<String> {
        self.colls.keys().cloned().collect()
    }

    /// The keys side of a partition's back-index pair.
    pub fn back_index_keys(&mut self, vbid: PartitionId) -> &mut Collection {
        self.coll(&back_keys_name(vbid))
    }

    /// The change-log side of a partition's back-index pair, keyed by
    /// big-endian CAS bytes.
    pub fn back_index_changes(&mut self, vbid: PartitionId) -> &mut Collection {
        self.coll(&back_changes_name(vbid))
    }

    /// Fetches a partition's back-index record for a document key.
    pub fn index_get(&mut self, vbid: PartitionId, key: &[u8]) -> Result<Option<IndexedDoc>> {
        let Some(raw) = self.back_index_keys(vbid).get(key) else {
            return Ok(None);
        };
        let stored: StoredDoc = decode(&raw).context(error::CodecSnafu)?;
        Ok(Some(IndexedDoc {
            key: Bytes::copy_from_slice(key),
            cas: stored.cas,
            data: stored.data.into(),
        }))
    }

    /// The max-CAS key of the partition's back-index change log: the
    /// last-indexed watermark, or `None` for a fresh index.
    pub fn index_max_change(&mut self, vbid: PartitionId) -> Result<Option<u64>> {
        match self.back_index_changes(vbid).max_item() {
            Some((key, _)) if !key.is_empty() => Ok(Some(cas_bytes_parse(&key)?)),
            _ => Ok(None),
        }
    }

    /// Atomically swaps a partition's back-index record and runs
    /// `transition` exactly once inside the swap.
    ///
    /// The swap only proceeds if the stored record still matches `old`
    /// (same CAS, or both absent); otherwise `Error::SwapConflict` is
    /// returned and `transition` never runs. The change-log side is
    /// maintained alongside: the old CAS entry is removed and the new
    /// one inserted, which is what advances the refresh watermark.
    pub fn index_set_with_callback(
        &mut self,
        vbid: PartitionId,
        new: IndexedDoc,
        old: Option<&IndexedDoc>,
        transition: impl FnOnce(&mut StoreInner),
    ) -> Result<()> {
        let stored = match self.back_index_keys(vbid).get(&new.key) {
            Some(raw) => Some(decode::<StoredDoc>(&raw).context(error::CodecSnafu)?.cas),
            None => None,
        };
        let expected = old.map(|o| o.cas);
        if stored != expected {
            return error::SwapConflictSnafu { key: new.key.to_vec(), stored, expected }.fail();
        }

        let raw = encode(&StoredDoc { cas: new.cas, data: new.data.to_vec() })
            .context(error::CodecSnafu)?;
        self.back_index_keys(vbid).set(new.key.clone(), raw);
        let changes = self.back_index_changes(vbid);
        if let Some(old) = old {
            changes.delete(&cas_bytes(old.cas));
        }
        changes.set(Bytes::copy_from_slice(&cas_bytes(new.cas)), new.key.clone());

        transition(self);
        Ok(())
    }
}

struct StoreLocation {
    dir: PathBuf,
    prefix: String,
    suffix: String,
    gen: AtomicU64,
}

/// A named store of key-ordered collections with atomic generation
/// flushes.
///
/// `open` with a directory picks the latest `<prefix>.<suffix>.<gen>`
/// file; `flush` writes the next generation via temp-file + rename.
/// Without a directory the store is memory-only and `flush` is a no-op.
pub struct BucketStore {
    inner: Mutex<StoreInner>,
    location: Option<StoreLocation>,
}

impl BucketStore {
    /// Opens a store.
    ///
    /// `dir == None` gives a memory-only store. With a directory, the
    /// highest generation present sets the flush counter; its contents
    /// are loaded only when `recover` is true (the no-recovery
    /// memory-only level writes files it never reads back).
    pub fn open(dir: Option<&Path>, prefix: &str, suffix: &str, recover: bool) -> Result<Self> {
        let mut inner = StoreInner { colls: BTreeMap::new() };
        let location = dir.map(|d| StoreLocation {
            dir: d.to_path_buf(),
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            gen: AtomicU64::new(0),
        });

        if let Some(loc) = &location {
            if let Some((path, gen)) = latest_store_file(&loc.dir, prefix, suffix)? {
                loc.gen.store(gen, AtomicOrdering::SeqCst);
                if recover {
                    let raw = fs::read(&path).context(error::IoSnafu)?;
                    let records: Vec<(String, Vec<(Vec<u8>, Vec<u8>)>)> =
                        decode(&raw).context(error::CodecSnafu)?;
                    for (name, entries) in records {
                        inner.colls.entry(name).or_default().load_entries(
                            entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
                        );
                    }
                    debug!(prefix, suffix, gen, "recovered store file");
                }
            }
        }

        Ok(BucketStore { inner: Mutex::new(inner), location })
    }

    /// A memory-only store.
    pub fn in_memory() -> Self {
        BucketStore {
            inner: Mutex::new(StoreInner { colls: BTreeMap::new() }),
            location: None,
        }
    }

    /// True when the store never touches disk.
    pub fn is_memory_only(&self) -> bool {
        self.location.is_none()
    }

    /// Runs `f` with the collections under the store lock. All multi
    /// collection work (the views transition in particular) happens
    /// inside one `with` call, which is what makes
    /// [`StoreInner::index_set_with_callback`] atomic.
    pub fn with<R>(&self, f: impl FnOnce(&mut StoreInner) -> R) -> R {
        let mut inner = self.inner.lock();
        f(&mut inner)
    }

    /// Writes the next generation file: encode everything, write to a
    /// temp file, rename into place. Memory-only stores return Ok
    /// without touching disk.
    pub fn flush(&self) -> Result<()> {
        let Some(loc) = &self.location else {
            return Ok(());
        };
        let records: Vec<(String, Vec<(Vec<u8>, Vec<u8>)>)> = {
            let inner = self.inner.lock();
            inner
                .colls
                .iter()
                .map(|(name, coll)| {
                    let entries =
                        coll.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect();
                    (name.clone(), entries)
                })
                .collect()
        };
        let raw = encode(&records).context(error::CodecSnafu)?;

        let gen = loc.gen.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let name = make_store_file_name(&loc.prefix, &loc.suffix, gen);
        let tmp = loc.dir.join(format!(".{name}.tmp"));
        let path = loc.dir.join(&name);
        fs::write(&tmp, raw).context(error::IoSnafu)?;
        fs::rename(&tmp, &path).context(error::IoSnafu)?;
        debug!(file = %path.display(), "flushed store generation");
        Ok(())
    }
}
