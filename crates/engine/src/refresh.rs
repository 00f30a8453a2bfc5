//! The view refresh engine.
//!
//! Every successful mutation bumps a partition's staleness counter; the
//! 0→1 crossing registers the partition with the shared refresher. A
//! refresh scans the change log above the last-indexed CAS (the max key
//! of the back-index change log), evaluates every view's map function
//! over each changed document, and swaps the document's back-index
//! entry — deleting the rows it used to own in each vindex and
//! inserting the new ones inside the swap's transition.
//!
//! Errors abort the current item but keep partial progress: the
//! watermark only advances through items that committed, and the
//! staleness counter is left alone so the driver retries on its next
//! tick.

use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use snafu::ResultExt;
use tracing::warn;

use cask_store::{BucketStore, IndexedDoc, KeyCompare, StoreInner};
use cask_types::{Item, PartitionId};
use cask_views::{
    parse_doc, vindex_key, vindex_key_compare, vindex_name, BackIndexEntry, DocMeta, MapFunction,
};

use crate::bucket::{BucketInner, VIEWS_FILE_SUFFIX};
use crate::error::{self, Result};
use crate::partition::Partition;
use crate::periodic::Work;

/// The comparator vindex collections live under.
fn vindex_compare() -> KeyCompare {
    Arc::new(|a: &[u8], b: &[u8]| vindex_key_compare(a, b))
}

/// Builds the periodic work function for a freshly-stale partition.
pub(crate) fn make_refresh_work(partition: Partition) -> Work {
    Box::new(move || {
        let partition = partition.clone();
        Box::pin(async move {
            match views_refresh(&partition).await {
                Ok(leftover) => leftover > 0,
                Err(error) => {
                    // Staleness was not decremented; stay registered so
                    // the next tick retries.
                    warn!(vbid = partition.vbid(), %error, "views refresh failed");
                    true
                }
            }
        })
    })
}

/// Refreshes all views with the changes since the last refresh.
///
/// Returns the leftover staleness: mutations that arrived while the
/// refresh ran and are not yet indexed.
pub async fn views_refresh(partition: &Partition) -> Result<i64> {
    let _guard = partition.views_lock.lock().await;
    let observed = partition.staleness.load(AtomicOrdering::SeqCst);
    views_refresh_locked(partition).await?;
    let previous = partition.staleness.fetch_sub(observed, AtomicOrdering::SeqCst);
    Ok(previous - observed)
}

async fn views_refresh_locked(partition: &Partition) -> Result<()> {
    let Some(bucket) = partition.bucket.upgrade() else {
        return Ok(());
    };
    let Some(ddocs) = bucket.ddocs() else {
        return Ok(());
    };
    if ddocs.is_empty() {
        return Ok(());
    }

    // One compile per view per run; documents share the result.
    let runtime = bucket.map_runtime();
    let mut views: Vec<(String, Arc<dyn MapFunction>)> = Vec::new();
    for (ddoc_id, ddoc) in ddocs.iter() {
        for (view_id, view) in &ddoc.views {
            let map_fn =
                runtime.compile(ddoc_id, view_id, &view.map).context(error::MapSnafu)?;
            views.push((vindex_name(ddoc_id, view_id), map_fn));
        }
    }

    let vbid = partition.vbid();
    let store = views_store(partition, bucket).await?;
    let watermark = store.with(|inner| inner.index_max_change(vbid)).context(error::StoreSnafu)?;

    let changes: Vec<Arc<Item>> = partition
        .apply(move |state| {
            let lower = match watermark {
                Some(cas) => Excluded(cas),
                None => Unbounded,
            };
            state.changes.range((lower, Unbounded)).map(|(_, item)| item.clone()).collect()
        })
        .await
        .ok_or_else(|| error::PartitionClosedSnafu { vbid }.build())?;

    for item in changes {
        // An empty key is a metadata change record.
        if item.key.is_empty() {
            continue;
        }
        refresh_item(&store, &views, vbid, &item)?;
    }

    store.flush().context(error::StoreSnafu)?;
    Ok(())
}

/// Opens (or reuses) the partition's views store; sequencing goes
/// through `apply` so open races with close are impossible.
async fn views_store(partition: &Partition, bucket: Arc<BucketInner>) -> Result<Arc<BucketStore>> {
    let vbid = partition.vbid();
    partition
        .apply(move |state| -> Result<Arc<BucketStore>> {
            if let Some(store) = &state.views_store {
                return Ok(store.clone());
            }
            let settings = bucket.settings();
            let prefix = format!("{}_{}", settings.uuid, state.vbid());
            let store = match bucket.dir() {
                Some(dir) if !settings.memory_only.skips_disk() => BucketStore::open(
                    Some(dir),
                    &prefix,
                    VIEWS_FILE_SUFFIX,
                    !settings.memory_only.skips_recovery(),
                )
                .context(error::StoreSnafu)?,
                _ => BucketStore::in_memory(),
            };
            let store = Arc::new(store);
            state.views_store = Some(store.clone());
            Ok(store)
        })
        .await
        .ok_or_else(|| error::PartitionClosedSnafu { vbid }.build())?
}

/// Refreshes all views with respect to a single changed document.
fn refresh_item(
    store: &BucketStore,
    views: &[(String, Arc<dyn MapFunction>)],
    vbid: PartitionId,
    item: &Item,
) -> Result<()> {
    let old_doc =
        store.with(|inner| inner.index_get(vbid, &item.key)).context(error::StoreSnafu)?;
    let old_entry = match &old_doc {
        Some(doc) => Some(BackIndexEntry::from_json(&doc.data).context(error::ViewSnafu)?),
        None => None,
    };

    let doc_id = String::from_utf8_lossy(&item.key).to_string();
    let entry = match &item.data {
        Some(data) => {
            let (doc, doc_type) = parse_doc(data);
            let meta = DocMeta { id: doc_id.clone(), doc_type };
            let mut emits_by_view = BTreeMap::new();
            for (name, map_fn) in views {
                let mut emits = map_fn.evaluate(&doc, &meta).context(error::MapSnafu)?;
                for emit in &mut emits {
                    emit.id = doc_id.clone();
                }
                emits_by_view.insert(name.clone(), emits);
            }
            BackIndexEntry { emits: emits_by_view }
        }
        // A tombstone indexes as an empty entry, clearing every row the
        // document owned.
        None => BackIndexEntry::default(),
    };

    let data = entry.to_json().context(error::ViewSnafu)?;
    let new_doc = IndexedDoc { key: item.key.clone(), cas: item.cas, data: data.into() };

    let mut transition_result: Result<()> = Ok(());
    store
        .with(|inner| {
            inner.index_set_with_callback(vbid, new_doc, old_doc.as_ref(), |inner| {
                transition_result = (|| {
                    if let Some(old_entry) = &old_entry {
                        vindexes_clear(inner, &item.key, old_entry)?;
                    }
                    vindexes_set(inner, &item.key, &entry)
                })();
            })
        })
        .context(error::StoreSnafu)?;
    transition_result
}

/// Deletes a document's previous rows from the vindexes.
fn vindexes_clear(inner: &mut StoreInner, doc_id: &[u8], entry: &BackIndexEntry) -> Result<()> {
    for (name, emits) in &entry.emits {
        let coll = inner.coll_with_compare(name, vindex_compare());
        for emit in emits {
            let row_key = vindex_key(doc_id, &emit.key).context(error::ViewSnafu)?;
            coll.delete(&row_key);
        }
    }
    Ok(())
}

/// Inserts a document's new rows into the vindexes.
fn vindexes_set(inner: &mut StoreInner, doc_id: &[u8], entry: &BackIndexEntry) -> Result<()> {
    for (name, emits) in &entry.emits {
        let coll = inner.coll_with_compare(name, vindex_compare());
        for emit in emits {
            let row_key = vindex_key(doc_id, &emit.key).context(error::ViewSnafu)?;
            let value = serde_json::to_vec(&emit.value).context(error::JsonSnafu)?;
            coll.set(row_key, value);
        }
    }
    Ok(())
}

/// Reads every row of a vindex in collation order: `(rowKey, valueJSON)`
/// pairs. This is the ordered range-scan surface secondary indexes
/// exist for, and what tests assert against.
pub async fn view_rows(
    partition: &Partition,
    ddoc_id: &str,
    view_id: &str,
) -> Result<Vec<(bytes::Bytes, bytes::Bytes)>> {
    let Some(bucket) = partition.bucket.upgrade() else {
        return error::BucketGoneSnafu.fail();
    };
    let store = views_store(partition, bucket).await?;
    let name = vindex_name(ddoc_id, view_id);
    Ok(store.with(|inner| {
        inner
            .coll_with_compare(&name, vindex_compare())
            .iter()
            .cloned()
            .collect()
    }))
}
