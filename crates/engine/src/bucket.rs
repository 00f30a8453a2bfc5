//! Buckets: named collections of partitions sharing settings, design
//! docs, a sequence hub and the view refresher.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tracing::{debug, warn};

use cask_store::{cas_bytes, cas_bytes_parse, BucketStore, StoreInner};
use cask_types::{
    decode, encode, BucketSettings, Item, PartitionConfig, PartitionId, VBucketState,
};
use cask_views::{DDocs, MapRuntime};

use crate::error::{self, Result};
use crate::partition::{Partition, PartitionState};
use crate::periodic::Periodically;
use crate::seq::SequencePubSub;

/// Suffix of partition data store files.
pub const DATA_FILE_SUFFIX: &str = "data";

/// Suffix of views store files.
pub const VIEWS_FILE_SUFFIX: &str = "views";

pub(crate) struct BucketInner {
    name: String,
    dir: Option<PathBuf>,
    settings: BucketSettings,
    partitions: RwLock<HashMap<PartitionId, Partition>>,
    ddocs: RwLock<Option<Arc<DDocs>>>,
    map_runtime: Arc<dyn MapRuntime>,
    pub(crate) seq: SequencePubSub,
    pub(crate) refresher: Arc<Periodically>,
    activity: AtomicI64,
}

impl BucketInner {
    pub(crate) fn note_activity(&self) {
        self.activity.fetch_add(1, AtomicOrdering::SeqCst);
    }

    pub(crate) fn settings(&self) -> &BucketSettings {
        &self.settings
    }

    pub(crate) fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub(crate) fn ddocs(&self) -> Option<Arc<DDocs>> {
        self.ddocs.read().clone()
    }

    pub(crate) fn map_runtime(&self) -> Arc<dyn MapRuntime> {
        self.map_runtime.clone()
    }

    pub(crate) fn create_or_get_partition(self: &Arc<Self>, vbid: PartitionId) -> Partition {
        let mut partitions = self.partitions.write();
        partitions
            .entry(vbid)
            .or_insert_with(|| Partition::spawn(vbid, Arc::downgrade(self)))
            .clone()
    }
}

/// A live, loaded bucket.
#[derive(Clone)]
pub struct LiveBucket {
    inner: Arc<BucketInner>,
}

impl LiveBucket {
    /// Creates an empty bucket. `dir == None` keeps everything in
    /// memory regardless of the settings' level.
    pub fn new(
        name: impl Into<String>,
        dir: Option<PathBuf>,
        settings: BucketSettings,
        map_runtime: Arc<dyn MapRuntime>,
        refresher: Arc<Periodically>,
    ) -> Self {
        LiveBucket {
            inner: Arc::new(BucketInner {
                name: name.into(),
                dir,
                settings,
                partitions: RwLock::new(HashMap::new()),
                ddocs: RwLock::new(None),
                map_runtime,
                seq: SequencePubSub::new(),
                refresher,
                // A fresh bucket counts as active for its first sweep,
                // so creation alone survives one quiescer tick.
                activity: AtomicI64::new(1),
            }),
        }
    }

    /// Bucket name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Bucket settings.
    pub fn settings(&self) -> &BucketSettings {
        &self.inner.settings
    }

    /// Directory holding this bucket's store files, if persistent.
    pub fn dir(&self) -> Option<&Path> {
        self.inner.dir()
    }

    /// The bucket's sequence pub/sub hub.
    pub fn seq(&self) -> &SequencePubSub {
        &self.inner.seq
    }

    /// Creates a partition, or returns `None` if it already exists.
    pub fn create_partition(&self, vbid: PartitionId) -> Option<Partition> {
        let mut partitions = self.inner.partitions.write();
        if partitions.contains_key(&vbid) {
            return None;
        }
        let partition = Partition::spawn(vbid, Arc::downgrade(&self.inner));
        partitions.insert(vbid, partition.clone());
        Some(partition)
    }

    /// Looks up a partition.
    pub fn get_partition(&self, vbid: PartitionId) -> Option<Partition> {
        self.inner.partitions.read().get(&vbid).cloned()
    }

    /// Looks up a partition, creating it in the `Dead` state if absent.
    pub fn create_or_get_partition(&self, vbid: PartitionId) -> Partition {
        self.inner.create_or_get_partition(vbid)
    }

    /// Removes and closes a partition.
    pub async fn destroy_partition(&self, vbid: PartitionId) {
        let removed = self.inner.partitions.write().remove(&vbid);
        if let Some(partition) = removed {
            partition.close().await;
        }
    }

    /// Ids of all partitions, ascending.
    pub fn partition_ids(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.inner.partitions.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Replaces the design documents.
    pub fn set_ddocs(&self, ddocs: DDocs) {
        *self.inner.ddocs.write() = Some(Arc::new(ddocs));
    }

    /// Current design documents.
    pub fn ddocs(&self) -> Option<Arc<DDocs>> {
        self.inner.ddocs()
    }

    /// Current activity counter.
    pub fn activity(&self) -> i64 {
        self.inner.activity.load(AtomicOrdering::SeqCst)
    }

    /// Subtracts observed activity (quiescer bookkeeping).
    pub fn sub_activity(&self, observed: i64) {
        self.inner.activity.fetch_sub(observed, AtomicOrdering::SeqCst);
    }

    /// Closes every partition and stops the sequence hub.
    pub async fn close(&self) {
        let partitions: Vec<Partition> = {
            let mut map = self.inner.partitions.write();
            map.drain().map(|(_, p)| p).collect()
        };
        for partition in partitions {
            partition.close().await;
        }
        self.inner.seq.stop();
        debug!(bucket = %self.inner.name, "bucket closed");
    }

    /// Persists every partition's data through the store engine.
    pub async fn flush(&self) -> Result<()> {
        let Some(dir) = self.inner.dir.clone() else {
            return Ok(());
        };
        if self.inner.settings.memory_only.skips_disk() {
            return Ok(());
        }
        let partitions: Vec<Partition> =
            self.inner.partitions.read().values().cloned().collect();
        for partition in partitions {
            let Some(dump) = partition.apply(dump_state).await else {
                continue;
            };
            write_partition_store(&dir, &self.inner.settings, partition.vbid(), dump)?;
        }
        debug!(bucket = %self.inner.name, "bucket flushed");
        Ok(())
    }

    /// Recreates partitions from this bucket's data store files.
    pub async fn load(&self) -> Result<()> {
        let Some(dir) = self.inner.dir.clone() else {
            return Ok(());
        };
        if self.inner.settings.memory_only.skips_recovery() {
            return Ok(());
        }
        for vbid in discover_partition_ids(&dir, &self.inner.settings.uuid)? {
            let prefix = format!("{}_{}", self.inner.settings.uuid, vbid);
            let store = BucketStore::open(Some(&dir), &prefix, DATA_FILE_SUFFIX, true)
                .context(error::StoreSnafu)?;
            let dump = store.with(read_partition_store)?;
            let partition = self.inner.create_or_get_partition(vbid);
            if partition.apply(move |state| restore_state(state, dump)).await.is_none() {
                return error::PartitionClosedSnafu { vbid }.fail();
            }
            debug!(bucket = %self.inner.name, vbid, "partition loaded");
        }
        Ok(())
    }
}

// ============================================================================
// Partition store records
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct StoredItem {
    flag: u32,
    exp: u32,
    cas: u64,
    data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredChange {
    key: Vec<u8>,
    flag: u32,
    exp: u32,
    data: Option<Vec<u8>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredMeta {
    cas: u64,
    state: VBucketState,
    config: Option<PartitionConfig>,
}

/// Snapshot of one partition, shaped for the store engine.
pub(crate) struct PartitionDump {
    items: Vec<(Vec<u8>, StoredItem)>,
    changes: Vec<(u64, StoredChange)>,
    meta: StoredMeta,
}

fn dump_state(state: &mut PartitionState) -> PartitionDump {
    let items = state
        .items
        .iter()
        .map(|(key, item)| {
            (
                key.to_vec(),
                StoredItem {
                    flag: item.flag,
                    exp: item.exp,
                    cas: item.cas,
                    data: item.data.as_ref().map(|d| d.to_vec()).unwrap_or_default(),
                },
            )
        })
        .collect();
    let changes = state
        .changes
        .iter()
        .map(|(cas, item)| {
            (
                *cas,
                StoredChange {
                    key: item.key.to_vec(),
                    flag: item.flag,
                    exp: item.exp,
                    data: item.data.as_ref().map(|d| d.to_vec()),
                },
            )
        })
        .collect();
    PartitionDump {
        items,
        changes,
        meta: StoredMeta {
            cas: state.cas,
            state: state.state,
            config: state.config.clone(),
        },
    }
}

fn restore_state(state: &mut PartitionState, dump: PartitionDump) {
    state.items = dump
        .items
        .into_iter()
        .map(|(key, rec)| {
            let key = Bytes::from(key);
            let item = Arc::new(Item {
                key: key.clone(),
                flag: rec.flag,
                exp: rec.exp,
                cas: rec.cas,
                data: Some(rec.data.into()),
            });
            (key, item)
        })
        .collect();
    state.changes = dump
        .changes
        .into_iter()
        .map(|(cas, rec)| {
            let item = Arc::new(Item {
                key: rec.key.into(),
                flag: rec.flag,
                exp: rec.exp,
                cas,
                data: rec.data.map(Bytes::from),
            });
            (cas, item)
        })
        .collect();
    state.cas = dump.meta.cas;
    state.state = dump.meta.state;
    state.config = dump.meta.config;
    state.stats.items = state.items.len() as i64;
}

fn write_partition_store(
    dir: &Path,
    settings: &BucketSettings,
    vbid: PartitionId,
    dump: PartitionDump,
) -> Result<()> {
    let prefix = format!("{}_{}", settings.uuid, vbid);
    let store = BucketStore::open(Some(dir), &prefix, DATA_FILE_SUFFIX, false)
        .context(error::StoreSnafu)?;
    store.with(|inner| -> Result<()> {
        let items = inner.coll("items");
        for (key, rec) in &dump.items {
            items.set(key.clone(), encode(rec).context(error::CodecSnafu)?);
        }
        let changes = inner.coll("changes");
        for (cas, rec) in &dump.changes {
            changes
                .set(cas_bytes(*cas).to_vec(), encode(rec).context(error::CodecSnafu)?);
        }
        inner
            .coll("meta")
            .set(b"meta".to_vec(), encode(&dump.meta).context(error::CodecSnafu)?);
        Ok(())
    })?;
    store.flush().context(error::StoreSnafu)
}

fn read_partition_store(inner: &mut StoreInner) -> Result<PartitionDump> {
    let mut dump = PartitionDump {
        items: Vec::new(),
        changes: Vec::new(),
        meta: StoredMeta { cas: 0, state: VBucketState::Dead, config: None },
    };
    for (key, raw) in inner.coll("items").iter() {
        dump.items.push((key.to_vec(), decode(raw).context(error::CodecSnafu)?));
    }
    for (key, raw) in inner.coll("changes").iter() {
        let cas = cas_bytes_parse(key).context(error::StoreSnafu)?;
        dump.changes.push((cas, decode(raw).context(error::CodecSnafu)?));
    }
    if let Some(raw) = inner.coll("meta").get(b"meta") {
        dump.meta = decode(&raw).context(error::CodecSnafu)?;
    }
    Ok(dump)
}

fn discover_partition_ids(dir: &Path, uuid: &str) -> Result<BTreeSet<PartitionId>> {
    let head = format!("{uuid}_");
    let mut vbids = BTreeSet::new();
    for entry in fs::read_dir(dir).context(error::IoSnafu)? {
        let entry = entry.context(error::IoSnafu)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix(&head) else { continue };
        let mut parts = rest.split('.');
        let (Some(vb), Some(suffix)) = (parts.next(), parts.next()) else { continue };
        if suffix != DATA_FILE_SUFFIX {
            continue;
        }
        match vb.parse::<PartitionId>() {
            Ok(vbid) => {
                vbids.insert(vbid);
            }
            Err(_) => warn!(file = name, "skipping unparseable store file"),
        }
    }
    Ok(vbids)
}
