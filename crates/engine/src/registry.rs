//! The bucket registry: named buckets on a hashed directory layout,
//! with idle buckets quiesced and reloaded on demand.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use snafu::ResultExt;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use cask_types::{BucketSettings, MemoryOnlyLevel};
use cask_views::MapRuntime;

use crate::bucket::LiveBucket;
use crate::error::{self, Result};
use crate::periodic::Periodically;

/// Suffix of per-bucket directories.
pub const BUCKET_DIR_SUFFIX: &str = "-bucket";

const SETTINGS_FILE: &str = "settings.json";

/// Timer configuration for the registry's two drivers.
#[derive(Debug, Clone)]
pub struct BucketsConfig {
    /// Tick interval of the shared view refresher.
    pub refresh_interval: Duration,
    /// Tick interval of the quiescer sweep.
    pub quiesce_interval: Duration,
}

impl Default for BucketsConfig {
    fn default() -> Self {
        BucketsConfig {
            refresh_interval: Duration::from_secs(1),
            quiesce_interval: Duration::from_secs(60),
        }
    }
}

enum BucketSlot {
    Live(LiveBucket),
    /// Placeholder for a quiesced bucket; `get` reloads it from disk.
    Unloaded,
}

struct BucketsInner {
    dir: PathBuf,
    defaults: BucketSettings,
    map_runtime: Arc<dyn MapRuntime>,
    slots: Mutex<HashMap<String, BucketSlot>>,
    refresher: Arc<Periodically>,
    quiescer: Arc<Periodically>,
    avail: watch::Sender<()>,
}

/// Holder of named buckets.
#[derive(Clone)]
pub struct Buckets {
    inner: Arc<BucketsInner>,
}

/// Checks a bucket name against `[A-Za-z0-9_-]+`.
fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        error::BadBucketNameSnafu { name }.fail()
    }
}

/// The registry-relative path of a bucket: `<hi>/<lo>/<name>-bucket`,
/// where hi/lo are the two bytes of CRC32(name).
pub fn bucket_path(name: &str) -> Result<PathBuf> {
    validate_name(name)?;
    let crc = crc32fast::hash(name.as_bytes()) as u16;
    let hi = crc >> 8;
    let lo = crc & 0xff;
    Ok(PathBuf::from(format!("{hi:02x}"))
        .join(format!("{lo:02x}"))
        .join(format!("{name}{BUCKET_DIR_SUFFIX}")))
}

impl Buckets {
    /// Builds a registry rooted at an existing directory.
    pub fn new(
        dir: impl Into<PathBuf>,
        defaults: BucketSettings,
        map_runtime: Arc<dyn MapRuntime>,
        config: BucketsConfig,
    ) -> Result<Buckets> {
        let dir = dir.into();
        if !dir.is_dir() {
            return error::NotADirectorySnafu { path: dir }.fail();
        }
        let (avail, _) = watch::channel(());
        let inner = Arc::new(BucketsInner {
            dir,
            defaults,
            map_runtime,
            slots: Mutex::new(HashMap::new()),
            refresher: Periodically::new(config.refresh_interval),
            quiescer: Periodically::new(config.quiesce_interval),
            avail,
        });

        // The sweep holds only a weak handle so a dropped registry
        // unregisters itself from its own quiescer.
        let weak = Arc::downgrade(&inner);
        inner.quiescer.register(
            inner.avail.subscribe(),
            Box::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(inner) => {
                            sweep(&inner).await;
                            true
                        }
                        None => false,
                    }
                })
            }),
        );

        Ok(Buckets { inner })
    }

    /// Absolute directory of a named bucket.
    pub fn path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.inner.dir.join(bucket_path(name)?))
    }

    /// Creates a new named bucket.
    ///
    /// A fresh UUID is minted unless the bucket directory already
    /// carries settings from an earlier life, in which case those win.
    pub async fn create(
        &self,
        name: &str,
        settings: Option<BucketSettings>,
    ) -> Result<LiveBucket> {
        let bdir = self.path(name)?;
        let mut slots = self.inner.slots.lock().await;
        if slots.contains_key(name) {
            return error::BucketExistsSnafu { name }.fail();
        }

        let mut settings = settings.unwrap_or_else(|| self.inner.defaults.clone());
        settings.uuid = Uuid::new_v4().to_string();

        let dir = if settings.memory_only.skips_disk() {
            None
        } else {
            fs::create_dir_all(&bdir).context(error::IoSnafu)?;
            let settings_path = bdir.join(SETTINGS_FILE);
            if settings_path.exists() {
                let raw = fs::read(&settings_path).context(error::IoSnafu)?;
                settings = serde_json::from_slice(&raw).context(error::JsonSnafu)?;
            } else {
                let raw = serde_json::to_vec_pretty(&settings).context(error::JsonSnafu)?;
                fs::write(&settings_path, raw).context(error::IoSnafu)?;
            }
            Some(bdir)
        };

        let bucket = LiveBucket::new(
            name,
            dir,
            settings,
            self.inner.map_runtime.clone(),
            self.inner.refresher.clone(),
        );
        slots.insert(name.to_string(), BucketSlot::Live(bucket.clone()));
        info!(bucket = name, "bucket created");
        Ok(bucket)
    }

    /// Gets the named bucket, reloading it from disk if it was
    /// quiesced. Returns `None` for unknown names.
    pub async fn get(&self, name: &str) -> Option<LiveBucket> {
        let mut slots = self.inner.slots.lock().await;
        match slots.get(name) {
            Some(BucketSlot::Live(bucket)) => Some(bucket.clone()),
            Some(BucketSlot::Unloaded) => match self.reload(name).await {
                Ok(bucket) => {
                    slots.insert(name.to_string(), BucketSlot::Live(bucket.clone()));
                    info!(bucket = name, "bucket reloaded");
                    Some(bucket)
                }
                Err(error) => {
                    warn!(bucket = name, %error, "bucket reload failed");
                    None
                }
            },
            None => None,
        }
    }

    async fn reload(&self, name: &str) -> Result<LiveBucket> {
        let bdir = self.path(name)?;
        let raw = fs::read(bdir.join(SETTINGS_FILE)).context(error::IoSnafu)?;
        let settings: BucketSettings =
            serde_json::from_slice(&raw).context(error::JsonSnafu)?;
        let bucket = LiveBucket::new(
            name,
            Some(bdir),
            settings,
            self.inner.map_runtime.clone(),
            self.inner.refresher.clone(),
        );
        bucket.load().await?;
        Ok(bucket)
    }

    /// Names of registered buckets, loaded or quiesced.
    pub async fn names(&self) -> Vec<String> {
        self.inner.slots.lock().await.keys().cloned().collect()
    }

    /// Whether the named bucket is currently live (not a quiesced
    /// placeholder). Does not trigger a reload.
    pub async fn is_loaded(&self, name: &str) -> bool {
        matches!(self.inner.slots.lock().await.get(name), Some(BucketSlot::Live(_)))
    }

    /// Closes the named bucket, optionally purging its directory.
    pub async fn close(&self, name: &str, purge: bool) {
        let removed = self.inner.slots.lock().await.remove(name);
        if let Some(BucketSlot::Live(bucket)) = removed {
            bucket.close().await;
        }
        if purge {
            if let Ok(path) = self.path(name) {
                let _ = fs::remove_dir_all(path);
            }
        }
    }

    /// Closes every bucket; directories are left in place.
    pub async fn close_all(&self) {
        let drained: Vec<BucketSlot> = {
            let mut slots = self.inner.slots.lock().await;
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            if let BucketSlot::Live(bucket) = slot {
                bucket.close().await;
            }
        }
    }

    /// Scans the registry directory for bucket names.
    pub fn load_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for hi in fs::read_dir(&self.inner.dir).context(error::IoSnafu)? {
            let hi = hi.context(error::IoSnafu)?;
            if !hi.path().is_dir() {
                continue;
            }
            for lo in fs::read_dir(hi.path()).context(error::IoSnafu)? {
                let lo = lo.context(error::IoSnafu)?;
                if !lo.path().is_dir() {
                    continue;
                }
                for entry in fs::read_dir(lo.path()).context(error::IoSnafu)? {
                    let entry = entry.context(error::IoSnafu)?;
                    if !entry.path().is_dir() {
                        continue;
                    }
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    if let Some(base) = name.strip_suffix(BUCKET_DIR_SUFFIX) {
                        names.push(base.to_string());
                    }
                }
            }
        }
        Ok(names)
    }

    /// Loads every bucket found on disk. Already-loaded buckets are an
    /// error unless `ignore_existing` is set.
    pub async fn load_all(&self, ignore_existing: bool) -> Result<()> {
        for name in self.load_names()? {
            if self.get(&name).await.is_some() {
                if !ignore_existing {
                    return error::BucketExistsSnafu { name }.fail();
                }
                info!(bucket = %name, "bucket already loaded");
                continue;
            }
            self.load_bucket(&name).await?;
        }
        Ok(())
    }

    /// Loads one bucket from disk by name.
    pub async fn load_bucket(&self, name: &str) -> Result<LiveBucket> {
        info!(bucket = name, "loading bucket");
        let bucket = self.create(name, Some(self.inner.defaults.clone())).await?;
        bucket.load().await?;
        Ok(bucket)
    }
}

/// One quiescer pass: positive activity is consumed; buckets idle for a
/// whole tick are flushed, closed and replaced by a placeholder.
async fn sweep(inner: &BucketsInner) {
    let mut slots = inner.slots.lock().await;
    let names: Vec<String> = slots.keys().cloned().collect();
    for name in names {
        let Some(BucketSlot::Live(bucket)) = slots.get(&name) else {
            continue;
        };
        let bucket = bucket.clone();
        let observed = bucket.activity();
        if observed > 0 {
            bucket.sub_activity(observed);
            continue;
        }
        // Unloading is only reversible for fully persistent buckets.
        if bucket.settings().memory_only != MemoryOnlyLevel::Persist || bucket.dir().is_none() {
            continue;
        }
        if let Err(error) = bucket.flush().await {
            warn!(bucket = %name, %error, "quiesce flush failed; bucket stays loaded");
            continue;
        }
        bucket.close().await;
        slots.insert(name.clone(), BucketSlot::Unloaded);
        info!(bucket = %name, "bucket quiesced");
    }
}
