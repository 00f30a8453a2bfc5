//! Shared scaffolding for engine integration tests.

#![allow(dead_code)] // each test binary uses a subset

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use cask_engine::{LiveBucket, Partition, Periodically};
use cask_types::{BucketSettings, OpCode, Request, VBucketState};
use cask_views::{FnMapRuntime, MapRuntime};

/// A memory-only bucket whose map runtime emits nothing.
pub fn memory_bucket() -> LiveBucket {
    bucket_with_runtime(FnMapRuntime::constant(|_, _| Vec::new()))
}

/// A memory-only bucket with a caller-supplied map runtime. The shared
/// refresher ticks slowly; tests drive refresh explicitly unless they
/// build their own bucket.
pub fn bucket_with_runtime(runtime: Arc<dyn MapRuntime>) -> LiveBucket {
    LiveBucket::new(
        "test",
        None,
        BucketSettings::default(),
        runtime,
        Periodically::new(Duration::from_secs(3600)),
    )
}

/// Creates (or fetches) a partition and moves it to `Active`.
pub async fn active_partition(bucket: &LiveBucket, vbid: u16) -> Partition {
    let partition = bucket.create_or_get_partition(vbid);
    partition.set_state(VBucketState::Active).await;
    partition
}

/// A SET request.
pub fn set_req(key: &str, body: &str, cas: u64) -> Request {
    let mut req = Request::new(OpCode::Set, Bytes::copy_from_slice(key.as_bytes()));
    req.body = Bytes::copy_from_slice(body.as_bytes());
    req.cas = cas;
    req
}

/// A DELETE request.
pub fn del_req(key: &str, cas: u64) -> Request {
    let mut req = Request::new(OpCode::Delete, Bytes::copy_from_slice(key.as_bytes()));
    req.cas = cas;
    req
}
