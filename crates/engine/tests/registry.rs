//! Bucket registry: directory layout, reload, quiescence.

mod common;

use std::sync::Arc;
use std::time::Duration;

use cask_engine::{Buckets, BucketsConfig};
use cask_test_utils::StoreRoot;
use cask_types::{BucketSettings, MemoryOnlyLevel, VBucketState};
use cask_views::FnMapRuntime;
use common::set_req;

fn registry(dir: &StoreRoot, quiesce: Duration) -> Buckets {
    Buckets::new(
        dir.path(),
        BucketSettings::default(),
        FnMapRuntime::constant(|_, _| Vec::new()),
        BucketsConfig {
            refresh_interval: Duration::from_secs(3600),
            quiesce_interval: quiesce,
        },
    )
    .expect("registry")
}

fn slow_registry(dir: &StoreRoot) -> Buckets {
    registry(dir, Duration::from_secs(3600))
}

#[tokio::test]
async fn create_get_close_purge() {
    let dir = StoreRoot::new();
    let buckets = slow_registry(&dir);

    let bucket = buckets.create("default", None).await.expect("create");
    assert!(!bucket.settings().uuid.is_empty(), "uuid minted at create");
    let bdir = buckets.path("default").expect("path");
    assert!(bdir.join("settings.json").exists());

    assert!(buckets.get("default").await.is_some());
    assert!(buckets.get("missing").await.is_none());
    assert!(
        buckets.create("default", None).await.is_err(),
        "duplicate create must fail"
    );

    buckets.close("default", true).await;
    assert!(buckets.get("default").await.is_none());
    assert!(!bdir.exists(), "purge removes the directory tree");
}

#[tokio::test]
async fn bad_names_are_rejected() {
    let dir = StoreRoot::new();
    let buckets = slow_registry(&dir);
    for bad in ["", "has space", "a/b", "dot."] {
        assert!(buckets.create(bad, None).await.is_err(), "{bad:?} must be rejected");
    }
}

#[tokio::test]
async fn registry_root_must_be_a_directory() {
    let dir = StoreRoot::new();
    let file = dir.path().join("not-a-dir");
    std::fs::write(&file, b"x").expect("write");
    let result = Buckets::new(
        &file,
        BucketSettings::default(),
        FnMapRuntime::constant(|_, _| Vec::new()),
        BucketsConfig::default(),
    );
    assert!(result.is_err());
}

#[tokio::test]
async fn load_all_discovers_buckets_on_disk() {
    let dir = StoreRoot::new();
    {
        let buckets = slow_registry(&dir);
        let bucket = buckets.create("b1", None).await.expect("create");
        let p = bucket.create_or_get_partition(0);
        p.set_state(VBucketState::Active).await;
        p.dispatch(set_req("k", "v", 0)).await.expect("set");
        bucket.flush().await.expect("flush");
        buckets.close_all().await;
    }

    let buckets = slow_registry(&dir);
    let mut names = buckets.load_names().expect("names");
    names.sort();
    assert_eq!(names, vec!["b1".to_string()]);

    buckets.load_all(true).await.expect("load all");
    let bucket = buckets.get("b1").await.expect("loaded");
    let p = bucket.get_partition(0).expect("partition");
    assert_eq!(p.state().await, Some(VBucketState::Active));
    let res = p.get("k").await.expect("get");
    assert!(res.is_ok());
    assert_eq!(&res.body[..], b"v");
}

#[tokio::test]
async fn reload_keeps_the_original_uuid() {
    let dir = StoreRoot::new();
    let uuid = {
        let buckets = slow_registry(&dir);
        let bucket = buckets.create("b1", None).await.expect("create");
        let uuid = bucket.settings().uuid.clone();
        buckets.close_all().await;
        uuid
    };

    let buckets = slow_registry(&dir);
    let bucket = buckets.load_bucket("b1").await.expect("load");
    assert_eq!(bucket.settings().uuid, uuid, "settings.json wins over a fresh uuid");
}

#[tokio::test]
async fn idle_buckets_quiesce_and_reload_on_access() {
    let dir = StoreRoot::new();
    let buckets = registry(&dir, Duration::from_millis(20));

    let bucket = buckets.create("b1", None).await.expect("create");
    let p = bucket.create_or_get_partition(0);
    p.set_state(VBucketState::Active).await;
    p.dispatch(set_req("k", "v", 0)).await.expect("set");
    drop(p);
    drop(bucket);

    // First sweep consumes the accumulated activity; the next idle
    // sweep unloads the bucket.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while buckets.is_loaded("b1").await {
        assert!(tokio::time::Instant::now() < deadline, "bucket never quiesced");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(buckets.names().await.contains(&"b1".to_string()), "placeholder remains");

    // Access transparently reloads from disk.
    let bucket = buckets.get("b1").await.expect("reload");
    let p = bucket.get_partition(0).expect("partition restored");
    let res = p.get("k").await.expect("get");
    assert!(res.is_ok());
    assert_eq!(&res.body[..], b"v");
}

#[tokio::test]
async fn activity_keeps_a_bucket_loaded() {
    let dir = StoreRoot::new();
    let buckets = registry(&dir, Duration::from_millis(50));
    let bucket = buckets.create("busy", None).await.expect("create");
    let p = bucket.create_or_get_partition(0);
    p.set_state(VBucketState::Active).await;

    for i in 0..10 {
        p.dispatch(set_req("k", &format!("v{i}"), 0)).await.expect("set");
        assert!(buckets.is_loaded("busy").await, "active bucket must stay loaded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn memory_only_buckets_never_quiesce() {
    let dir = StoreRoot::new();
    let buckets = registry(&dir, Duration::from_millis(20));
    let settings = BucketSettings {
        memory_only: MemoryOnlyLevel::Nothing,
        ..Default::default()
    };
    let bucket = buckets.create("mem", Some(settings)).await.expect("create");
    assert!(bucket.dir().is_none(), "memory-only buckets have no directory");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(buckets.is_loaded("mem").await, "nothing on disk to reload from");
}

#[tokio::test]
async fn shared_runtime_is_used_for_reloaded_buckets() {
    use serde_json::json;

    let dir = StoreRoot::new();
    let runtime = FnMapRuntime::constant(|doc: &serde_json::Value, _meta| match doc.get("tag") {
        Some(tag) => vec![cask_views::Emit {
            id: String::new(),
            key: tag.clone(),
            value: json!(1),
        }],
        None => Vec::new(),
    });
    let buckets = Buckets::new(
        dir.path(),
        BucketSettings::default(),
        Arc::clone(&runtime) as Arc<dyn cask_views::MapRuntime>,
        BucketsConfig {
            refresh_interval: Duration::from_secs(3600),
            quiesce_interval: Duration::from_secs(3600),
        },
    )
    .expect("registry");

    let bucket = buckets.create("b1", None).await.expect("create");
    let mut views = std::collections::BTreeMap::new();
    views.insert(
        "by_tag".to_string(),
        cask_views::View { map: "function (doc) { emit(doc.tag, 1); }".to_string(), reduce: None },
    );
    let mut ddocs = cask_views::DDocs::new();
    ddocs.insert("_design/tags".to_string(), cask_views::DDoc { views });
    bucket.set_ddocs(ddocs);

    let p = bucket.create_or_get_partition(0);
    p.set_state(VBucketState::Active).await;
    p.dispatch(set_req("k1", r#"{"tag":"x"}"#, 0)).await.expect("set");
    cask_engine::views_refresh(&p).await.expect("refresh");
    let rows = cask_engine::view_rows(&p, "_design/tags", "by_tag").await.expect("rows");
    assert_eq!(rows.len(), 1);

    buckets.close_all().await;
}
