//! Split-range coordination: validation, atomic transfer, source reset.

mod common;

use bytes::Bytes;

use cask_types::{OpCode, PartitionConfig, Request, Response, Status, VBucketState};
use common::{active_partition, memory_bucket, set_req};

async fn split(partition: &cask_engine::Partition, body: &str) -> Response {
    let mut req = Request::new(OpCode::SplitRange, Bytes::new());
    req.body = Bytes::copy_from_slice(body.as_bytes());
    partition.dispatch(req).await.expect("split response")
}

#[tokio::test]
async fn split_transfers_ranges_and_kills_the_source() {
    let bucket = memory_bucket();
    let p0 = active_partition(&bucket, 0).await;
    for (k, v) in [("a", "1"), ("m", "2"), ("z", "3")] {
        p0.dispatch(set_req(k, v, 0)).await.expect("set");
    }
    let source_cas = p0.apply(|st| st.current_cas()).await.expect("cas");
    assert_eq!(source_cas, 3);

    let res = split(
        &p0,
        r#"{"splits":[
            {"vbucketId":1,"maxKeyExclusive":"n"},
            {"vbucketId":2,"minKeyInclusive":"n"}
        ]}"#,
    )
    .await;
    assert!(res.is_ok(), "split failed: {:?}", res);

    // The source gave up everything.
    assert_eq!(p0.state().await, Some(VBucketState::Dead));
    let (items, config) = p0
        .apply(|st| (st.item_count(), st.config().cloned()))
        .await
        .expect("source state");
    assert_eq!(items, 0);
    assert_eq!(config, Some(PartitionConfig::default()));

    // Destinations carry exactly their ranges, the source's state, and
    // its CAS counter so sequencing continues monotonically.
    let p1 = bucket.get_partition(1).expect("vb1");
    let p2 = bucket.get_partition(2).expect("vb2");

    assert_eq!(p1.state().await, Some(VBucketState::Active));
    assert_eq!(p2.state().await, Some(VBucketState::Active));
    assert_eq!(p1.apply(|st| st.current_cas()).await, Some(source_cas));
    assert_eq!(p2.apply(|st| st.current_cas()).await, Some(source_cas));

    for key in ["a", "m"] {
        let res = p1.get(key).await.expect("get");
        assert!(res.is_ok(), "vb1 should hold {key}");
    }
    let res = p2.get("z").await.expect("get");
    assert!(res.is_ok(), "vb2 should hold z");

    // Range configs are enforced on the destinations.
    let res = p1.get("z").await.expect("get");
    assert_eq!(res.status, Status::NotMyRange);
    let res = p2.get("a").await.expect("get");
    assert_eq!(res.status, Status::NotMyRange);

    // The change log moved with the items.
    assert_eq!(p1.apply(|st| st.change_count()).await, Some(2));
    assert_eq!(p2.apply(|st| st.change_count()).await, Some(1));

    bucket.close().await;
}

#[tokio::test]
async fn split_rejects_bad_payloads() {
    let bucket = memory_bucket();
    let p0 = active_partition(&bucket, 0).await;
    p0.dispatch(set_req("a", "1", 0)).await.expect("set");

    for (body, why) in [
        ("", "empty body"),
        ("not json", "bad json"),
        (r#"{"splits":[]}"#, "no splits"),
        (r#"{"splits":[{"vbucketId":0}]}"#, "source as destination"),
        (r#"{"splits":[{"vbucketId":3},{"vbucketId":3}]}"#, "duplicate id"),
        (r#"{"splits":[{"vbucketId":-1}]}"#, "negative id"),
        (r#"{"splits":[{"vbucketId":99999}]}"#, "id out of range"),
    ] {
        let res = split(&p0, body).await;
        assert_eq!(res.status, Status::Einval, "{why} must be EINVAL");
    }

    // The source is untouched by failed splits.
    assert_eq!(p0.state().await, Some(VBucketState::Active));
    let res = p0.get("a").await.expect("get");
    assert!(res.is_ok());

    bucket.close().await;
}

#[tokio::test]
async fn split_requires_dead_destinations() {
    let bucket = memory_bucket();
    let p0 = active_partition(&bucket, 0).await;
    p0.dispatch(set_req("a", "1", 0)).await.expect("set");

    // Pre-existing active destination refuses the transfer.
    active_partition(&bucket, 1).await;
    let res = split(&p0, r#"{"splits":[{"vbucketId":1}]}"#).await;
    assert_eq!(res.status, Status::Einval);

    // Source untouched.
    assert!(p0.get("a").await.expect("get").is_ok());
    assert_eq!(p0.state().await, Some(VBucketState::Active));

    bucket.close().await;
}

#[tokio::test]
async fn keys_outside_every_destination_are_dropped() {
    let bucket = memory_bucket();
    let p0 = active_partition(&bucket, 0).await;
    p0.dispatch(set_req("a", "1", 0)).await.expect("set");
    p0.dispatch(set_req("z", "2", 0)).await.expect("set");

    let res = split(&p0, r#"{"splits":[{"vbucketId":1,"maxKeyExclusive":"n"}]}"#).await;
    assert!(res.is_ok());

    let p1 = bucket.get_partition(1).expect("vb1");
    assert!(p1.get("a").await.expect("get").is_ok());
    // "z" was covered by no destination range: gone.
    assert_eq!(p1.apply(|st| st.item_count()).await, Some(1));
    assert_eq!(p0.apply(|st| st.item_count()).await, Some(0));

    bucket.close().await;
}

#[tokio::test]
async fn single_destination_split_renumbers_a_partition() {
    let bucket = memory_bucket();
    let p0 = active_partition(&bucket, 0).await;
    p0.dispatch(set_req("k", "v", 0)).await.expect("set");

    let res = split(&p0, r#"{"splits":[{"vbucketId":7}]}"#).await;
    assert!(res.is_ok());

    let p7 = bucket.get_partition(7).expect("vb7");
    let res = p7.get("k").await.expect("get");
    assert!(res.is_ok());
    assert_eq!(&res.body[..], b"v");
    assert_eq!(p0.apply(|st| st.item_count()).await, Some(0));

    bucket.close().await;
}

#[tokio::test]
async fn destinations_resume_serving_after_split() {
    let bucket = memory_bucket();
    let p0 = active_partition(&bucket, 0).await;
    p0.dispatch(set_req("a", "1", 0)).await.expect("set");

    let res = split(&p0, r#"{"splits":[{"vbucketId":1}]}"#).await;
    assert!(res.is_ok());

    // The destination's suspension was lifted: commands flow again.
    let p1 = bucket.get_partition(1).expect("vb1");
    let res = p1.dispatch(set_req("b", "2", 0)).await.expect("set");
    assert!(res.is_ok());
    assert!(res.cas >= 1, "cas continues from the source counter");

    bucket.close().await;
}
