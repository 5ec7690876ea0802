//! Shared helpers for driver integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;

use rill_client::RawPoint;
use rill_client::RillClient;
use rill_client::Stream;
use rill_client::Uuid;
use rill_testing::TestCluster;
use tokio_util::sync::CancellationToken;

pub const CANONICAL_START: i64 = 100;
pub const CANONICAL_END: i64 = 1_000_000_000_000_000_000;
pub const CANONICAL_COUNT: usize = 10_000;
pub const CANONICAL_GAP: i64 = (CANONICAL_END - CANONICAL_START) / CANONICAL_COUNT as i64;
pub const CANONICAL_FINAL: i64 = CANONICAL_START + (CANONICAL_COUNT as i64 - 1) * CANONICAL_GAP;

/// Start a cluster and connect a client to it.
pub async fn start_cluster(count: usize) -> (TestCluster, RillClient, CancellationToken) {
    let cluster = TestCluster::start(count).await.expect("start cluster");
    let ctx = CancellationToken::new();
    let client = RillClient::connect(&ctx, &cluster.addresses()).await.expect("connect");
    (cluster, client, ctx)
}

/// Create a stream with a random id in a per-test collection.
pub async fn create_stream(client: &RillClient, ctx: &CancellationToken) -> Stream {
    create_stream_with_id(client, ctx, Uuid::new_v4()).await
}

/// Create a stream with a chosen id.
pub async fn create_stream_with_id(
    client: &RillClient,
    ctx: &CancellationToken,
    id: Uuid,
) -> Stream {
    let collection = format!("test.{}", id.simple());
    client
        .create(ctx, id, &collection, BTreeMap::new(), None)
        .await
        .expect("create stream")
}

/// The canonical dataset: 10,000 evenly spaced points over
/// `[CANONICAL_START, CANONICAL_END)`.
pub fn canonical_data() -> Vec<RawPoint> {
    rill_testing::random_points(CANONICAL_START, CANONICAL_END, CANONICAL_COUNT)
}

/// A stream id whose placement key is `key`, for aiming at a known owner.
pub fn stream_id_with_placement_key(key: u32) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[0..4].copy_from_slice(&key.to_be_bytes());
    // Uniqueness lives in the tail; the head pins the placement.
    bytes[8..16].copy_from_slice(&rand::random::<u64>().to_be_bytes());
    Uuid::from_bytes(bytes)
}
