//! Routing, retry, and lifecycle behavior.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use rill_client::RawPoint;
use rill_client::RillClient;
use rill_client::codes;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn connect_requires_endpoints() {
    let ctx = CancellationToken::new();
    let err = RillClient::connect(&ctx, &[]).await.expect_err("no endpoints");
    assert_eq!(err.code(), codes::INVALID_ARGUMENTS);
}

#[tokio::test]
async fn connect_skips_dead_candidates() {
    // A freshly released port refuses connections.
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").to_string()
    };
    let cluster = rill_testing::TestCluster::start(2).await.expect("start cluster");
    let ctx = CancellationToken::new();

    let mut endpoints = vec![dead];
    endpoints.extend(cluster.addresses());
    let client = RillClient::connect(&ctx, &endpoints).await.expect("connect via live seed");
    let stream = create_stream(&client, &ctx).await;
    stream.insert(&ctx, &[RawPoint { time: 1, value: 1.0 }]).await.expect("insert");
}

#[tokio::test]
async fn connect_fails_when_every_candidate_is_dead() {
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").to_string()
    };
    let ctx = CancellationToken::new();
    let err = RillClient::connect(&ctx, &[dead]).await.expect_err("all candidates dead");
    assert_eq!(err.code(), codes::UNREACHABLE);
}

#[tokio::test]
async fn endpoint_cache_hits_return_the_same_connection() {
    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;

    let first = client.endpoint_for(&ctx, stream.id()).await.expect("route");
    let second = client.endpoint_for(&ctx, stream.id()).await.expect("route again");
    assert!(Arc::ptr_eq(&first, &second), "same mash epoch must reuse the cached endpoint");

    let read = client.read_endpoint_for(&ctx, stream.id()).await.expect("read route");
    assert!(Arc::ptr_eq(&first, &read), "read routing follows the same policy");
}

#[tokio::test]
async fn operations_survive_an_ownership_rotation() {
    let (cluster, client, ctx) = start_cluster(3).await;
    let stream = create_stream(&client, &ctx).await;
    stream.insert(&ctx, &[RawPoint { time: 1, value: 1.0 }]).await.expect("insert");

    cluster.rotate_ownership();

    // The stale snapshot earns a wrong-endpoint answer; the driver refreshes
    // and re-dispatches without surfacing it.
    stream.insert(&ctx, &[RawPoint { time: 2, value: 2.0 }]).await.expect("insert after move");
    let (points, _) = stream.raw_values(&ctx, 0, 10, 0).collect().await.expect("query after move");
    assert_eq!(points.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_observe_wrong_endpoint() {
    const WORKERS: usize = 8;
    const BATCHES: usize = 25;

    let (cluster, client, ctx) = start_cluster(3).await;
    let cluster = Arc::new(cluster);

    let mut streams = Vec::new();
    for _ in 0..WORKERS {
        streams.push(create_stream(&client, &ctx).await);
    }

    let rotator = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(25)).await;
                cluster.rotate_ownership();
            }
        })
    };

    let mut workers = Vec::new();
    for (worker, stream) in streams.into_iter().enumerate() {
        let ctx = ctx.clone();
        workers.push(tokio::spawn(async move {
            for batch in 0..BATCHES {
                let time = (worker * BATCHES + batch) as i64;
                stream
                    .insert(&ctx, &[RawPoint { time, value: batch as f64 }])
                    .await
                    .unwrap_or_else(|status| {
                        panic!("worker {worker} batch {batch}: unexpected error {status}")
                    });
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            stream
        }));
    }

    let mut finished = Vec::new();
    for worker in workers {
        finished.push(worker.await.expect("worker panicked"));
    }
    rotator.await.expect("rotator");

    // Every write must be present despite the mid-flight ownership moves.
    for stream in finished {
        let (points, _) =
            stream.raw_values(&ctx, 0, i64::MAX >> 8, 0).collect().await.expect("readback");
        assert_eq!(points.len(), BATCHES);
    }
}

#[tokio::test]
async fn retry_budget_exhaustion_surfaces_wrong_endpoint() {
    let (cluster, client, ctx) = start_cluster(1).await;
    let stream = create_stream(&client, &ctx).await;

    cluster.set_misroute(0, true);
    let err = stream
        .insert(&ctx, &[RawPoint { time: 1, value: 1.0 }])
        .await
        .expect_err("budget exhausted");
    assert_eq!(err.code(), codes::WRONG_ENDPOINT);

    cluster.set_misroute(0, false);
    stream.insert(&ctx, &[RawPoint { time: 1, value: 1.0 }]).await.expect("recovered");
}

#[tokio::test]
async fn unmapped_keys_surface_cluster_degraded() {
    let (cluster, client, ctx) = start_cluster(2).await;
    // Node 1 (hash 1) owns the low half of the placement space.
    let id = stream_id_with_placement_key(7);
    let stream = create_stream_with_id(&client, &ctx, id).await;

    cluster.set_member_up(0, false);
    let err = stream
        .insert(&ctx, &[RawPoint { time: 1, value: 1.0 }])
        .await
        .expect_err("owner is down");
    assert_eq!(err.code(), codes::CLUSTER_DEGRADED);

    cluster.set_member_up(0, true);
}

#[tokio::test]
async fn info_is_served_by_any_endpoint() {
    let (cluster, client, ctx) = start_cluster(3).await;
    let before = client.info(&ctx).await.expect("info");
    cluster.rotate_ownership();
    let after = client.info(&ctx).await.expect("info after rotation");
    assert!(after.revision() > before.revision());
    assert_eq!(after.members().count(), 3);
}

#[tokio::test]
async fn disconnect_is_terminal_and_idempotent() {
    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;
    stream.insert(&ctx, &[RawPoint { time: 1, value: 1.0 }]).await.expect("insert");

    client.disconnect().expect("first disconnect");
    client.disconnect().expect("second disconnect is a no-op");

    let err = stream
        .insert(&ctx, &[RawPoint { time: 2, value: 2.0 }])
        .await
        .expect_err("operations after disconnect");
    assert_eq!(err.code(), codes::INVALID_ARGUMENTS);
    assert!(err.msg().contains("disconnected"));

    let err = client.endpoint_for(&ctx, stream.id()).await.expect_err("routing after disconnect");
    assert!(err.msg().contains("disconnected"));
}

#[tokio::test]
async fn cancelled_context_fails_unary_calls_promptly() {
    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;

    let child = ctx.child_token();
    child.cancel();
    let err = stream
        .insert(&child, &[RawPoint { time: 1, value: 1.0 }])
        .await
        .expect_err("cancelled before dispatch");
    assert_eq!(err.code(), codes::CANCELLED);
}
