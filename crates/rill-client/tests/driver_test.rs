//! End-to-end driver semantics against an in-process cluster.

mod common;

use common::*;
use rill_client::MAX_TIME;
use rill_client::MIN_TIME;
use rill_client::RawPoint;
use rill_client::codes;

#[tokio::test]
async fn nearest_on_empty_stream_is_no_such_point() {
    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;
    let err = stream.nearest(&ctx, 0, 0, false).await.expect_err("empty stream");
    assert_eq!(err.code(), codes::NO_SUCH_POINT);
}

#[tokio::test]
async fn nearest_forward_is_inclusive() {
    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;
    let data = canonical_data();
    stream.insert(&ctx, &data).await.expect("insert");

    let (point, _) = stream.nearest(&ctx, CANONICAL_FINAL, 0, false).await.expect("at last");
    assert_eq!(point, *data.last().expect("data"));

    let err = stream
        .nearest(&ctx, CANONICAL_FINAL + 1, 0, false)
        .await
        .expect_err("past last point");
    assert_eq!(err.code(), codes::NO_SUCH_POINT);
}

#[tokio::test]
async fn nearest_backward_is_exclusive() {
    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;
    let data = canonical_data();
    stream.insert(&ctx, &data).await.expect("insert");

    let err = stream.nearest(&ctx, CANONICAL_START, 0, true).await.expect_err("at first point");
    assert_eq!(err.code(), codes::NO_SUCH_POINT);

    let (point, _) = stream.nearest(&ctx, CANONICAL_START + 1, 0, true).await.expect("just past");
    assert_eq!(point, data[0]);
}

#[tokio::test]
async fn earliest_valid_time_is_inclusive() {
    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;

    let err = stream
        .insert(&ctx, &[RawPoint { time: MIN_TIME - 1, value: 1.0 }])
        .await
        .expect_err("below valid range");
    assert_eq!(err.code(), codes::INVALID_TIME_RANGE);

    stream.insert(&ctx, &[RawPoint { time: MIN_TIME, value: 1.0 }]).await.expect("at lower bound");
    let (point, _) = stream.nearest(&ctx, MIN_TIME, 0, false).await.expect("find lowest");
    assert_eq!(point.time, MIN_TIME);
}

#[tokio::test]
async fn latest_valid_time_is_exclusive() {
    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;

    let err = stream
        .insert(&ctx, &[RawPoint { time: MAX_TIME, value: 1.0 }])
        .await
        .expect_err("at exclusive upper bound");
    assert_eq!(err.code(), codes::INVALID_TIME_RANGE);

    stream
        .insert(&ctx, &[RawPoint { time: MAX_TIME - 1, value: 1.0 }])
        .await
        .expect("just below upper bound");
    let (point, _) = stream.nearest(&ctx, MAX_TIME, 0, true).await.expect("find highest");
    assert_eq!(point.time, MAX_TIME - 1);
}

#[tokio::test]
async fn full_range_query_returns_every_point_in_order() {
    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;
    let data = canonical_data();
    stream.insert(&ctx, &data).await.expect("insert");

    let (points, version) = stream
        .raw_values(&ctx, CANONICAL_START, CANONICAL_END, 0)
        .collect()
        .await
        .expect("query");
    assert!(version > 0);
    assert_eq!(points.len(), data.len());
    for (expected, got) in data.iter().zip(&points) {
        assert_eq!(got.time, expected.time);
        assert_eq!(got.value.to_bits(), expected.value.to_bits());
    }
    for pair in points.windows(2) {
        assert!(pair[0].time < pair[1].time, "results must be strictly increasing in time");
    }
}

#[tokio::test]
async fn nan_payload_bits_survive_and_poison_windows() {
    let nan1 = f64::from_bits(0x7FFb_adc0_ffee_7ea5);
    let nan2 = f64::from_bits(0x7FF5_dbb0_554c_0010);
    let nan3 = f64::from_bits(0xFFFb_abb1_edbe_e71e);
    let nan4 = f64::from_bits(0xFFF5_01ac_eca5_71e5);
    let times: Vec<i64> = (0..8).map(|i| i * 1000).collect();
    let values = vec![nan1, nan2, nan3, 0.25, -1.5, nan4, 3.0, -4.0];

    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;
    stream.insert_values(&ctx, &times, &values).await.expect("insert");

    let (points, _) = stream.raw_values(&ctx, 0, 7001, 0).collect().await.expect("raw query");
    assert_eq!(points.len(), values.len());
    for (index, point) in points.iter().enumerate() {
        assert_eq!(point.time, times[index]);
        assert_eq!(point.value.to_bits(), values[index].to_bits());
    }

    let (stats, _) = stream.windows(&ctx, 0, 10_000, 2000, 0, 0).collect().await.expect("windows");
    assert_eq!(stats.len(), 4);
    for (index, stat) in stats.iter().enumerate() {
        assert_eq!(stat.time, 2000 * index as i64);
        assert_eq!(stat.count, 2);
    }
    // Any NaN in a window makes all three aggregates NaN.
    for stat in &stats[0..3] {
        assert!(stat.min.is_nan() && stat.mean.is_nan() && stat.max.is_nan());
    }
    let last = stats[3];
    assert_eq!(last.min, -4.0);
    assert_eq!(last.mean, (3.0 + -4.0) / 2.0);
    assert_eq!(last.max, 3.0);
}

#[tokio::test]
async fn infinities_aggregate_arithmetically() {
    let inf = f64::INFINITY;
    let times: Vec<i64> = (0..8).map(|i| i * 1000).collect();
    let values = vec![inf, -inf, inf, 0.5, -0.25, -inf, 2.0, 8.0];

    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;
    stream.insert_values(&ctx, &times, &values).await.expect("insert");

    let (points, _) = stream.raw_values(&ctx, 0, 7001, 0).collect().await.expect("raw query");
    assert_eq!(points.len(), values.len());
    for (index, point) in points.iter().enumerate() {
        assert_eq!(point.value.to_bits(), values[index].to_bits());
    }

    let (stats, _) = stream.windows(&ctx, 0, 10_000, 2000, 0, 0).collect().await.expect("windows");
    assert_eq!(stats.len(), 4);

    assert_eq!(stats[0].min, -inf);
    assert!(stats[0].mean.is_nan());
    assert_eq!(stats[0].max, inf);

    assert_eq!(stats[1].min, 0.5);
    assert_eq!(stats[1].mean, inf);
    assert_eq!(stats[1].max, inf);

    assert_eq!(stats[2].min, -inf);
    assert_eq!(stats[2].mean, -inf);
    assert_eq!(stats[2].max, -0.25);

    assert_eq!(stats[3].min, 2.0);
    assert_eq!(stats[3].mean, 5.0);
    assert_eq!(stats[3].max, 8.0);
}

#[tokio::test]
async fn aligned_windows_align_to_power_of_two_boundaries() {
    let times: Vec<i64> = (0..8).map(|i| i * 1000).collect();
    let values: Vec<f64> = (0..8).map(|i| i as f64).collect();

    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;
    stream.insert_values(&ctx, &times, &values).await.expect("insert");

    // 2^11 = 2048ns windows over [0, 8192).
    let (stats, _) =
        stream.aligned_windows(&ctx, 0, 8192, 11, 0).collect().await.expect("aligned windows");
    assert_eq!(stats.len(), 4);
    let expected: [(i64, u64); 4] = [(0, 3), (2048, 2), (4096, 2), (6144, 1)];
    for (stat, (time, count)) in stats.iter().zip(expected) {
        assert_eq!(stat.time, time);
        assert_eq!(stat.count, count);
    }
    assert_eq!(stats[0].min, 0.0);
    assert_eq!(stats[0].max, 2.0);
    assert_eq!(stats[3].mean, 7.0);
}

#[tokio::test]
async fn query_outside_valid_range_fails() {
    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;
    stream.insert(&ctx, &[RawPoint { time: 0, value: 1.0 }]).await.expect("insert");

    let err = stream
        .raw_values(&ctx, MIN_TIME - 1, 100, 0)
        .collect()
        .await
        .expect_err("below valid range");
    assert_eq!(err.code(), codes::INVALID_TIME_RANGE);
}

#[tokio::test]
async fn insert_values_rejects_mismatched_lengths() {
    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;
    let err = stream
        .insert_values(&ctx, &[1, 2, 3], &[1.0, 2.0])
        .await
        .expect_err("length mismatch");
    assert_eq!(err.code(), codes::INVALID_ARGUMENTS);
}

#[tokio::test]
async fn delete_range_removes_the_interval() {
    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;
    let times: Vec<i64> = (0..10).map(|i| i * 100).collect();
    let values: Vec<f64> = (0..10).map(|i| i as f64).collect();
    stream.insert_values(&ctx, &times, &values).await.expect("insert");

    stream.delete_range(&ctx, 200, 700).await.expect("delete");
    let (points, _) = stream.raw_values(&ctx, 0, 1000, 0).collect().await.expect("query");
    let remaining: Vec<i64> = points.iter().map(|point| point.time).collect();
    assert_eq!(remaining, vec![0, 100, 700, 800, 900]);
}

#[tokio::test]
async fn flush_reports_a_growing_version() {
    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;
    let before = stream.flush(&ctx).await.expect("flush");
    stream.insert(&ctx, &[RawPoint { time: 1, value: 1.0 }]).await.expect("insert");
    stream.insert(&ctx, &[RawPoint { time: 2, value: 2.0 }]).await.expect("insert");
    let after = stream.flush(&ctx).await.expect("flush");
    assert!(after > before, "version must grow with writes ({before} -> {after})");
}

#[tokio::test]
async fn create_twice_fails() {
    let (_cluster, client, ctx) = start_cluster(2).await;
    let stream = create_stream(&client, &ctx).await;
    let err = client
        .create(&ctx, stream.id(), "test.duplicate", Default::default(), None)
        .await
        .expect_err("duplicate create");
    assert_eq!(err.code(), codes::INVALID_ARGUMENTS);
}
