//! The user-facing driver handle and per-stream operations.

use std::collections::BTreeMap;
use std::sync::Arc;

use rill_client_api::RawPoint;
use rill_client_api::StatPoint;
use rill_client_api::Status;
use rill_client_api::codes;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::Result;
use crate::dispatch::dispatch_any;
use crate::dispatch::dispatch_streaming;
use crate::dispatch::dispatch_unary;
use crate::endpoint::connect_endpoint;
use crate::endpoint::extract_raw;
use crate::endpoint::extract_stats;
use crate::mash::Mash;
use crate::query_stream::QueryStream;
use crate::router::Router;

/// Endpoint addresses from the `RILL_ENDPOINTS` environment variable,
/// comma-separated. Empty when unset.
pub fn endpoints_from_env() -> Vec<String> {
    std::env::var("RILL_ENDPOINTS")
        .map(|raw| {
            raw.split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// A handle to a Rill cluster.
///
/// Cheap to clone; clones share the routing state and connection pool. A
/// single endpoint is enough to connect, but more candidates make the
/// initial connection robust to cluster changes. Different addresses for
/// the same node are permitted.
///
/// After [`disconnect`](Self::disconnect) every operation on this handle
/// (and on its [`Stream`]s) fails with a disconnected status.
#[derive(Clone)]
pub struct RillClient {
    router: Arc<Router>,
}

impl std::fmt::Debug for RillClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RillClient").finish()
    }
}

impl RillClient {
    /// Connect to a cluster via the given candidate endpoints.
    ///
    /// Candidates are tried in order; the first that both accepts a
    /// connection and answers an info request seeds the routing snapshot.
    pub async fn connect(ctx: &CancellationToken, endpoints: &[String]) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Status::invalid_arguments("no endpoints provided"));
        }
        for address in endpoints {
            if ctx.is_cancelled() {
                return Err(Status::cancelled());
            }
            let endpoint = match connect_endpoint(ctx, std::slice::from_ref(address)).await {
                Ok(endpoint) => endpoint,
                Err(status) => {
                    if status.code() == codes::CANCELLED {
                        return Err(status);
                    }
                    debug!(%address, error = %status, "seed endpoint unreachable");
                    continue;
                }
            };
            let probed = endpoint.info(ctx).await;
            let _ = endpoint.disconnect();
            match probed {
                Ok(mash) => {
                    debug!(%address, revision = mash.revision(), "connected to cluster");
                    return Ok(Self { router: Arc::new(Router::new(mash)) });
                }
                Err(status) => {
                    if status.code() == codes::CANCELLED {
                        return Err(status);
                    }
                    debug!(%address, error = %status, "seed endpoint refused info");
                }
            }
        }
        Err(Status::unreachable("could not connect to cluster via provided endpoints"))
    }

    /// Close every cached endpoint and mark the handle closed.
    ///
    /// Closing is best-effort across the pool; the last close error observed
    /// is returned. A second call is a no-op returning `Ok`.
    pub fn disconnect(&self) -> Result<()> {
        self.router.disconnect_all()
    }

    /// The cluster's current routing snapshot, fetched from any endpoint.
    pub async fn info(&self, ctx: &CancellationToken) -> Result<Mash> {
        let ctx_op = ctx.clone();
        dispatch_any(&self.router, ctx, move |endpoint| {
            let ctx = ctx_op.clone();
            async move { endpoint.info(&ctx).await }
        })
        .await
    }

    /// Create a stream and return its handle.
    pub async fn create(
        &self,
        ctx: &CancellationToken,
        id: Uuid,
        collection: &str,
        tags: BTreeMap<String, String>,
        annotation: Option<Vec<u8>>,
    ) -> Result<Stream> {
        let collection = collection.to_string();
        let ctx_op = ctx.clone();
        let op_collection = collection.clone();
        dispatch_unary(&self.router, ctx, id, move |endpoint| {
            let ctx = ctx_op.clone();
            let collection = op_collection.clone();
            let tags = tags.clone();
            let annotation = annotation.clone();
            async move { endpoint.create(&ctx, id, collection, tags, annotation).await }
        })
        .await?;
        Ok(Stream { router: Arc::clone(&self.router), id, collection: Some(collection) })
    }

    /// A handle to an existing stream. No I/O is performed; operations on
    /// the handle fail if the stream does not exist.
    pub fn stream_from_id(&self, id: Uuid) -> Stream {
        Stream { router: Arc::clone(&self.router), id, collection: None }
    }

    /// Low level: the endpoint that services writes for a stream id,
    /// dialing and caching it if necessary.
    pub async fn endpoint_for(
        &self,
        ctx: &CancellationToken,
        stream: Uuid,
    ) -> Result<Arc<crate::Endpoint>> {
        self.router.endpoint_for(ctx, &stream).await
    }

    /// Low level: the endpoint that services reads for a stream id.
    /// Identical policy to [`endpoint_for`](Self::endpoint_for) today.
    pub async fn read_endpoint_for(
        &self,
        ctx: &CancellationToken,
        stream: Uuid,
    ) -> Result<Arc<crate::Endpoint>> {
        self.router.read_endpoint_for(ctx, &stream).await
    }

    /// Low level: the endpoint for a routing hash.
    pub async fn endpoint_for_hash(
        &self,
        ctx: &CancellationToken,
        hash: u32,
    ) -> Result<Arc<crate::Endpoint>> {
        self.router.endpoint_for_hash(ctx, hash).await
    }

    /// Low level: any open endpoint, for calls not bound to a stream.
    pub async fn any_endpoint(&self, ctx: &CancellationToken) -> Result<Arc<crate::Endpoint>> {
        self.router.any_endpoint(ctx).await
    }
}

/// A handle to one stream of a Rill cluster.
///
/// All operations route to the stream's owner node through the shared
/// connection pool and transparently re-dispatch when the cluster topology
/// has moved the stream.
#[derive(Clone)]
pub struct Stream {
    router: Arc<Router>,
    id: Uuid,
    collection: Option<String>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("collection", &self.collection)
            .finish()
    }
}

impl Stream {
    /// The stream identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The collection this handle was created under, when known.
    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// Insert a batch of raw points.
    pub async fn insert(&self, ctx: &CancellationToken, points: &[RawPoint]) -> Result<()> {
        let id = self.id;
        let points = points.to_vec();
        let ctx_op = ctx.clone();
        dispatch_unary(&self.router, ctx, id, move |endpoint| {
            let ctx = ctx_op.clone();
            let points = points.clone();
            async move { endpoint.insert(&ctx, id, points).await }
        })
        .await
    }

    /// Insert parallel time and value arrays.
    pub async fn insert_values(
        &self,
        ctx: &CancellationToken,
        times: &[i64],
        values: &[f64],
    ) -> Result<()> {
        if times.len() != values.len() {
            return Err(Status::invalid_arguments("times and values must have equal length"));
        }
        let id = self.id;
        let times = times.to_vec();
        let values = values.to_vec();
        let ctx_op = ctx.clone();
        dispatch_unary(&self.router, ctx, id, move |endpoint| {
            let ctx = ctx_op.clone();
            let times = times.clone();
            let values = values.clone();
            async move { endpoint.insert_values(&ctx, id, times, values).await }
        })
        .await
    }

    /// Delete every point in `[start, end)`.
    pub async fn delete_range(&self, ctx: &CancellationToken, start: i64, end: i64) -> Result<()> {
        let id = self.id;
        let ctx_op = ctx.clone();
        dispatch_unary(&self.router, ctx, id, move |endpoint| {
            let ctx = ctx_op.clone();
            async move { endpoint.delete_range(&ctx, id, start, end).await }
        })
        .await
    }

    /// Force buffered writes to durable storage; returns the stream version.
    pub async fn flush(&self, ctx: &CancellationToken) -> Result<u64> {
        let id = self.id;
        let ctx_op = ctx.clone();
        dispatch_unary(&self.router, ctx, id, move |endpoint| {
            let ctx = ctx_op.clone();
            async move { endpoint.flush(&ctx, id).await }
        })
        .await
    }

    /// Find the point nearest to `time`, with the version it was read at.
    ///
    /// Forward search is inclusive of `time`; backward search is exclusive.
    pub async fn nearest(
        &self,
        ctx: &CancellationToken,
        time: i64,
        version: u64,
        backward: bool,
    ) -> Result<(RawPoint, u64)> {
        let id = self.id;
        let ctx_op = ctx.clone();
        dispatch_unary(&self.router, ctx, id, move |endpoint| {
            let ctx = ctx_op.clone();
            async move { endpoint.nearest(&ctx, id, time, version, backward).await }
        })
        .await
    }

    /// Stream every raw point in `[start, end)`, in increasing time order.
    ///
    /// Returns immediately; points, the version, and the terminal status
    /// arrive through the [`QueryStream`]. `version` zero queries the latest.
    pub fn raw_values(
        &self,
        ctx: &CancellationToken,
        start: i64,
        end: i64,
        version: u64,
    ) -> QueryStream<RawPoint> {
        let id = self.id;
        let ctx_op = ctx.clone();
        dispatch_streaming(
            Arc::clone(&self.router),
            ctx.clone(),
            id,
            move |endpoint| {
                let ctx = ctx_op.clone();
                async move { endpoint.open_raw_values(&ctx, id, start, end, version).await }
            },
            extract_raw,
        )
    }

    /// Stream statistics of consecutive `width`-nanosecond windows covering
    /// `[start, end)`. Empty windows are omitted.
    pub fn windows(
        &self,
        ctx: &CancellationToken,
        start: i64,
        end: i64,
        width: u64,
        depth: u8,
        version: u64,
    ) -> QueryStream<StatPoint> {
        if width == 0 {
            return QueryStream::failed(Status::invalid_arguments("window width must be nonzero"));
        }
        let id = self.id;
        let ctx_op = ctx.clone();
        dispatch_streaming(
            Arc::clone(&self.router),
            ctx.clone(),
            id,
            move |endpoint| {
                let ctx = ctx_op.clone();
                async move { endpoint.open_windows(&ctx, id, start, end, width, depth, version).await }
            },
            extract_stats,
        )
    }

    /// Stream statistics of power-of-two windows, `1 << pointwidth`
    /// nanoseconds wide, aligned to multiples of the width. Empty windows
    /// are omitted.
    pub fn aligned_windows(
        &self,
        ctx: &CancellationToken,
        start: i64,
        end: i64,
        pointwidth: u8,
        version: u64,
    ) -> QueryStream<StatPoint> {
        if pointwidth >= 63 {
            return QueryStream::failed(Status::invalid_arguments("pointwidth must be below 63"));
        }
        let id = self.id;
        let ctx_op = ctx.clone();
        dispatch_streaming(
            Arc::clone(&self.router),
            ctx.clone(),
            id,
            move |endpoint| {
                let ctx = ctx_op.clone();
                async move {
                    endpoint.open_aligned_windows(&ctx, id, start, end, pointwidth, version).await
                }
            },
            extract_stats,
        )
    }
}
