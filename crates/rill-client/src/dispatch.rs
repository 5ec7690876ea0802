//! Retry dispatch: the wrong-endpoint cure.
//!
//! A node that no longer owns a stream answers with a wrong-endpoint status.
//! For unary operations the cure is transparent: refresh the routing
//! snapshot and re-dispatch, up to a bounded number of attempts. For
//! streaming operations the cure is only correctness-preserving while
//! nothing has been delivered to the caller, so a terminal wrong-endpoint
//! after any delivery is surfaced rather than retried.

use std::future::Future;
use std::sync::Arc;

use rill_client_api::Status;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::Result;
use crate::constants::MAX_OP_RETRIES;
use crate::constants::STREAM_POINT_BUFFER;
use crate::endpoint::Endpoint;
use crate::endpoint::StreamCall;
use crate::endpoint::StreamOutcome;
use crate::endpoint::drive_stream;
use crate::query_stream::QueryStream;
use crate::query_stream::query_channel;
use crate::router::Router;

/// Run a unary operation against the owner of `stream`, re-dispatching on
/// wrong-endpoint until the retry budget is spent.
pub(crate) async fn dispatch_unary<T, F, Fut>(
    router: &Arc<Router>,
    ctx: &CancellationToken,
    stream: Uuid,
    op: F,
) -> Result<T>
where
    F: Fn(Arc<Endpoint>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0u32;
    loop {
        if ctx.is_cancelled() {
            return Err(Status::cancelled());
        }
        let observed = router.mash().revision();
        let endpoint = router.endpoint_for(ctx, &stream).await?;
        match op(Arc::clone(&endpoint)).await {
            Err(status) if status.is_wrong_endpoint() && retries < MAX_OP_RETRIES => {
                retries += 1;
                debug!(
                    %stream,
                    retries,
                    address = endpoint.address(),
                    "wrong endpoint, refreshing routing snapshot"
                );
                router.resync_mash(observed).await?;
            }
            result => return result,
        }
    }
}

/// Run a unary operation against any endpoint, re-dispatching on
/// wrong-endpoint. Used for administrative calls not bound to a stream.
pub(crate) async fn dispatch_any<T, F, Fut>(
    router: &Arc<Router>,
    ctx: &CancellationToken,
    op: F,
) -> Result<T>
where
    F: Fn(Arc<Endpoint>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0u32;
    loop {
        if ctx.is_cancelled() {
            return Err(Status::cancelled());
        }
        let observed = router.mash().revision();
        let endpoint = router.any_endpoint(ctx).await?;
        match op(Arc::clone(&endpoint)).await {
            Err(status) if status.is_wrong_endpoint() && retries < MAX_OP_RETRIES => {
                retries += 1;
                router.resync_mash(observed).await?;
            }
            result => return result,
        }
    }
}

/// Run a streaming operation against the read endpoint for `stream`.
///
/// The returned stream is live immediately; one dispatch task routes the
/// call, drives the wire replies into the stream, and finishes it with the
/// version and terminal status. A terminal wrong-endpoint is re-dispatched
/// only while zero points have been delivered; after any delivery it is
/// surfaced.
pub(crate) fn dispatch_streaming<T, F, Fut>(
    router: Arc<Router>,
    ctx: CancellationToken,
    stream: Uuid,
    op: F,
    extract: fn(rill_client_api::ReplyBody) -> Result<Vec<T>>,
) -> QueryStream<T>
where
    T: Send + 'static,
    F: Fn(Arc<Endpoint>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<StreamCall>> + Send + 'static,
{
    let (sink, out) = query_channel(STREAM_POINT_BUFFER);
    tokio::spawn(async move {
        let mut retries = 0u32;
        loop {
            if ctx.is_cancelled() {
                sink.finish(0, Err(Status::cancelled()));
                return;
            }
            let observed = router.mash().revision();
            let endpoint = match router.read_endpoint_for(&ctx, &stream).await {
                Ok(endpoint) => endpoint,
                Err(status) => {
                    sink.finish(0, Err(status));
                    return;
                }
            };
            let call = match op(Arc::clone(&endpoint)).await {
                Ok(call) => call,
                Err(status) => {
                    sink.finish(0, Err(status));
                    return;
                }
            };

            match drive_stream(call, &ctx, &sink, extract).await {
                StreamOutcome::ConsumerGone => return,
                StreamOutcome::Finished { version, status, delivered } => match status {
                    Err(status)
                        if status.is_wrong_endpoint()
                            && delivered == 0
                            && retries < MAX_OP_RETRIES =>
                    {
                        retries += 1;
                        debug!(
                            %stream,
                            retries,
                            address = endpoint.address(),
                            "wrong endpoint before any delivery, redispatching query"
                        );
                        if let Err(fatal) = router.resync_mash(observed).await {
                            sink.finish(0, Err(fatal));
                            return;
                        }
                    }
                    status => {
                        sink.finish(version, status);
                        return;
                    }
                },
            }
        }
    });
    out
}
