//! One multiplexed connection to one cluster node.
//!
//! An [`Endpoint`] owns a single TCP connection and two background tasks: a
//! writer draining a queue of request frames, and a reader demultiplexing
//! reply frames by request id into per-call channels. Any number of calls
//! share the connection concurrently; a lost connection fails every pending
//! call with an unreachable status and leaves the endpoint permanently
//! closed. Transport failures do not remove the endpoint from the routing
//! cache; the caller sees the error and decides.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use parking_lot::Mutex;
use rill_client_api::MAX_WIRE_MESSAGE_SIZE;
use rill_client_api::NodeRequest;
use rill_client_api::RawPoint;
use rill_client_api::ReplyBody;
use rill_client_api::RequestFrame;
use rill_client_api::StatPoint;
use rill_client_api::Status;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::codec::FramedWrite;
use tokio_util::codec::LengthDelimitedCodec;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::Result;
use crate::constants::CALL_REPLY_BUFFER;
use crate::constants::REQUEST_QUEUE_DEPTH;
use crate::constants::STREAM_POINT_BUFFER;
use crate::mash::Mash;
use crate::query_stream::QuerySink;
use crate::query_stream::QueryStream;
use crate::query_stream::query_channel;

type PendingMap = Arc<Mutex<HashMap<u64, mpsc::Sender<ReplyBody>>>>;

/// A connection handle to a single cluster node.
pub struct Endpoint {
    address: String,
    requests: mpsc::Sender<RequestFrame>,
    pending: PendingMap,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .finish()
    }
}

/// Dial an endpoint, trying `addresses` in order.
///
/// The addresses are alternates for the same node; the first that yields a
/// live connection wins. Cancelling `ctx` aborts the remaining dials. When
/// every address fails the result is an unreachable status carrying the last
/// dial error.
pub async fn connect_endpoint(
    ctx: &CancellationToken,
    addresses: &[String],
) -> Result<Arc<Endpoint>> {
    if addresses.is_empty() {
        return Err(Status::invalid_arguments("no addresses for endpoint"));
    }
    let mut last_err: Option<std::io::Error> = None;
    for address in addresses {
        let stream = tokio::select! {
            _ = ctx.cancelled() => return Err(Status::cancelled()),
            result = TcpStream::connect(address.as_str()) => match result {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(%address, error = %err, "dial failed, trying next address");
                    last_err = Some(err);
                    continue;
                }
            }
        };
        let _ = stream.set_nodelay(true);
        debug!(%address, "endpoint connected");
        return Ok(Endpoint::start(address.clone(), stream));
    }
    Err(match last_err {
        Some(err) => Status::unreachable(format!("could not reach endpoint: {err}")),
        None => Status::unreachable("could not reach endpoint"),
    })
}

fn wire_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_WIRE_MESSAGE_SIZE)
        .new_codec()
}

impl Endpoint {
    fn start(address: String, stream: TcpStream) -> Arc<Self> {
        let (read_half, write_half) = stream.into_split();
        let reader = FramedRead::new(read_half, wire_codec());
        let writer = FramedWrite::new(write_half, wire_codec());
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        tokio::spawn(write_loop(writer, requests_rx, Arc::clone(&pending), shutdown.clone()));
        tokio::spawn(read_loop(reader, Arc::clone(&pending), shutdown.clone()));

        Arc::new(Self { address, requests: requests_tx, pending, next_id: AtomicU64::new(1), shutdown })
    }

    /// The address this endpoint was dialed on.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Close the connection and fail every pending call.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub fn disconnect(&self) -> Result<()> {
        self.shutdown.cancel();
        fail_all(&self.pending, Status::disconnected());
        Ok(())
    }

    fn register_call(&self) -> (u64, mpsc::Receiver<ReplyBody>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CALL_REPLY_BUFFER);
        self.pending.lock().insert(id, tx);
        (id, rx)
    }

    fn unregister_call(&self, id: u64) {
        self.pending.lock().remove(&id);
    }

    async fn send_request(&self, ctx: &CancellationToken, id: u64, body: NodeRequest) -> Result<()> {
        let frame = RequestFrame { id, body };
        tokio::select! {
            _ = ctx.cancelled() => {
                self.unregister_call(id);
                Err(Status::cancelled())
            }
            _ = self.shutdown.cancelled() => {
                self.unregister_call(id);
                Err(Status::unreachable("endpoint is closed"))
            }
            sent = self.requests.send(frame) => match sent {
                Ok(()) => Ok(()),
                Err(_) => {
                    self.unregister_call(id);
                    Err(Status::unreachable("endpoint is closed"))
                }
            }
        }
    }

    async fn call_unary(&self, ctx: &CancellationToken, body: NodeRequest) -> Result<ReplyBody> {
        let (id, mut replies) = self.register_call();
        self.send_request(ctx, id, body).await?;
        tokio::select! {
            _ = ctx.cancelled() => {
                self.unregister_call(id);
                Err(Status::cancelled())
            }
            reply = replies.recv() => match reply {
                Some(ReplyBody::Error { status }) => Err(status),
                Some(body) => Ok(body),
                None => Err(Status::unreachable("connection lost before reply")),
            }
        }
    }

    /// Register a streaming call and send its request. The caller owns the
    /// reply channel and drives it with [`drive_stream`].
    pub(crate) async fn open_stream(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        body: NodeRequest,
    ) -> Result<StreamCall> {
        let (id, replies) = self.register_call();
        self.send_request(ctx, id, body).await?;
        Ok(StreamCall { endpoint: Arc::clone(self), id, replies })
    }

    /// Start a streaming call with its own forwarder task. The returned
    /// stream is live before any reply has arrived.
    async fn call_streaming<T>(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        body: NodeRequest,
        extract: fn(ReplyBody) -> Result<Vec<T>>,
    ) -> Result<QueryStream<T>>
    where
        T: Send + 'static,
    {
        let call = self.open_stream(ctx, body).await?;
        let (sink, stream) = query_channel(STREAM_POINT_BUFFER);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let StreamOutcome::Finished { version, status, .. } =
                drive_stream(call, &ctx, &sink, extract).await
            {
                sink.finish(version, status);
            }
        });
        Ok(stream)
    }

    /// Ask the node for its current view of the cluster.
    pub async fn info(&self, ctx: &CancellationToken) -> Result<Mash> {
        match self.call_unary(ctx, NodeRequest::Info).await? {
            ReplyBody::Info { mash } => Ok(Mash::from_description(mash)),
            other => Err(unexpected_reply("info", &other)),
        }
    }

    /// Create a stream on this node.
    pub async fn create(
        &self,
        ctx: &CancellationToken,
        stream: Uuid,
        collection: String,
        tags: BTreeMap<String, String>,
        annotation: Option<Vec<u8>>,
    ) -> Result<()> {
        match self.call_unary(ctx, NodeRequest::Create { stream, collection, tags, annotation }).await? {
            ReplyBody::Ack => Ok(()),
            other => Err(unexpected_reply("create", &other)),
        }
    }

    /// Insert a batch of raw points.
    pub async fn insert(
        &self,
        ctx: &CancellationToken,
        stream: Uuid,
        points: Vec<RawPoint>,
    ) -> Result<()> {
        match self.call_unary(ctx, NodeRequest::Insert { stream, points }).await? {
            ReplyBody::Ack => Ok(()),
            other => Err(unexpected_reply("insert", &other)),
        }
    }

    /// Insert parallel time and value arrays.
    pub async fn insert_values(
        &self,
        ctx: &CancellationToken,
        stream: Uuid,
        times: Vec<i64>,
        values: Vec<f64>,
    ) -> Result<()> {
        match self.call_unary(ctx, NodeRequest::InsertValues { stream, times, values }).await? {
            ReplyBody::Ack => Ok(()),
            other => Err(unexpected_reply("insert values", &other)),
        }
    }

    /// Delete every point in `[start, end)`.
    pub async fn delete_range(
        &self,
        ctx: &CancellationToken,
        stream: Uuid,
        start: i64,
        end: i64,
    ) -> Result<()> {
        match self.call_unary(ctx, NodeRequest::DeleteRange { stream, start, end }).await? {
            ReplyBody::Ack => Ok(()),
            other => Err(unexpected_reply("delete range", &other)),
        }
    }

    /// Flush buffered writes for a stream; returns the stream version.
    pub async fn flush(&self, ctx: &CancellationToken, stream: Uuid) -> Result<u64> {
        match self.call_unary(ctx, NodeRequest::Flush { stream }).await? {
            ReplyBody::Version { version } => Ok(version),
            other => Err(unexpected_reply("flush", &other)),
        }
    }

    /// Find the nearest point to `time`.
    pub async fn nearest(
        &self,
        ctx: &CancellationToken,
        stream: Uuid,
        time: i64,
        version: u64,
        backward: bool,
    ) -> Result<(RawPoint, u64)> {
        match self.call_unary(ctx, NodeRequest::Nearest { stream, time, version, backward }).await? {
            ReplyBody::Point { point, version } => Ok((point, version)),
            other => Err(unexpected_reply("nearest", &other)),
        }
    }

    /// Stream raw points in `[start, end)`.
    pub async fn raw_values(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        stream: Uuid,
        start: i64,
        end: i64,
        version: u64,
    ) -> Result<QueryStream<RawPoint>> {
        self.call_streaming(ctx, NodeRequest::RawValues { stream, start, end, version }, extract_raw)
            .await
    }

    /// Stream window statistics over `[start, end)`.
    pub async fn windows(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        stream: Uuid,
        start: i64,
        end: i64,
        width: u64,
        depth: u8,
        version: u64,
    ) -> Result<QueryStream<StatPoint>> {
        self.call_streaming(
            ctx,
            NodeRequest::Windows { stream, start, end, width, depth, version },
            extract_stats,
        )
        .await
    }

    /// Stream aligned power-of-two window statistics over `[start, end)`.
    pub async fn aligned_windows(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        stream: Uuid,
        start: i64,
        end: i64,
        pointwidth: u8,
        version: u64,
    ) -> Result<QueryStream<StatPoint>> {
        self.call_streaming(
            ctx,
            NodeRequest::AlignedWindows { stream, start, end, pointwidth, version },
            extract_stats,
        )
        .await
    }
}

impl Endpoint {
    /// Open a raw-values streaming call without attaching a forwarder.
    pub(crate) async fn open_raw_values(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        stream: Uuid,
        start: i64,
        end: i64,
        version: u64,
    ) -> Result<StreamCall> {
        self.open_stream(ctx, NodeRequest::RawValues { stream, start, end, version }).await
    }

    /// Open a windows streaming call without attaching a forwarder.
    pub(crate) async fn open_windows(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        stream: Uuid,
        start: i64,
        end: i64,
        width: u64,
        depth: u8,
        version: u64,
    ) -> Result<StreamCall> {
        self.open_stream(ctx, NodeRequest::Windows { stream, start, end, width, depth, version })
            .await
    }

    /// Open an aligned-windows streaming call without attaching a forwarder.
    pub(crate) async fn open_aligned_windows(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        stream: Uuid,
        start: i64,
        end: i64,
        pointwidth: u8,
        version: u64,
    ) -> Result<StreamCall> {
        self.open_stream(ctx, NodeRequest::AlignedWindows { stream, start, end, pointwidth, version })
            .await
    }
}

/// Pull the raw-point payload out of a streamed reply body.
pub(crate) fn extract_raw(body: ReplyBody) -> Result<Vec<RawPoint>> {
    match body {
        ReplyBody::RawBatch { points } => Ok(points),
        other => Err(unexpected_reply("raw values", &other)),
    }
}

/// Pull the statistics payload out of a streamed reply body.
pub(crate) fn extract_stats(body: ReplyBody) -> Result<Vec<StatPoint>> {
    match body {
        ReplyBody::StatBatch { points } => Ok(points),
        other => Err(unexpected_reply("windows", &other)),
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn unexpected_reply(op: &str, body: &ReplyBody) -> Status {
    Status::unreachable(format!("unexpected reply to {op}: {body:?}"))
}

/// Fail one pending call, if still registered.
fn fail_call(pending: &PendingMap, id: u64, status: Status) {
    if let Some(tx) = pending.lock().remove(&id) {
        let _ = tx.try_send(ReplyBody::Error { status });
    }
}

/// Fail every pending call and clear the map.
fn fail_all(pending: &PendingMap, status: Status) {
    let senders: Vec<mpsc::Sender<ReplyBody>> = {
        let mut map = pending.lock();
        map.drain().map(|(_, tx)| tx).collect()
    };
    for tx in senders {
        let _ = tx.try_send(ReplyBody::Error { status: status.clone() });
    }
}

async fn write_loop(
    mut writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    mut requests: mpsc::Receiver<RequestFrame>,
    pending: PendingMap,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = requests.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let bytes = match rill_client_api::encode_request(&frame) {
            Ok(bytes) => bytes,
            Err(status) => {
                fail_call(&pending, frame.id, status);
                continue;
            }
        };
        if let Err(err) = writer.send(Bytes::from(bytes)).await {
            warn!(error = %err, "endpoint write failed");
            fail_all(&pending, Status::unreachable(format!("connection lost: {err}")));
            shutdown.cancel();
            break;
        }
    }
}

async fn read_loop(
    mut reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    pending: PendingMap,
    shutdown: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => break,
            item = reader.next() => item,
        };
        let bytes = match item {
            Some(Ok(bytes)) => bytes,
            Some(Err(err)) => {
                warn!(error = %err, "endpoint read failed");
                fail_all(&pending, Status::unreachable(format!("connection lost: {err}")));
                shutdown.cancel();
                break;
            }
            None => {
                fail_all(&pending, Status::unreachable("connection closed by node"));
                shutdown.cancel();
                break;
            }
        };
        let frame = match rill_client_api::decode_reply(&bytes) {
            Ok(frame) => frame,
            Err(status) => {
                warn!(error = %status, "undecodable reply frame");
                fail_all(&pending, status);
                shutdown.cancel();
                break;
            }
        };
        let terminal = frame.body.is_terminal();
        let sender = {
            let mut map = pending.lock();
            if terminal { map.remove(&frame.id) } else { map.get(&frame.id).cloned() }
        };
        let Some(sender) = sender else {
            debug!(id = frame.id, "reply for unknown call");
            continue;
        };
        if sender.send(frame.body).await.is_err() {
            // The caller went away; discard the rest of its replies.
            pending.lock().remove(&frame.id);
        }
    }
}

/// An in-flight streaming call: the reply channel plus the bookkeeping
/// needed to abandon it cleanly.
pub(crate) struct StreamCall {
    endpoint: Arc<Endpoint>,
    id: u64,
    replies: mpsc::Receiver<ReplyBody>,
}

/// How a driven streaming call ended.
pub(crate) enum StreamOutcome {
    /// The call reached a terminal state. `delivered` counts points handed
    /// to the sink before it.
    Finished {
        version: u64,
        status: Result<()>,
        delivered: u64,
    },
    /// The consumer dropped the stream; the call was abandoned and no
    /// terminal state is observable.
    ConsumerGone,
}

/// Drive one streaming call to completion, forwarding its points into
/// `sink`. The sink is not finished here; the caller decides what to do
/// with the outcome (finish, or re-dispatch when nothing was delivered).
pub(crate) async fn drive_stream<T>(
    mut call: StreamCall,
    ctx: &CancellationToken,
    sink: &QuerySink<T>,
    extract: fn(ReplyBody) -> Result<Vec<T>>,
) -> StreamOutcome {
    let mut delivered = 0u64;
    loop {
        let reply = tokio::select! {
            _ = ctx.cancelled() => {
                call.endpoint.unregister_call(call.id);
                return StreamOutcome::Finished {
                    version: 0,
                    status: Err(Status::cancelled()),
                    delivered,
                };
            }
            reply = call.replies.recv() => reply,
        };
        match reply {
            Some(ReplyBody::Final { version, status }) => {
                return StreamOutcome::Finished {
                    version,
                    status: match status {
                        Some(status) => Err(status),
                        None => Ok(()),
                    },
                    delivered,
                };
            }
            Some(ReplyBody::Error { status }) => {
                return StreamOutcome::Finished { version: 0, status: Err(status), delivered };
            }
            Some(body) => {
                let points = match extract(body) {
                    Ok(points) => points,
                    Err(status) => {
                        call.endpoint.unregister_call(call.id);
                        return StreamOutcome::Finished {
                            version: 0,
                            status: Err(status),
                            delivered,
                        };
                    }
                };
                for point in points {
                    let sent = tokio::select! {
                        _ = ctx.cancelled() => None,
                        sent = sink.send(point) => Some(sent),
                    };
                    match sent {
                        None => {
                            call.endpoint.unregister_call(call.id);
                            return StreamOutcome::Finished {
                                version: 0,
                                status: Err(Status::cancelled()),
                                delivered,
                            };
                        }
                        Some(false) => {
                            call.endpoint.unregister_call(call.id);
                            return StreamOutcome::ConsumerGone;
                        }
                        Some(true) => delivered += 1,
                    }
                }
            }
            None => {
                return StreamOutcome::Finished {
                    version: 0,
                    status: Err(Status::unreachable("connection lost during stream")),
                    delivered,
                };
            }
        }
    }
}
