//! The delivery contract for streaming queries.

use rill_client_api::Status;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::Result;

/// The consumer half of a streaming query.
///
/// A streaming call hands back a `QueryStream` immediately, before any reply
/// from the node. Three things flow through it:
///
/// - a finite sequence of points, read with [`next`](Self::next);
/// - the version of the snapshot the query ran against;
/// - the terminal status of the call.
///
/// The version and the status are each delivered exactly once, strictly
/// after the point sequence has ended. Points already read stay valid even
/// when the call ends in an error; partial delivery is never retracted.
///
/// Callers must drain the point sequence; [`finish`](Self::finish) and
/// [`collect`](Self::collect) do so on your behalf. Dropping the stream
/// abandons the call: in-flight replies are discarded and no status is
/// observable.
#[derive(Debug)]
pub struct QueryStream<T> {
    points: mpsc::Receiver<T>,
    version: oneshot::Receiver<u64>,
    status: oneshot::Receiver<Result<()>>,
}

/// The producer half, held by the forwarder task of a streaming call.
#[derive(Debug)]
pub(crate) struct QuerySink<T> {
    points: mpsc::Sender<T>,
    version: oneshot::Sender<u64>,
    status: oneshot::Sender<Result<()>>,
}

/// Create a connected sink/stream pair with the given point buffer.
pub(crate) fn query_channel<T>(buffer: usize) -> (QuerySink<T>, QueryStream<T>) {
    let (points_tx, points_rx) = mpsc::channel(buffer);
    let (version_tx, version_rx) = oneshot::channel();
    let (status_tx, status_rx) = oneshot::channel();
    (
        QuerySink { points: points_tx, version: version_tx, status: status_tx },
        QueryStream { points: points_rx, version: version_rx, status: status_rx },
    )
}

impl<T> QuerySink<T> {
    /// Deliver one point. Returns false when the consumer is gone.
    pub(crate) async fn send(&self, value: T) -> bool {
        self.points.send(value).await.is_ok()
    }

    /// Terminate the call: close the point sequence, then deliver the
    /// version and the terminal status, in that order.
    pub(crate) fn finish(self, version: u64, status: Result<()>) {
        drop(self.points);
        let _ = self.version.send(version);
        let _ = self.status.send(status);
    }
}

impl<T> QueryStream<T> {
    /// A stream that failed before dispatch: no points, version zero, the
    /// given terminal status.
    pub(crate) fn failed(status: Status) -> Self {
        let (sink, stream) = query_channel(1);
        sink.finish(0, Err(status));
        stream
    }

    /// Receive the next point, or `None` once the sequence has ended.
    pub async fn next(&mut self) -> Option<T> {
        self.points.recv().await
    }

    /// Drain any remaining points, then return the version, or the terminal
    /// error if the call failed.
    pub async fn finish(self) -> Result<u64> {
        let (version, status) = self.into_terminals().await;
        status.map(|()| version)
    }

    /// Drain the whole sequence into a vector and return it with the
    /// version. Points delivered before a failure are discarded with it; use
    /// [`next`](Self::next) to keep partial results.
    pub async fn collect(mut self) -> Result<(Vec<T>, u64)> {
        let mut points = Vec::new();
        while let Some(point) = self.points.recv().await {
            points.push(point);
        }
        let (version, status) = self.into_terminals().await;
        status.map(|()| (points, version))
    }

    /// Drain leftovers and await both terminal signals.
    async fn into_terminals(mut self) -> (u64, Result<()>) {
        while self.points.recv().await.is_some() {}
        let version = self.version.await.unwrap_or(0);
        let status = match self.status.await {
            Ok(status) => status,
            Err(_) => Err(Status::unreachable("stream ended without a terminal status")),
        };
        (version, status)
    }

    /// Split into the raw channels. Test and advanced use; the ordering
    /// contract is unchanged.
    pub fn into_parts(
        self,
    ) -> (mpsc::Receiver<T>, oneshot::Receiver<u64>, oneshot::Receiver<Result<()>>) {
        (self.points, self.version, self.status)
    }
}
