//! One test node: a TCP listener speaking the client wire protocol.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::SinkExt;
use futures::StreamExt;
use rill_client_api::MAX_WIRE_MESSAGE_SIZE;
use rill_client_api::ReplyFrame;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;
use tracing::debug;

use crate::cluster::ClusterCore;
use crate::cluster::HandlerOutput;

/// How long a stalled streaming reply sleeps. Far beyond any test deadline;
/// the client is expected to cancel.
const STALL: Duration = Duration::from_secs(600);

pub(crate) struct TestNode {
    pub(crate) address: String,
    accept_task: JoinHandle<()>,
}

impl TestNode {
    /// Bind a listener for the node; the accept loop starts when
    /// [`serve`](Self::serve) is called with the node's hash.
    pub(crate) async fn bind() -> anyhow::Result<(TcpListener, String)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        Ok((listener, address))
    }

    pub(crate) fn serve(
        listener: TcpListener,
        address: String,
        core: Arc<ClusterCore>,
        hash: u32,
    ) -> Self {
        let accept_task = tokio::spawn(accept_loop(listener, core, hash));
        Self { address, accept_task }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, core: Arc<ClusterCore>, hash: u32) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, hash, "test node accepted connection");
                tokio::spawn(serve_connection(stream, Arc::clone(&core), hash));
            }
            Err(err) => {
                debug!(hash, error = %err, "test node accept failed");
                return;
            }
        }
    }
}

/// Serve one client connection. Requests on a connection are handled
/// sequentially; concurrency across connections is unbounded.
async fn serve_connection(stream: TcpStream, core: Arc<ClusterCore>, hash: u32) {
    let _ = stream.set_nodelay(true);
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_WIRE_MESSAGE_SIZE)
        .new_codec();
    let mut framed = Framed::new(stream, codec);

    while let Some(next) = framed.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(hash, error = %err, "test node read failed");
                return;
            }
        };
        let request = match rill_client_api::decode_request(&bytes) {
            Ok(request) => request,
            Err(status) => {
                debug!(hash, error = %status, "undecodable request frame");
                return;
            }
        };
        let output = core.handle(hash, request.body);
        let result = match output {
            HandlerOutput::Unary(body) => {
                write_frame(&mut framed, ReplyFrame { id: request.id, body }).await
            }
            HandlerOutput::Stream { batches, fin, stall_before } => {
                let mut result = Ok(());
                let batch_count = batches.len();
                for (index, body) in batches.into_iter().enumerate() {
                    if stall_before == Some(index) {
                        tokio::time::sleep(STALL).await;
                    }
                    result = write_frame(&mut framed, ReplyFrame { id: request.id, body }).await;
                    if result.is_err() {
                        break;
                    }
                }
                if result.is_ok() {
                    if stall_before == Some(batch_count) {
                        tokio::time::sleep(STALL).await;
                    }
                    result = write_frame(&mut framed, ReplyFrame { id: request.id, body: fin }).await;
                }
                result
            }
        };
        if result.is_err() {
            return;
        }
    }
}

async fn write_frame(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    frame: ReplyFrame,
) -> anyhow::Result<()> {
    let bytes = rill_client_api::encode_reply(&frame).map_err(|status| anyhow::anyhow!("{status}"))?;
    framed.send(Bytes::from(bytes)).await?;
    Ok(())
}
