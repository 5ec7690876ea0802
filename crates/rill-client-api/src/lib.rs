//! Wire protocol for Rill client connections.
//!
//! This crate defines the RPC protocol spoken between the Rill driver and the
//! nodes of a Rill cluster: request/reply message enums, the coded status
//! carried by error replies, and the postcard encoding helpers shared by the
//! driver and by in-process test nodes. It contains no I/O.
//!
//! # Architecture
//!
//! Every message travels as one length-delimited frame on a TCP connection.
//! A client tags each request with a connection-local id; the node echoes the
//! id on every reply so that concurrent calls can share one connection.
//! Unary requests receive exactly one reply frame. Streaming requests receive
//! zero or more batch frames followed by exactly one `Final` frame.
//!
//! # Tiger Style
//!
//! - Explicit request/reply pairs
//! - Bounded message and batch sizes
//! - Errors carry a numeric code the driver can dispatch on

mod messages;
mod status;

pub use messages::MashDescription;
pub use messages::MashMember;
pub use messages::NodeRequest;
pub use messages::RawPoint;
pub use messages::ReplyBody;
pub use messages::ReplyFrame;
pub use messages::RequestFrame;
pub use messages::StatPoint;
pub use status::Status;
pub use status::codes;

/// Maximum encoded size of a single wire frame (4 MB).
///
/// Tiger Style: Bounded to prevent memory exhaustion from a misbehaving peer.
pub const MAX_WIRE_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Maximum number of points a node packs into one streamed batch frame.
///
/// Large result sets are chunked at this granularity so a single frame stays
/// well under [`MAX_WIRE_MESSAGE_SIZE`].
pub const MAX_BATCH_POINTS: usize = 5000;

/// Earliest valid point timestamp, in nanoseconds since the epoch (inclusive).
pub const MIN_TIME: i64 = -(16 << 56);

/// Latest valid point timestamp, in nanoseconds since the epoch (exclusive).
pub const MAX_TIME: i64 = 48 << 56;

/// Encode a request frame for transmission.
pub fn encode_request(frame: &RequestFrame) -> Result<Vec<u8>, Status> {
    postcard::to_stdvec(frame).map_err(|err| Status::unreachable(format!("encode request: {err}")))
}

/// Decode a request frame received from a client.
pub fn decode_request(bytes: &[u8]) -> Result<RequestFrame, Status> {
    postcard::from_bytes(bytes).map_err(|err| Status::unreachable(format!("decode request: {err}")))
}

/// Encode a reply frame for transmission.
pub fn encode_reply(frame: &ReplyFrame) -> Result<Vec<u8>, Status> {
    postcard::to_stdvec(frame).map_err(|err| Status::unreachable(format!("encode reply: {err}")))
}

/// Decode a reply frame received from a node.
pub fn decode_reply(bytes: &[u8]) -> Result<ReplyFrame, Status> {
    postcard::from_bytes(bytes).map_err(|err| Status::unreachable(format!("decode reply: {err}")))
}
