//! Request and reply message definitions.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::status::Status;

/// A single raw reading in a stream.
///
/// `value` is preserved bit-exactly across the wire: postcard writes the
/// eight raw bytes of the f64, so NaN payloads and signed zeros survive a
/// round-trip unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawPoint {
    /// Nanoseconds since the Unix epoch, UTC.
    pub time: i64,
    /// The reading.
    pub value: f64,
}

/// A statistical summary of one window of raw points.
///
/// The window width is determined by the query that produced the point;
/// `time` marks the start of the window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatPoint {
    /// Start of the window, in nanoseconds since the Unix epoch, UTC.
    pub time: i64,
    /// Smallest value in the window.
    pub min: f64,
    /// Arithmetic mean of the window.
    pub mean: f64,
    /// Largest value in the window.
    pub max: f64,
    /// Number of raw points in the window.
    pub count: u64,
}

/// One cluster member as described by a routing snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MashMember {
    /// Opaque routing key the cluster assigned this node. Stable across
    /// snapshot revisions for the lifetime of the node.
    pub hash: u32,
    /// Start of the owned slice of the 32-bit placement space (inclusive).
    pub start: u64,
    /// End of the owned slice (exclusive, at most `1 << 32`).
    pub end: u64,
    /// Whether the node is currently accepting operations. A member that is
    /// down leaves its slice unmapped.
    pub up: bool,
    /// Dialable addresses for the node, in preference order. Alternates for
    /// the same node, not replicas.
    pub addresses: Vec<String>,
}

/// A server-supplied snapshot of cluster routing state.
///
/// The snapshot is immutable once issued; topology changes produce a new
/// snapshot with a higher revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MashDescription {
    /// Monotonic snapshot revision.
    pub revision: u64,
    /// Members and their owned slices of the placement space.
    pub members: Vec<MashMember>,
}

/// A request frame sent from the driver to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Connection-local request id, echoed on every reply.
    pub id: u64,
    /// The requested operation.
    pub body: NodeRequest,
}

/// Operations a client can request from a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeRequest {
    /// Get the node's current view of the cluster routing state.
    Info,

    /// Create a stream.
    Create {
        /// Stream identifier. Opaque to the cluster; equality is bytewise.
        stream: Uuid,
        /// Collection the stream belongs to.
        collection: String,
        /// Key/value tags attached at creation.
        tags: BTreeMap<String, String>,
        /// Opaque annotation blob.
        annotation: Option<Vec<u8>>,
    },

    /// Insert a batch of raw points.
    Insert {
        /// Target stream.
        stream: Uuid,
        /// Points to insert. Times must lie in the valid range.
        points: Vec<RawPoint>,
    },

    /// Insert parallel time and value arrays. Lengths must match.
    InsertValues {
        /// Target stream.
        stream: Uuid,
        /// Point timestamps, nanoseconds.
        times: Vec<i64>,
        /// Point values, parallel to `times`.
        values: Vec<f64>,
    },

    /// Delete every point in `[start, end)`.
    DeleteRange {
        /// Target stream.
        stream: Uuid,
        /// Start of the interval (inclusive), nanoseconds.
        start: i64,
        /// End of the interval (exclusive), nanoseconds.
        end: i64,
    },

    /// Force buffered writes for a stream to durable storage.
    Flush {
        /// Target stream.
        stream: Uuid,
    },

    /// Stream every raw point in `[start, end)`, in increasing time order.
    RawValues {
        /// Target stream.
        stream: Uuid,
        /// Start of the interval (inclusive), nanoseconds.
        start: i64,
        /// End of the interval (exclusive), nanoseconds.
        end: i64,
        /// Stream version to query. Zero means latest.
        version: u64,
    },

    /// Stream statistical summaries of consecutive `width`-nanosecond
    /// windows covering `[start, end)`. Empty windows are omitted.
    Windows {
        /// Target stream.
        stream: Uuid,
        /// Start of the interval (inclusive), nanoseconds.
        start: i64,
        /// End of the interval (exclusive), nanoseconds.
        end: i64,
        /// Window width in nanoseconds.
        width: u64,
        /// Maximum tree depth consulted for the aggregates. Zero requests
        /// exact statistics.
        depth: u8,
        /// Stream version to query. Zero means latest.
        version: u64,
    },

    /// Stream statistical summaries of power-of-two windows aligned to
    /// multiples of `1 << pointwidth` nanoseconds. Empty windows are
    /// omitted.
    AlignedWindows {
        /// Target stream.
        stream: Uuid,
        /// Start of the interval (inclusive), nanoseconds.
        start: i64,
        /// End of the interval (exclusive), nanoseconds.
        end: i64,
        /// Log2 of the window width in nanoseconds.
        pointwidth: u8,
        /// Stream version to query. Zero means latest.
        version: u64,
    },

    /// Find the point nearest to `time`. Forward search (`backward` false)
    /// is inclusive of `time`; backward search is exclusive.
    Nearest {
        /// Target stream.
        stream: Uuid,
        /// Reference timestamp, nanoseconds.
        time: i64,
        /// Stream version to query. Zero means latest.
        version: u64,
        /// Search direction.
        backward: bool,
    },
}

impl NodeRequest {
    /// True for operations answered with batch frames and a `Final` frame
    /// rather than a single unary reply.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            NodeRequest::RawValues { .. }
                | NodeRequest::Windows { .. }
                | NodeRequest::AlignedWindows { .. }
        )
    }
}

/// A reply frame sent from a node to the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyFrame {
    /// Id of the request this reply answers.
    pub id: u64,
    /// The reply payload.
    pub body: ReplyBody,
}

/// Reply payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplyBody {
    /// Routing snapshot, answering `Info`.
    Info {
        /// The node's current cluster view.
        mash: MashDescription,
    },

    /// Success with no payload, answering writes.
    Ack,

    /// Success carrying the stream version, answering `Flush`.
    Version {
        /// Stream version after the operation.
        version: u64,
    },

    /// A single point with its version, answering `Nearest`.
    Point {
        /// The located point.
        point: RawPoint,
        /// Version of the snapshot the point was read from.
        version: u64,
    },

    /// Failure of any request.
    Error {
        /// The coded failure.
        status: Status,
    },

    /// One batch of raw points from a streaming query.
    RawBatch {
        /// Points, in increasing time order.
        points: Vec<RawPoint>,
    },

    /// One batch of statistical points from a streaming query.
    StatBatch {
        /// Window summaries, in increasing window-start order.
        points: Vec<StatPoint>,
    },

    /// Terminal frame of a streaming query. Sent exactly once, after the
    /// last batch.
    Final {
        /// Version of the snapshot the query ran against.
        version: u64,
        /// Failure, if the query did not run to completion. Batches already
        /// delivered remain valid.
        status: Option<Status>,
    },
}

impl ReplyBody {
    /// True when this body completes its call: no more frames will carry the
    /// same request id.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReplyBody::RawBatch { .. } | ReplyBody::StatBatch { .. })
    }
}
