//! Driver tuning constants.

use std::time::Duration;

/// Maximum wrong-endpoint redispatches per logical operation.
///
/// Tiger Style: Bounded retries prevent pathological routing loops when the
/// cluster is churning faster than snapshots propagate.
pub const MAX_OP_RETRIES: u32 = 4;

/// Deadline for each `info` probe during a routing-snapshot refresh.
///
/// Only these internal probes carry a fixed deadline; user calls inherit the
/// caller's cancellation.
pub const INFO_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Buffered points between a streaming query and its consumer.
///
/// The buffer absorbs batch-to-point fan-out; a slow consumer backpressures
/// the connection rather than growing memory.
pub const STREAM_POINT_BUFFER: usize = 256;

/// Buffered reply frames per in-flight call.
pub const CALL_REPLY_BUFFER: usize = 32;

/// Request frames queued towards a connection's writer task.
pub const REQUEST_QUEUE_DEPTH: usize = 64;
