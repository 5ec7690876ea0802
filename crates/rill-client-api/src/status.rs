//! Coded status errors shared by the driver and the wire protocol.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Numeric status codes understood by the driver.
///
/// Codes at or above 499 are synthesized client-side and never appear in a
/// reply frame.
pub mod codes {
    /// A point timestamp or query interval falls outside the valid range.
    pub const INVALID_TIME_RANGE: u16 = 402;

    /// A nearest-point query found no point in the requested direction.
    pub const NO_SUCH_POINT: u16 = 404;

    /// The contacted node does not own the requested stream. The driver
    /// refreshes its routing snapshot and re-dispatches.
    pub const WRONG_ENDPOINT: u16 = 405;

    /// The cluster currently has no owner for the stream's slice of the
    /// placement space. Generally transient; the caller may retry later.
    pub const CLUSTER_DEGRADED: u16 = 419;

    /// Nonsensical arguments, or an operation on a disconnected handle.
    pub const INVALID_ARGUMENTS: u16 = 421;

    /// The caller cancelled the operation. Client-side.
    pub const CANCELLED: u16 = 499;

    /// Transport failure: dial refused, connection lost, codec error.
    /// Client-side.
    pub const UNREACHABLE: u16 = 503;

    /// A routing-snapshot refresh exhausted every known endpoint. Fatal for
    /// the operation that triggered it. Client-side.
    pub const NO_ENDPOINTS_REACHABLE: u16 = 504;
}

/// A coded error status.
///
/// This is both the error payload of wire reply frames and the error type of
/// every driver operation, so a status travels unchanged from a node to the
/// caller. The code is the dispatch key; the message is for humans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("rill error {code}: {msg}")]
pub struct Status {
    code: u16,
    msg: String,
}

impl Status {
    /// Create a status with an explicit code.
    pub fn new(code: u16, msg: impl Into<String>) -> Self {
        Self { code, msg: msg.into() }
    }

    /// The numeric status code.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// The human-readable message.
    pub fn msg(&self) -> &str {
        &self.msg
    }

    /// True when the status means the contacted node does not own the key.
    pub fn is_wrong_endpoint(&self) -> bool {
        self.code == codes::WRONG_ENDPOINT
    }

    /// A wrong-endpoint status naming the stream that was misrouted.
    pub fn wrong_endpoint(msg: impl Into<String>) -> Self {
        Self::new(codes::WRONG_ENDPOINT, msg)
    }

    /// The cluster has no owner for the requested key.
    pub fn cluster_degraded() -> Self {
        Self::new(codes::CLUSTER_DEGRADED, "cluster is degraded")
    }

    /// The handle has been disconnected; no further operation may succeed.
    pub fn disconnected() -> Self {
        Self::new(codes::INVALID_ARGUMENTS, "driver is disconnected")
    }

    /// The caller passed nonsensical arguments.
    pub fn invalid_arguments(msg: impl Into<String>) -> Self {
        Self::new(codes::INVALID_ARGUMENTS, msg)
    }

    /// The caller cancelled the operation.
    pub fn cancelled() -> Self {
        Self::new(codes::CANCELLED, "operation cancelled")
    }

    /// A transport-level failure.
    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::new(codes::UNREACHABLE, msg)
    }

    /// Every candidate endpoint failed during a routing refresh.
    pub fn no_endpoints_reachable() -> Self {
        Self::new(codes::NO_ENDPOINTS_REACHABLE, "no endpoints reachable")
    }
}
