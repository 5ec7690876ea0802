//! Client driver for Rill clusters.
//!
//! Rill is a clustered time-series database. Streams of `(time, value)`
//! points are identified by an opaque 16-byte id and partitioned across
//! cluster nodes by a routing snapshot (the MASH, a Mapping from Address
//! Space to Hosts). This crate is the cluster-facing core of the driver:
//!
//! - [`Mash`]: an immutable snapshot mapping each stream id to its owner node
//! - [`Endpoint`]: one multiplexed connection to one node, with unary and
//!   streaming calls
//! - a lazy per-node connection cache and router with snapshot resync
//! - a retry layer that cures wrong-endpoint errors by refreshing the
//!   snapshot and re-dispatching transparently
//! - [`RillClient`] and [`Stream`]: the user-visible handle and per-stream
//!   operations
//!
//! # Example
//!
//! ```rust,ignore
//! use rill_client::{RillClient, RawPoint};
//! use tokio_util::sync::CancellationToken;
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> rill_client::Result<()> {
//!     let ctx = CancellationToken::new();
//!     let db = RillClient::connect(&ctx, &rill_client::endpoints_from_env()).await?;
//!     let stream = db.create(&ctx, Uuid::new_v4(), "demo.sensors", Default::default(), None).await?;
//!     stream.insert(&ctx, &[RawPoint { time: 100, value: 1.5 }]).await?;
//!     let (points, version) = stream.raw_values(&ctx, 0, 1_000, 0).collect().await?;
//!     println!("{} points at version {version}", points.len());
//!     db.disconnect()
//! }
//! ```
//!
//! Errors carry a numeric [`Status`] code end to end; the only code the
//! driver recovers from internally is wrong-endpoint (the contacted node no
//! longer owns the stream), which is cured by a snapshot refresh and a
//! bounded number of re-dispatches.

mod client;
mod constants;
mod dispatch;
mod endpoint;
mod mash;
mod query_stream;
mod router;

pub use client::RillClient;
pub use client::Stream;
pub use client::endpoints_from_env;
pub use endpoint::Endpoint;
pub use endpoint::connect_endpoint;
pub use mash::Mash;
pub use query_stream::QueryStream;
// Re-export the wire-level types that appear in the public API.
pub use rill_client_api::MAX_TIME;
pub use rill_client_api::MIN_TIME;
pub use rill_client_api::MashDescription;
pub use rill_client_api::MashMember;
pub use rill_client_api::RawPoint;
pub use rill_client_api::StatPoint;
pub use rill_client_api::Status;
pub use rill_client_api::codes;
pub use uuid::Uuid;

/// Result alias used across the driver.
pub type Result<T> = std::result::Result<T, Status>;
