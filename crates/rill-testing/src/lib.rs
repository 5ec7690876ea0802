//! Deterministic in-process Rill cluster for driver tests.
//!
//! A [`TestCluster`] runs a set of protocol-faithful nodes on loopback TCP,
//! backed by one shared in-memory storage and topology state. It mirrors the
//! behavior of a production cluster without disks or consensus: ownership
//! checks answer wrong-endpoint, downed members leave slices unmapped, and
//! info requests report the live routing snapshot.
//!
//! Topology mutation and fault-injection hooks let tests drive the driver's
//! recovery paths deterministically:
//!
//! - [`rotate_ownership`](TestCluster::rotate_ownership) moves every stream
//!   to a new owner and bumps the snapshot revision, so clients holding the
//!   old snapshot must resync mid-flight;
//! - [`set_misroute`](TestCluster::set_misroute) makes a node claim
//!   non-ownership without a topology change, which exhausts retry budgets;
//! - [`set_stream_fault`](TestCluster::set_stream_fault) injects a one-shot
//!   terminal error or stall into a streaming query.

mod cluster;
mod node;
mod store;

use std::sync::Arc;

use rand::Rng;
use rill_client_api::RawPoint;
use uuid::Uuid;

pub use cluster::StreamFault;
use cluster::ClusterCore;
use node::TestNode;

/// An in-process cluster of test nodes.
///
/// Nodes share storage, so a stream stays readable wherever ownership moves.
/// Dropping the cluster stops every node.
pub struct TestCluster {
    core: Arc<ClusterCore>,
    nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Start a cluster of `count` nodes on loopback, splitting the placement
    /// space evenly among them.
    pub async fn start(count: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(count > 0, "cluster needs at least one node");
        let mut bound = Vec::with_capacity(count);
        let mut addresses = Vec::with_capacity(count);
        for _ in 0..count {
            let (listener, address) = TestNode::bind().await?;
            addresses.push(address.clone());
            bound.push((listener, address));
        }
        let core = Arc::new(ClusterCore::new(addresses));
        let nodes = bound
            .into_iter()
            .enumerate()
            .map(|(index, (listener, address))| {
                TestNode::serve(listener, address, Arc::clone(&core), index as u32 + 1)
            })
            .collect();
        Ok(Self { core, nodes })
    }

    /// Dialable addresses of every node, in hash order.
    pub fn addresses(&self) -> Vec<String> {
        self.nodes.iter().map(|node| node.address.clone()).collect()
    }

    /// Address of one node.
    pub fn address(&self, index: usize) -> String {
        self.nodes[index].address.clone()
    }

    /// Move every member's owned slice to the next member and bump the
    /// snapshot revision.
    pub fn rotate_ownership(&self) {
        self.core.rotate_ownership();
    }

    /// Mark a member up or down. A down member leaves its slice unmapped,
    /// degrading the cluster for the streams it owned.
    pub fn set_member_up(&self, index: usize, up: bool) {
        self.core.set_member_up(index, up);
    }

    /// Toggle unconditional wrong-endpoint answers on one node.
    pub fn set_misroute(&self, index: usize, on: bool) {
        self.core.set_misroute(index, on);
    }

    /// Arm a one-shot fault on the next streaming query for `stream`.
    pub fn set_stream_fault(&self, stream: Uuid, fault: StreamFault) {
        self.core.set_stream_fault(stream, fault);
    }
}

/// Evenly spaced points with pseudorandom values covering `[start, end)`.
///
/// The gap is `(end - start) / count`, matching the canonical data layout
/// used across the driver's integration tests.
pub fn random_points(start: i64, end: i64, count: usize) -> Vec<RawPoint> {
    let gap = (end - start) / count as i64;
    let mut rng = rand::rng();
    (0..count)
        .map(|index| RawPoint {
            time: start + index as i64 * gap,
            value: rng.random::<f64>() * 2.0 - 1.0,
        })
        .collect()
}
