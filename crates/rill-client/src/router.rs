//! Routing: the active mash, the endpoint cache, and resync.
//!
//! The router composes the active routing snapshot with a lazy cache of open
//! endpoints, keyed by the node hash the cluster assigned each member. The
//! cache outlives any particular snapshot: hashes are stable across
//! revisions, so a topology change invalidates routes, not connections.
//!
//! # Concurrency
//!
//! - The active mash lives behind a read/write lock holding only an `Arc`
//!   swap; readers clone the pointer and never wait on a resync.
//! - Snapshot installs are revision-monotonic. A reader may briefly act on a
//!   stale snapshot; the node answers wrong-endpoint and the retry layer
//!   cures it.
//! - Cache misses dial outside any lock. Two concurrent misses for the same
//!   hash may both dial; the loser's connection is dropped on commit.
//! - Resyncs serialize on a dedicated async mutex, and callers that queued
//!   behind a refresh that already superseded the revision they observed
//!   return without probing.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::RwLock;
use rill_client_api::Status;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use crate::Result;
use crate::constants::INFO_PROBE_TIMEOUT;
use crate::endpoint::Endpoint;
use crate::endpoint::connect_endpoint;
use crate::mash::Mash;

struct EndpointCache {
    endpoints: HashMap<u32, Arc<Endpoint>>,
    closed: bool,
}

pub(crate) struct Router {
    active_mash: RwLock<Arc<Mash>>,
    cache: RwLock<EndpointCache>,
    resync_lock: tokio::sync::Mutex<()>,
}

impl Router {
    pub(crate) fn new(initial: Mash) -> Self {
        Self {
            active_mash: RwLock::new(Arc::new(initial)),
            cache: RwLock::new(EndpointCache { endpoints: HashMap::new(), closed: false }),
            resync_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The active routing snapshot.
    pub(crate) fn mash(&self) -> Arc<Mash> {
        self.active_mash.read().clone()
    }

    /// Install a snapshot unless a newer one is already active.
    fn install_mash(&self, mash: Mash) {
        let mut active = self.active_mash.write();
        if mash.revision() >= active.revision() {
            debug!(revision = mash.revision(), "routing snapshot installed");
            *active = Arc::new(mash);
        } else {
            debug!(
                stale = mash.revision(),
                active = active.revision(),
                "discarding stale routing snapshot"
            );
        }
    }

    fn cached(&self, hash: u32) -> Result<Option<Arc<Endpoint>>> {
        let cache = self.cache.read();
        if cache.closed {
            return Err(Status::disconnected());
        }
        Ok(cache.endpoints.get(&hash).cloned())
    }

    /// Commit a freshly dialed endpoint. If another dial for the same hash
    /// committed first, keep the incumbent and drop ours.
    fn commit(&self, hash: u32, endpoint: Arc<Endpoint>) -> Result<Arc<Endpoint>> {
        let mut cache = self.cache.write();
        if cache.closed {
            drop(cache);
            let _ = endpoint.disconnect();
            return Err(Status::disconnected());
        }
        match cache.endpoints.entry(hash) {
            Entry::Occupied(existing) => {
                let incumbent = Arc::clone(existing.get());
                drop(cache);
                let _ = endpoint.disconnect();
                Ok(incumbent)
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&endpoint));
                Ok(endpoint)
            }
        }
    }

    /// The endpoint that should service writes for a stream.
    pub(crate) async fn endpoint_for(
        &self,
        ctx: &CancellationToken,
        stream: &Uuid,
    ) -> Result<Arc<Endpoint>> {
        if ctx.is_cancelled() {
            return Err(Status::cancelled());
        }
        let mash = self.mash();
        let Some((hash, addresses)) = mash.endpoint_for(stream) else {
            return Err(Status::cluster_degraded());
        };
        if let Some(endpoint) = self.cached(hash)? {
            return Ok(endpoint);
        }
        let addresses = addresses.to_vec();
        let endpoint = connect_endpoint(ctx, &addresses).await?;
        self.commit(hash, endpoint)
    }

    /// The endpoint that should service reads for a stream.
    ///
    /// Today this is the owner, same as [`endpoint_for`](Self::endpoint_for);
    /// the separate entry point is where a read preference would plug in.
    pub(crate) async fn read_endpoint_for(
        &self,
        ctx: &CancellationToken,
        stream: &Uuid,
    ) -> Result<Arc<Endpoint>> {
        self.endpoint_for(ctx, stream).await
    }

    /// The endpoint for a routing hash, dialing it if necessary.
    pub(crate) async fn endpoint_for_hash(
        &self,
        ctx: &CancellationToken,
        hash: u32,
    ) -> Result<Arc<Endpoint>> {
        if let Some(endpoint) = self.cached(hash)? {
            return Ok(endpoint);
        }
        let mash = self.mash();
        let Some(addresses) = mash.addresses_for_hash(hash) else {
            return Err(Status::cluster_degraded());
        };
        let addresses = addresses.to_vec();
        let endpoint = connect_endpoint(ctx, &addresses).await?;
        self.commit(hash, endpoint)
    }

    /// Any open endpoint, for calls that are not bound to a stream.
    ///
    /// Prefers an endpoint already in the cache; with an empty cache, routes
    /// a freshly generated random stream id and dials its owner.
    pub(crate) async fn any_endpoint(&self, ctx: &CancellationToken) -> Result<Arc<Endpoint>> {
        {
            let cache = self.cache.read();
            if cache.closed {
                return Err(Status::disconnected());
            }
            if let Some(endpoint) = cache.endpoints.values().next() {
                return Ok(Arc::clone(endpoint));
            }
        }
        self.endpoint_for(ctx, &Uuid::new_v4()).await
    }

    /// Refresh the active routing snapshot.
    ///
    /// `observed_revision` is the revision the caller routed with; if the
    /// active snapshot has already moved past it, another caller refreshed
    /// concurrently and there is nothing to do. Otherwise probe every cached
    /// endpoint, then every member of the current snapshot, each under a
    /// fixed deadline, and install the first answer. Exhausting every
    /// candidate is fatal for the calling operation.
    pub(crate) async fn resync_mash(&self, observed_revision: u64) -> Result<()> {
        let _guard = self.resync_lock.lock().await;
        if self.mash().revision() > observed_revision {
            return Ok(());
        }

        let probe_ctx = CancellationToken::new();
        let cached: Vec<Arc<Endpoint>> = {
            let cache = self.cache.read();
            if cache.closed {
                return Err(Status::disconnected());
            }
            cache.endpoints.values().cloned().collect()
        };
        for endpoint in cached {
            match timeout(INFO_PROBE_TIMEOUT, endpoint.info(&probe_ctx)).await {
                Ok(Ok(mash)) => {
                    self.install_mash(mash);
                    return Ok(());
                }
                Ok(Err(status)) => {
                    debug!(address = endpoint.address(), error = %status, "cached endpoint probe failed");
                }
                Err(_) => {
                    debug!(address = endpoint.address(), "cached endpoint probe timed out");
                }
            }
        }

        let mash = self.mash();
        for member in mash.members() {
            let probe = timeout(INFO_PROBE_TIMEOUT, async {
                let endpoint = self.endpoint_for_hash(&probe_ctx, member.hash).await?;
                endpoint.info(&probe_ctx).await
            })
            .await;
            match probe {
                Ok(Ok(new_mash)) => {
                    self.install_mash(new_mash);
                    return Ok(());
                }
                Ok(Err(status)) => {
                    debug!(hash = member.hash, error = %status, "member probe failed");
                }
                Err(_) => {
                    debug!(hash = member.hash, "member probe timed out");
                }
            }
        }

        warn!("routing refresh exhausted every candidate endpoint");
        Err(Status::no_endpoints_reachable())
    }

    /// Close every cached endpoint and refuse all further operations.
    ///
    /// Best-effort across the pool: returns the last close error observed.
    /// Later calls are no-ops.
    pub(crate) fn disconnect_all(&self) -> Result<()> {
        let endpoints: Vec<Arc<Endpoint>> = {
            let mut cache = self.cache.write();
            if cache.closed {
                return Ok(());
            }
            cache.closed = true;
            cache.endpoints.drain().map(|(_, endpoint)| endpoint).collect()
        };
        let mut last = Ok(());
        for endpoint in endpoints {
            if let Err(status) = endpoint.disconnect() {
                last = Err(status);
            }
        }
        last
    }
}
