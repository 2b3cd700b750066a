//! Request coalescing: at most one network fetch per key
//!
//! The first caller for a key becomes the owner. Its work future is wrapped
//! in [`Shared`], registered in the map and spawned onto the runtime, so the
//! fetch runs to completion even when every caller stops waiting (a
//! network-first timeout, a stale-while-revalidate caller that never awaits).
//! The future removes its own map slot before resolving.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use progload_domain::RequestKey;
use tracing::debug;

use crate::fetcher::{FetchError, NetworkResponse};
use crate::metrics::CacheMetrics;

/// Result every waiter of one fetch receives.
pub type FetchResult = Result<NetworkResponse, FetchError>;

/// Handle to an in-flight fetch; clone and await it freely.
pub type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Outcome of [`InFlightMap::join`].
pub struct Joined {
    pub fetch: SharedFetch,
    /// True when this call started the fetch
    pub owner: bool,
}

/// `key -> pending fetch`
#[derive(Clone, Default)]
pub struct InFlightMap {
    pending: Arc<Mutex<HashMap<RequestKey, SharedFetch>>>,
    metrics: CacheMetrics,
}

impl InFlightMap {
    pub fn new(metrics: CacheMetrics) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            metrics,
        }
    }

    /// Join the fetch for `key`, starting it with `start` if none is pending.
    ///
    /// Must be called from within a tokio runtime.
    pub fn join<F>(&self, key: &RequestKey, start: F) -> Joined
    where
        F: FnOnce() -> BoxFuture<'static, FetchResult>,
    {
        let mut pending = self.pending.lock();
        if let Some(existing) = pending.get(key) {
            self.metrics.record_coalesced();
            debug!("Coalesced request for {}", key);
            return Joined {
                fetch: existing.clone(),
                owner: false,
            };
        }

        let slots = Arc::clone(&self.pending);
        let slot_key = key.clone();
        let work = start();
        let fetch = async move {
            let result = work.await;
            slots.lock().remove(&slot_key);
            result
        }
        .boxed()
        .shared();

        pending.insert(key.clone(), fetch.clone());
        self.metrics.record_network_fetch();
        tokio::spawn(fetch.clone());

        Joined { fetch, owner: true }
    }

    pub fn is_pending(&self, key: &RequestKey) -> bool {
        self.pending.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
