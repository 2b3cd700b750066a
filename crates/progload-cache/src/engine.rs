//! Cache strategy engine
//!
//! `intercept` resolves a request to a namespace and applies that
//! namespace's policy. It never fails: every error path ends in a cached,
//! fallback or offline response, and the error itself goes to the
//! performance bridge.
//!
//! Network fetches go through the [`InFlightMap`]. The shared fetch future
//! both fetches and stores, so concurrent requests for one key cause one
//! fetch and one write.

use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use futures::FutureExt;
use progload_domain::{
    ErrorKind, Payload, ResourceKind, ResourceRequest, Response, ResponseSource, SignalReporter,
};
use tracing::{debug, warn};

use crate::config::{FallbackConfig, WorkerConfig};
use crate::entry::CacheEntry;
use crate::fetcher::{FetchError, NetworkFetcher, NetworkResponse};
use crate::freshness::freshness_from_headers;
use crate::inflight::{InFlightMap, SharedFetch};
use crate::metrics::CacheMetrics;
use crate::namespace::{CacheNamespaceStore, CachePolicy, NamespaceHandle};
use crate::routes::RouteTable;
use crate::CacheError;

/// Applies per-namespace caching policies to intercepted requests.
pub struct CacheStrategyEngine {
    store: Arc<CacheNamespaceStore>,
    routes: RouteTable,
    fetcher: Arc<dyn NetworkFetcher>,
    inflight: InFlightMap,
    network_timeout: Duration,
    fallback: FallbackConfig,
    reporter: SignalReporter,
    metrics: CacheMetrics,
}

impl CacheStrategyEngine {
    pub fn new(
        store: Arc<CacheNamespaceStore>,
        routes: RouteTable,
        fetcher: Arc<dyn NetworkFetcher>,
    ) -> Self {
        let metrics = CacheMetrics::new();
        Self {
            store,
            routes,
            fetcher,
            inflight: InFlightMap::new(metrics.clone()),
            network_timeout: Duration::from_millis(3000),
            fallback: FallbackConfig::default(),
            reporter: SignalReporter::disconnected(),
            metrics,
        }
    }

    /// Engine configured from `config`, sharing `store`
    pub fn from_config(
        config: &WorkerConfig,
        store: Arc<CacheNamespaceStore>,
        routes: RouteTable,
        fetcher: Arc<dyn NetworkFetcher>,
    ) -> Self {
        Self::new(store, routes, fetcher)
            .with_network_timeout(Duration::from_millis(config.network_timeout_ms))
            .with_fallback(config.fallback.clone())
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackConfig) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_reporter(mut self, reporter: SignalReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Engine-wide counters (network fetches, coalescing, fallbacks)
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn store(&self) -> &Arc<CacheNamespaceStore> {
        &self.store
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Resolve `request` according to its namespace's policy.
    pub async fn intercept(&self, request: &ResourceRequest) -> Response {
        if !request.method().is_cacheable() {
            return self.passthrough(request).await;
        }

        let namespace = self.routes.resolve(request);
        let handle = match self.store.open(namespace) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("No namespace for {}: {}; passing through", request.key(), e);
                return self.passthrough(request).await;
            }
        };

        debug!(
            "Intercepted {} -> {} ({:?})",
            request.key(),
            handle.name(),
            handle.spec().policy
        );

        match handle.spec().policy {
            CachePolicy::CacheFirst => self.cache_first(&handle, request).await,
            CachePolicy::NetworkFirst => self.network_first(&handle, request).await,
            CachePolicy::StaleWhileRevalidate => {
                self.stale_while_revalidate(&handle, request).await
            }
        }
    }

    /// Forward to the network without touching any namespace.
    pub async fn passthrough(&self, request: &ResourceRequest) -> Response {
        self.metrics.record_network_fetch();
        match self.fetcher.fetch(request).await {
            Ok(response) => network_response(&response, ResponseSource::Passthrough),
            Err(e) => {
                warn!("Passthrough fetch failed for {}: {}", request.key(), e);
                self.reporter.report_error(ErrorKind::Network, request.key().as_str());
                self.fallback_for(request)
            }
        }
    }

    /// Fetch `request` into `handle` without producing a response; used by
    /// precaching. Fails when the network fails or the response is not
    /// stored.
    pub async fn prefetch(
        &self,
        handle: &NamespaceHandle,
        request: &ResourceRequest,
    ) -> Result<(), CacheError> {
        let response = self
            .shared_fetch(handle, request)
            .await
            .map_err(|e| CacheError::Network {
                message: e.to_string(),
            })?;
        if !response.is_success() {
            return Err(CacheError::Network {
                message: format!("{} answered {}", request.key(), response.status),
            });
        }
        Ok(())
    }

    async fn cache_first(&self, handle: &NamespaceHandle, request: &ResourceRequest) -> Response {
        if let Some(entry) = self.lookup(handle, request).await {
            return entry.to_response(ResponseSource::Cache);
        }

        match self.shared_fetch(handle, request).await {
            Ok(response) => network_response(&response, ResponseSource::Network),
            Err(_) => self.fallback_for(request),
        }
    }

    async fn network_first(&self, handle: &NamespaceHandle, request: &ResourceRequest) -> Response {
        let network = self.shared_fetch(handle, request);
        let failure = match tokio::time::timeout(self.network_timeout, network).await {
            Ok(Ok(response)) => return network_response(&response, ResponseSource::Network),
            Ok(Err(e)) => e,
            Err(_) => {
                // The fetch keeps running and still stores its result.
                debug!(
                    "Network leg for {} exceeded {:?}",
                    request.key(),
                    self.network_timeout
                );
                self.reporter.report_error(ErrorKind::Network, request.key().as_str());
                FetchError::TimedOut
            }
        };

        match handle.match_allow_stale(request.key().as_str()).await {
            Ok(Some(lookup)) => {
                debug!(
                    "Serving cached {} after network failure ({})",
                    request.key(),
                    failure
                );
                let source = if lookup.fresh {
                    ResponseSource::Cache
                } else {
                    ResponseSource::StaleCache
                };
                lookup.entry.to_response(source)
            }
            Ok(None) => self.fallback_for(request),
            Err(e) => {
                warn!("Cache lookup failed for {}: {}", request.key(), e);
                self.fallback_for(request)
            }
        }
    }

    async fn stale_while_revalidate(
        &self,
        handle: &NamespaceHandle,
        request: &ResourceRequest,
    ) -> Response {
        match handle.match_allow_stale(request.key().as_str()).await {
            Ok(Some(lookup)) => {
                // Already driven by the in-flight map; not awaited here.
                drop(self.shared_fetch(handle, request));
                debug!("Revalidating {} in background", request.key());
                let source = if lookup.fresh {
                    ResponseSource::Cache
                } else {
                    ResponseSource::StaleCache
                };
                lookup.entry.to_response(source)
            }
            Ok(None) => self.cache_first(handle, request).await,
            Err(e) => {
                warn!("Cache lookup failed for {}: {}", request.key(), e);
                self.cache_first(handle, request).await
            }
        }
    }

    async fn lookup(
        &self,
        handle: &NamespaceHandle,
        request: &ResourceRequest,
    ) -> Option<CacheEntry> {
        match handle.match_entry(request.key().as_str()).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Cache lookup failed for {}: {}", request.key(), e);
                None
            }
        }
    }

    /// Join or start the single fetch for this key. The fetch stores its
    /// own result into `handle`.
    fn shared_fetch(&self, handle: &NamespaceHandle, request: &ResourceRequest) -> SharedFetch {
        let fetcher = Arc::clone(&self.fetcher);
        let handle = handle.clone();
        let request = request.clone();
        let reporter = self.reporter.clone();
        let key = request.key().clone();

        self.inflight
            .join(&key, move || {
                async move {
                    let result = fetcher.fetch(&request).await;
                    match result {
                        Ok(ref response) => store_response(&handle, &request, response).await,
                        Err(ref e) => {
                            warn!("Fetch failed for {}: {}", request.key(), e);
                            reporter.report_error(ErrorKind::Network, request.key().as_str());
                        }
                    }
                    result
                }
                .boxed()
            })
            .fetch
    }

    /// Placeholder for images, the offline marker for JSON endpoints, an
    /// empty 503 for everything else.
    fn fallback_for(&self, request: &ResourceRequest) -> Response {
        self.metrics.record_fallback();
        match request.kind() {
            ResourceKind::Image => Response::new(
                200,
                self.fallback.image_content_type.clone(),
                Payload::Bytes(self.fallback.image_body.clone().into_bytes()),
                ResponseSource::Fallback,
            ),
            ResourceKind::Api => Response::offline_json(self.fallback.offline_marker.clone()),
            _ => Response::unavailable(),
        }
    }
}

fn network_response(response: &NetworkResponse, source: ResponseSource) -> Response {
    Response::new(
        response.status,
        response.content_type(),
        response.payload(),
        source,
    )
}

/// Store a network response according to its status and freshness headers.
async fn store_response(
    handle: &NamespaceHandle,
    request: &ResourceRequest,
    response: &NetworkResponse,
) {
    if !response.is_success() {
        debug!("Not caching {} (status {})", request.key(), response.status);
        return;
    }

    let now = handle.now_ms();
    let freshness =
        freshness_from_headers(&response.headers, UNIX_EPOCH + Duration::from_millis(now));
    let Some(ttl_ms) = freshness.ttl_or(handle.spec().ttl_ms) else {
        debug!("Not caching {} (no-store)", request.key());
        return;
    };

    let entry = CacheEntry::new(
        request.key().as_str(),
        response.payload(),
        response.content_type(),
        ttl_ms,
        now,
    )
    .with_status(response.status);

    match handle.put(entry).await {
        Ok(outcome) => {
            if !outcome.evicted.is_empty() {
                debug!("Storing {} evicted {:?}", request.key(), outcome.evicted);
            }
        }
        Err(CacheError::EntryTooLarge { size, max }) => {
            debug!(
                "Not caching {} in {}: {} bytes exceeds budget of {}",
                request.key(),
                handle.name(),
                size,
                max
            );
        }
        Err(e) => warn!("Failed to store {} in {}: {}", request.key(), handle.name(), e),
    }
}
