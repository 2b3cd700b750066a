//! # Progload
//!
//! Progressive resource loading with two isolated halves:
//!
//! - a cache worker ([`progload_cache`]) that intercepts requests and answers
//!   them from versioned, tiered cache namespaces
//! - a page runtime ([`progload_page`]) that lazy-loads deferred elements,
//!   negotiates image formats and adapts to performance signals
//!
//! [`Runtime`] wires one of each together. The page side only ever sees the
//! worker through [`progload_domain::ResourceLoader`].
//!
//! ```no_run
//! use progload::RuntimeBuilder;
//!
//! # async fn demo() -> progload::Result<()> {
//! let runtime = RuntimeBuilder::new().build().await?;
//! runtime.start().await?;
//! let mut scheduler = runtime.scheduler();
//! // observe elements, then drive the scheduler with a visibility trigger
//! # let _ = &mut scheduler;
//! let snapshot = runtime.teardown().await?;
//! println!("{:?}", snapshot.errors);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use progload_cache::{
    CacheError, Clock, HttpFetcher, InstallReport, NetworkFetcher, SystemClock, Worker,
    WorkerConfig, WorkerHandle,
};
use progload_domain::SignalReporter;
use progload_page::{
    CodecProbe, FormatNegotiator, ImageDecodeProbe, LazyLoadScheduler, PageConfig, PageError,
    PerformanceObserverBridge, PerformanceSnapshot, ResourcePriorityManager, ViewportSource,
    VisibilityEvent, VisibilityTrigger,
};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub use progload_cache as cache;
pub use progload_domain as domain;
pub use progload_page as page;

/// Errors raised while wiring or tearing down a runtime
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Page error: {0}")]
    Page(#[from] PageError),

    #[error("Network client error: {0}")]
    Fetcher(String),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Collects the pluggable parts of a [`Runtime`]. Anything left unset gets
/// the production default.
#[derive(Default)]
pub struct RuntimeBuilder {
    worker: WorkerConfig,
    page: PageConfig,
    fetcher: Option<Arc<dyn NetworkFetcher>>,
    clock: Option<Arc<dyn Clock>>,
    probe: Option<Arc<dyn CodecProbe>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load both configurations from YAML files; a missing file means
    /// defaults.
    pub fn from_files(worker: &Path, page: &Path) -> Result<Self> {
        Ok(Self::new()
            .worker_config(WorkerConfig::from_file(worker)?)
            .page_config(PageConfig::from_file(page)?))
    }

    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker = config;
        self
    }

    pub fn page_config(mut self, config: PageConfig) -> Self {
        self.page = config;
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn NetworkFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn codec_probe(mut self, probe: Arc<dyn CodecProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Spawn the worker actor and the performance bridge on the current
    /// tokio runtime. The worker is not installed yet; see [`Runtime::start`].
    pub async fn build(self) -> Result<Runtime> {
        self.page.validate()?;

        let fetcher = match self.fetcher {
            Some(fetcher) => fetcher,
            None => {
                let timeout = Duration::from_millis(self.worker.network_timeout_ms);
                let http = HttpFetcher::with_timeout(self.worker.base_url.clone(), timeout)
                    .map_err(|e| RuntimeError::Fetcher(e.to_string()))?;
                Arc::new(http)
            }
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let probe = self.probe.unwrap_or_else(|| Arc::new(ImageDecodeProbe));

        let (reporter, signals) = SignalReporter::channel();

        let worker = Worker::from_config(&self.worker, fetcher, clock, reporter.clone())?;
        let (worker, worker_task) = worker.spawn();

        let bridge = PerformanceObserverBridge::new(&self.page);
        let root_margin = bridge.root_margin();
        let snapshots = bridge.subscribe();
        let (stop_bridge, stopped) = oneshot::channel::<()>();
        let bridge_task = tokio::spawn(bridge.run_until(signals, async {
            let _ = stopped.await;
        }));

        debug!("Runtime wired");
        Ok(Runtime {
            worker,
            worker_task,
            negotiator: Arc::new(FormatNegotiator::new(probe)),
            page: self.page,
            reporter,
            root_margin,
            snapshots,
            stop_bridge,
            bridge_task,
        })
    }
}

/// One worker plus the shared page-side services.
pub struct Runtime {
    worker: WorkerHandle,
    worker_task: JoinHandle<()>,
    negotiator: Arc<FormatNegotiator>,
    page: PageConfig,
    reporter: SignalReporter,
    root_margin: watch::Receiver<f64>,
    snapshots: watch::Receiver<PerformanceSnapshot>,
    stop_bridge: oneshot::Sender<()>,
    bridge_task: JoinHandle<PerformanceSnapshot>,
}

impl Runtime {
    /// Install (precache) and activate the worker. Fetches made before this
    /// completes go straight to the network.
    pub async fn start(&self) -> Result<InstallReport> {
        let report = self.worker.install().await?;
        let purged = self.worker.activate().await?;
        info!(
            "Runtime started: {} assets precached, {} stale namespaces purged",
            report.precached.len(),
            purged.len()
        );
        Ok(report)
    }

    pub fn worker(&self) -> &WorkerHandle {
        &self.worker
    }

    pub fn negotiator(&self) -> Arc<FormatNegotiator> {
        Arc::clone(&self.negotiator)
    }

    pub fn page_config(&self) -> &PageConfig {
        &self.page
    }

    /// Reporter for host-originated signals (paint timings, long tasks,
    /// network class).
    pub fn reporter(&self) -> SignalReporter {
        self.reporter.clone()
    }

    /// A scheduler that loads through the worker and follows the bridge's
    /// root margin.
    pub fn scheduler(&self) -> LazyLoadScheduler {
        LazyLoadScheduler::new(
            &self.page,
            Arc::new(self.worker.clone()),
            self.negotiator(),
            self.root_margin.clone(),
        )
        .with_reporter(self.reporter())
    }

    pub fn priorities(&self) -> ResourcePriorityManager {
        ResourcePriorityManager::new(self.page.early_hint_limit)
    }

    /// Observer-driven trigger when the host has one, polling otherwise.
    pub fn visibility_trigger(
        &self,
        observer: Option<BoxStream<'static, VisibilityEvent>>,
        viewport: Arc<dyn ViewportSource>,
    ) -> VisibilityTrigger {
        VisibilityTrigger::detect(observer, viewport, self.page.poll_interval(), &self.reporter)
    }

    pub fn root_margin(&self) -> f64 {
        *self.root_margin.borrow()
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Clear every namespace in both tiers, stop the worker and the bridge,
    /// and return the final performance snapshot.
    pub async fn teardown(self) -> Result<PerformanceSnapshot> {
        let shutdown = self.worker.shutdown().await;
        self.worker_task.await?;

        let _ = self.stop_bridge.send(());
        let snapshot = self.bridge_task.await?;
        shutdown?;

        info!("Runtime torn down");
        Ok(snapshot)
    }
}
