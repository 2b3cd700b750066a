//! Worker lifecycle actor
//!
//! The engine and every namespace live inside one spawned task. The page side
//! only holds a [`WorkerHandle`], which talks to that task over a channel, so
//! no mutable state is shared across the boundary.
//!
//! Lifecycle: `install` precaches the asset list and then signals readiness,
//! `activate` purges stale namespace versions and claims control, `fetch`
//! intercepts. Until activation completes, fetches are passed straight
//! through to the network.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use progload_domain::{LoadError, ResourceLoader, ResourceRequest, Response, SignalReporter};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::WorkerConfig;
use crate::engine::CacheStrategyEngine;
use crate::fetcher::NetworkFetcher;
use crate::metrics::CacheStats;
use crate::namespace::CacheNamespaceStore;
use crate::routes::RouteTable;
use crate::{CacheError, Result};

/// Lifecycle position of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, nothing installed yet
    Parsed,
    /// Precache complete and readiness signalled
    Ready,
    /// Stale namespaces purged, intercepting fetches
    Activated,
    /// Torn down
    Stopped,
}

/// Outcome of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub namespace: String,
    pub precached: Vec<String>,
}

/// Counters for every open namespace plus the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub state: WorkerState,
    pub namespaces: HashMap<String, CacheStats>,
    pub engine: CacheStats,
}

enum WorkerMessage {
    Install {
        reply: oneshot::Sender<Result<InstallReport>>,
    },
    Activate {
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    Fetch {
        request: ResourceRequest,
        reply: oneshot::Sender<Response>,
    },
    Stats {
        reply: oneshot::Sender<WorkerStats>,
    },
    Shutdown {
        reply: oneshot::Sender<Result<()>>,
    },
}

/// The actor itself. Construct with [`Worker::new`] or
/// [`Worker::from_config`], then [`Worker::spawn`] it.
pub struct Worker {
    engine: Arc<CacheStrategyEngine>,
    precache_namespace: String,
    precache: Vec<ResourceRequest>,
    state: WorkerState,
}

impl Worker {
    pub fn new(
        engine: Arc<CacheStrategyEngine>,
        precache_namespace: impl Into<String>,
        precache: Vec<ResourceRequest>,
    ) -> Self {
        Self {
            engine,
            precache_namespace: precache_namespace.into(),
            precache,
            state: WorkerState::Parsed,
        }
    }

    /// Build the store, routes and engine described by `config`.
    pub fn from_config(
        config: &WorkerConfig,
        fetcher: Arc<dyn NetworkFetcher>,
        clock: Arc<dyn Clock>,
        reporter: SignalReporter,
    ) -> Result<Self> {
        config.validate()?;

        let precache = config
            .precache
            .assets
            .iter()
            .map(|asset| ResourceRequest::get(asset))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let store = Arc::new(
            CacheNamespaceStore::new(config.namespaces.clone(), config.storage_root.clone(), clock)
                .with_reporter(reporter.clone()),
        );
        let routes = RouteTable::new(
            config.routes.clone(),
            config.default_namespace.clone(),
            precache.iter().map(|request| request.key().clone()),
        );
        let engine = CacheStrategyEngine::from_config(config, store, routes, fetcher)
            .with_reporter(reporter);

        Ok(Self::new(
            Arc::new(engine),
            config.precache.namespace.clone(),
            precache,
        ))
    }

    /// Start the actor on the current runtime.
    pub fn spawn(self) -> (WorkerHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(receiver));
        (WorkerHandle { sender }, task)
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<WorkerMessage>) {
        debug!("Worker started");
        while let Some(message) = receiver.recv().await {
            match message {
                WorkerMessage::Install { reply } => {
                    let _ = reply.send(self.install().await);
                }
                WorkerMessage::Activate { reply } => {
                    let _ = reply.send(self.activate().await);
                }
                WorkerMessage::Fetch { request, reply } => self.fetch(request, reply),
                WorkerMessage::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                WorkerMessage::Shutdown { reply } => {
                    let result = self.engine.store().teardown().await;
                    self.state = WorkerState::Stopped;
                    let _ = reply.send(result);
                    break;
                }
            }
        }
        info!("Worker stopped");
    }

    async fn install(&mut self) -> Result<InstallReport> {
        if self.state != WorkerState::Parsed {
            return Err(CacheError::Lifecycle {
                message: format!("install called in state {:?}", self.state),
            });
        }

        let handle = self.engine.store().open(&self.precache_namespace)?;
        let mut precached = Vec::with_capacity(self.precache.len());
        for request in &self.precache {
            // Any failure fails the whole install; the worker stays Parsed.
            self.engine.prefetch(&handle, request).await?;
            precached.push(request.key().to_string());
        }
        info!(
            "Precached {} assets into {}",
            precached.len(),
            handle.name()
        );

        self.skip_waiting();
        Ok(InstallReport {
            namespace: handle.name().to_string(),
            precached,
        })
    }

    /// Readiness signal: the installed worker may activate without waiting
    /// for older controllers to go away.
    fn skip_waiting(&mut self) {
        self.state = WorkerState::Ready;
        debug!("Worker ready to activate");
    }

    async fn activate(&mut self) -> Result<Vec<String>> {
        if self.state != WorkerState::Ready {
            return Err(CacheError::Lifecycle {
                message: format!("activate called in state {:?}", self.state),
            });
        }

        let store = self.engine.store();
        let purged = store.purge_stale(&store.declared_versions()).await?;
        self.state = WorkerState::Activated;
        info!("Worker activated and controlling, purged {:?}", purged);
        Ok(purged)
    }

    fn fetch(&self, request: ResourceRequest, reply: oneshot::Sender<Response>) {
        let engine = Arc::clone(&self.engine);
        let controlling = self.state == WorkerState::Activated;
        tokio::spawn(async move {
            let response = if controlling {
                engine.intercept(&request).await
            } else {
                engine.passthrough(&request).await
            };
            if reply.send(response).is_err() {
                debug!("Requester of {} went away", request.key());
            }
        });
    }

    fn stats(&self) -> WorkerStats {
        WorkerStats {
            state: self.state,
            namespaces: self.engine.store().stats(),
            engine: self.engine.metrics().snapshot(),
        }
    }
}

/// Message-passing handle to a running worker. Cheap to clone.
#[derive(Clone)]
pub struct WorkerHandle {
    sender: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerHandle {
    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> WorkerMessage) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .map_err(|_| CacheError::WorkerGone)?;
        response.await.map_err(|_| CacheError::WorkerGone)
    }

    pub async fn install(&self) -> Result<InstallReport> {
        self.call(|reply| WorkerMessage::Install { reply }).await?
    }

    pub async fn activate(&self) -> Result<Vec<String>> {
        self.call(|reply| WorkerMessage::Activate { reply }).await?
    }

    pub async fn fetch(&self, request: ResourceRequest) -> Result<Response> {
        self.call(|reply| WorkerMessage::Fetch { request, reply }).await
    }

    pub async fn stats(&self) -> Result<WorkerStats> {
        self.call(|reply| WorkerMessage::Stats { reply }).await
    }

    /// Clear every namespace in both tiers and stop the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.call(|reply| WorkerMessage::Shutdown { reply }).await?
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[async_trait]
impl ResourceLoader for WorkerHandle {
    async fn load(&self, request: ResourceRequest) -> std::result::Result<Response, LoadError> {
        let key = request.key().clone();
        let response = self.fetch(request).await.map_err(|_| LoadError::LoaderGone)?;
        if response.is_success() && !response.is_degraded() {
            Ok(response)
        } else {
            warn!("Load of {} answered with {:?} ({})", key, response.source, response.status);
            Err(LoadError::Unavailable {
                status: response.status,
            })
        }
    }
}
