//! Performance signals in, root-margin adjustments out
//!
//! The bridge consumes [`PerformanceSignal`]s from both sides of the loader
//! and nudges the scheduler's root margin one step at a time. Sustained long
//! tasks and constrained networks shrink it; fast networks and idle time grow
//! it. The margin always stays inside the configured bounds.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use progload_domain::{ErrorKind, NetworkClass, PaintKind, PerformanceSignal};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{BridgeConfig, PageConfig};

/// Timings and counters observed so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub first_paint_ms: Option<f64>,
    pub first_contentful_paint_ms: Option<f64>,
    /// Latest LCP candidate
    pub largest_contentful_paint_ms: Option<f64>,
    pub long_tasks: u64,
    pub errors: HashMap<ErrorKind, u64>,
    pub root_margin_px: f64,
    pub network: Option<NetworkClass>,
    pub save_data: bool,
}

impl PerformanceSnapshot {
    pub fn error_count(&self, kind: ErrorKind) -> u64 {
        self.errors.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Shrink,
    Grow,
}

pub struct PerformanceObserverBridge {
    config: BridgeConfig,
    margin_tx: watch::Sender<f64>,
    snapshot_tx: watch::Sender<PerformanceSnapshot>,
    recent_long_tasks: VecDeque<Instant>,
}

impl PerformanceObserverBridge {
    pub fn new(config: &PageConfig) -> Self {
        let bridge = config.bridge.clone();
        let initial = clamp_margin(&bridge, config.root_margin_px);
        let (margin_tx, _) = watch::channel(initial);
        let (snapshot_tx, _) = watch::channel(PerformanceSnapshot {
            root_margin_px: initial,
            ..PerformanceSnapshot::default()
        });
        Self {
            config: bridge,
            margin_tx,
            snapshot_tx,
            recent_long_tasks: VecDeque::new(),
        }
    }

    /// Receiver to hand to the scheduler
    pub fn root_margin(&self) -> watch::Receiver<f64> {
        self.margin_tx.subscribe()
    }

    pub fn margin(&self) -> f64 {
        *self.margin_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PerformanceSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn handle(&mut self, signal: PerformanceSignal) {
        match signal {
            PerformanceSignal::Paint { kind, at_ms } => self.record(|s| match kind {
                PaintKind::FirstPaint => s.first_paint_ms = Some(at_ms),
                PaintKind::FirstContentfulPaint => s.first_contentful_paint_ms = Some(at_ms),
            }),
            PerformanceSignal::LargestContentfulPaint { render_ms } => {
                self.record(|s| s.largest_contentful_paint_ms = Some(render_ms))
            }
            PerformanceSignal::LongTask { duration_ms } => self.on_long_task(duration_ms),
            PerformanceSignal::Network { class, save_data } => {
                self.record(|s| {
                    s.network = Some(class);
                    s.save_data = save_data;
                });
                if save_data || class.is_constrained() {
                    self.adjust(Direction::Shrink, "constrained network");
                } else if class == NetworkClass::FourG {
                    self.adjust(Direction::Grow, "fast network");
                }
            }
            PerformanceSignal::Idle => self.adjust(Direction::Grow, "idle"),
            PerformanceSignal::Error { kind, key } => {
                debug!("{} error reported for {}", kind.as_str(), key);
                self.record(|s| *s.errors.entry(kind).or_insert(0) += 1);
            }
        }
    }

    /// Consume signals until every reporter is dropped, then return the
    /// final snapshot.
    pub async fn run(
        self,
        signals: mpsc::UnboundedReceiver<PerformanceSignal>,
    ) -> PerformanceSnapshot {
        self.run_until(signals, std::future::pending()).await
    }

    /// Like [`run`](Self::run), but also stops once `shutdown` resolves.
    /// Signals already queued at that point are still applied.
    pub async fn run_until(
        mut self,
        mut signals: mpsc::UnboundedReceiver<PerformanceSignal>,
        shutdown: impl Future<Output = ()>,
    ) -> PerformanceSnapshot {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                signal = signals.recv() => match signal {
                    Some(signal) => self.handle(signal),
                    None => {
                        debug!("Signal channel closed");
                        break;
                    }
                },
                _ = &mut shutdown => {
                    while let Ok(signal) = signals.try_recv() {
                        self.handle(signal);
                    }
                    debug!("Bridge shut down");
                    break;
                }
            }
        }
        self.snapshot()
    }

    fn on_long_task(&mut self, duration_ms: f64) {
        if duration_ms < self.config.long_task_threshold_ms {
            return;
        }
        self.record(|s| s.long_tasks += 1);

        let now = Instant::now();
        let window = Duration::from_millis(self.config.long_task_window_ms);
        self.recent_long_tasks.push_back(now);
        while let Some(oldest) = self.recent_long_tasks.front() {
            if now.duration_since(*oldest) > window {
                self.recent_long_tasks.pop_front();
            } else {
                break;
            }
        }

        if self.recent_long_tasks.len() >= self.config.sustained_long_tasks {
            self.recent_long_tasks.clear();
            self.adjust(Direction::Shrink, "sustained long tasks");
        }
    }

    fn adjust(&mut self, direction: Direction, reason: &str) {
        let current = self.margin();
        let target = match direction {
            Direction::Shrink => current - self.config.step_px,
            Direction::Grow => current + self.config.step_px,
        };
        let next = clamp_margin(&self.config, target);
        if next == current {
            return;
        }
        self.margin_tx.send_replace(next);
        self.record(|s| s.root_margin_px = next);
        info!("Root margin {} -> {} px ({})", current, next, reason);
    }

    fn record(&self, update: impl FnOnce(&mut PerformanceSnapshot)) {
        self.snapshot_tx.send_modify(update);
    }
}

fn clamp_margin(config: &BridgeConfig, value: f64) -> f64 {
    value.max(config.min_margin_px).min(config.max_margin_px)
}
