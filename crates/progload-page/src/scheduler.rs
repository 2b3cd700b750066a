//! Visibility-driven lazy loading
//!
//! Every observed element moves `pending -> loading -> {loaded, error}`.
//! Terminal elements are unobserved; only [`LazyLoadScheduler::reset`] moves
//! an element from `error` back to `pending`.
//!
//! Visibility arrives either as a stream of [`VisibilityEvent`]s from a host
//! observer, or, when the host has none, from a throttled poll that reads each
//! element's geometry. Both feed the same intersection test.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, FuturesUnordered};
use futures::{FutureExt, StreamExt};
use progload_domain::{
    LoadError, ResourceLoader, ResourceRequest, Response, SignalReporter, Variant,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, info, warn};

use crate::config::{Backoff, PageConfig, RetryConfig};
use crate::error::PageError;
use crate::format::FormatNegotiator;
use crate::priority::{ElementMeta, ResourcePriorityManager};
use crate::Result;

pub const DATA_SRC: &str = "data-src";
pub const DATA_SRCSET: &str = "data-srcset";

/// Lifecycle of an observed element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementState {
    Pending,
    Loading,
    Loaded,
    Error,
}

impl ElementState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ElementState::Loaded | ElementState::Error)
    }

    /// Forward transitions only.
    pub fn can_advance_to(&self, next: ElementState) -> bool {
        matches!(
            (self, next),
            (ElementState::Pending, ElementState::Loading)
                | (ElementState::Loading, ElementState::Loaded)
                | (ElementState::Loading, ElementState::Error)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Element box in viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

/// Whether `rect` counts as visible: it must touch the viewport grown by
/// `root_margin` on every side, and the visible fraction of its area must
/// reach `threshold`. Zero-area elements count as fully visible once they
/// touch.
pub fn is_visible(rect: &Rect, viewport: &Viewport, root_margin: f64, threshold: f64) -> bool {
    let (left, top) = (-root_margin, -root_margin);
    let (right, bottom) = (viewport.width + root_margin, viewport.height + root_margin);

    let overlap_w = (rect.x + rect.width).min(right) - rect.x.max(left);
    let overlap_h = (rect.y + rect.height).min(bottom) - rect.y.max(top);
    if overlap_w < 0.0 || overlap_h < 0.0 {
        return false;
    }

    let area = rect.width * rect.height;
    let ratio = if area > 0.0 {
        (overlap_w * overlap_h) / area
    } else {
        1.0
    };
    ratio >= threshold
}

/// A deferred page element. The scheduler only holds weak references; a
/// dropped element is silently forgotten.
pub trait DeferredElement: Send + Sync {
    fn attribute(&self, name: &str) -> Option<String>;

    fn set_attribute(&self, name: &str, value: &str);

    fn remove_attribute(&self, name: &str);

    fn bounding_rect(&self) -> Rect;

    /// Hand the loaded resource to the element. An error means the bytes
    /// could not be decoded.
    fn commit(&self, response: &Response) -> std::result::Result<(), String>;
}

/// One visibility notification from a host observer.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibilityEvent {
    pub id: ElementId,
    pub rect: Rect,
    pub viewport: Viewport,
}

/// Current viewport size, read by the polling trigger.
pub trait ViewportSource: Send + Sync {
    fn viewport(&self) -> Viewport;
}

/// How visibility changes reach the scheduler.
pub enum VisibilityTrigger {
    Observer(BoxStream<'static, VisibilityEvent>),
    Polling {
        viewport: Arc<dyn ViewportSource>,
        interval: Duration,
    },
}

impl VisibilityTrigger {
    /// Use the host observer when there is one, otherwise poll. The missing
    /// observer is reported once as an unsupported feature.
    pub fn detect(
        observer: Option<BoxStream<'static, VisibilityEvent>>,
        viewport: Arc<dyn ViewportSource>,
        interval: Duration,
        reporter: &SignalReporter,
    ) -> Self {
        match observer {
            Some(events) => VisibilityTrigger::Observer(events),
            None => {
                let error = PageError::UnsupportedFeature {
                    feature: "IntersectionObserver".to_string(),
                };
                info!("{}; falling back to polling every {:?}", error, interval);
                reporter.report_error(error.kind(), "visibility");
                VisibilityTrigger::Polling { viewport, interval }
            }
        }
    }

    pub fn is_polling(&self) -> bool {
        matches!(self, VisibilityTrigger::Polling { .. })
    }
}

/// Delay schedule between load attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff: Backoff,
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry: &RetryConfig) -> Self {
        Self {
            max_retries,
            initial_delay_ms: retry.initial_delay_ms,
            backoff: retry.backoff,
            max_delay_ms: retry.max_delay_ms,
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let delay_ms = match self.backoff {
            Backoff::Fixed => self.initial_delay_ms,
            Backoff::Exponential => {
                let factor = 2u64.saturating_pow(retry.saturating_sub(1));
                self.initial_delay_ms.saturating_mul(factor)
            }
        };
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Result of one element's load, retries included.
pub struct LoadOutcome {
    pub id: ElementId,
    pub url: String,
    pub attempts: u32,
    pub result: std::result::Result<Response, LoadError>,
}

/// A load in flight for one element.
pub type PendingLoad = BoxFuture<'static, LoadOutcome>;

struct ObservedElement {
    node: Weak<dyn DeferredElement>,
    meta: ElementMeta,
    variants: Vec<Variant>,
    state: ElementState,
    observing: bool,
}

/// Per-element visibility state machine.
pub struct LazyLoadScheduler {
    loader: Arc<dyn ResourceLoader>,
    negotiator: Arc<FormatNegotiator>,
    priorities: ResourcePriorityManager,
    reporter: SignalReporter,
    root_margin: watch::Receiver<f64>,
    threshold: f64,
    retry: RetryPolicy,
    fallback_src: String,
    elements: HashMap<ElementId, ObservedElement>,
    next_id: u64,
}

impl LazyLoadScheduler {
    pub fn new(
        config: &PageConfig,
        loader: Arc<dyn ResourceLoader>,
        negotiator: Arc<FormatNegotiator>,
        root_margin: watch::Receiver<f64>,
    ) -> Self {
        Self {
            loader,
            negotiator,
            priorities: ResourcePriorityManager::new(config.early_hint_limit),
            reporter: SignalReporter::disconnected(),
            root_margin,
            threshold: config.threshold,
            retry: RetryPolicy::new(config.max_retries, &config.retry),
            fallback_src: config.fallback_src.clone(),
            elements: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn with_reporter(mut self, reporter: SignalReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn root_margin(&self) -> f64 {
        *self.root_margin.borrow()
    }

    /// Start observing `node`. It must carry `data-src` or `data-srcset`.
    /// Priority and decoding attributes are set right away.
    pub fn observe(
        &mut self,
        node: &Arc<dyn DeferredElement>,
        meta: ElementMeta,
        variants: Vec<Variant>,
    ) -> Result<ElementId> {
        if node.attribute(DATA_SRC).is_none() && node.attribute(DATA_SRCSET).is_none() {
            return Err(PageError::MissingSource);
        }

        let hints = self.priorities.classify(&meta);
        node.set_attribute("fetchpriority", hints.priority.as_str());
        node.set_attribute("decoding", hints.decoding.as_str());

        let id = ElementId(self.next_id);
        self.next_id += 1;
        self.elements.insert(
            id,
            ObservedElement {
                node: Arc::downgrade(node),
                meta,
                variants,
                state: ElementState::Pending,
                observing: true,
            },
        );
        debug!("Observing element {}", id);
        Ok(id)
    }

    pub fn state(&self, id: ElementId) -> Option<ElementState> {
        self.elements.get(&id).map(|element| element.state)
    }

    pub fn is_observing(&self, id: ElementId) -> bool {
        self.elements.get(&id).is_some_and(|element| element.observing)
    }

    /// Elements still waiting for visibility or a load
    pub fn active_count(&self) -> usize {
        self.elements.values().filter(|e| !e.state.is_terminal()).count()
    }

    /// Move a failed element back to `pending` and observe it again.
    pub fn reset(&mut self, id: ElementId) -> Result<()> {
        let element = self
            .elements
            .get_mut(&id)
            .ok_or(PageError::UnknownElement(id))?;
        if element.state != ElementState::Error {
            return Err(PageError::InvalidTransition {
                id,
                from: element.state,
                to: ElementState::Pending,
            });
        }
        element.state = ElementState::Pending;
        element.observing = true;
        debug!("Element {} reset to pending", id);
        Ok(())
    }

    /// Handle one observer notification.
    pub fn on_visibility(&mut self, event: &VisibilityEvent) -> Option<PendingLoad> {
        let margin = self.root_margin();
        if !is_visible(&event.rect, &event.viewport, margin, self.threshold) {
            return None;
        }
        self.start_load(event.id)
    }

    /// Poll every observed pending element against `viewport`.
    pub fn poll_visibility(&mut self, viewport: &Viewport) -> Vec<PendingLoad> {
        let margin = self.root_margin();
        let mut visible = Vec::new();
        let mut gone = Vec::new();

        for (id, element) in &self.elements {
            if !element.observing || element.state != ElementState::Pending {
                continue;
            }
            match element.node.upgrade() {
                Some(node) => {
                    if is_visible(&node.bounding_rect(), viewport, margin, self.threshold) {
                        visible.push(*id);
                    }
                }
                None => gone.push(*id),
            }
        }
        for id in gone {
            self.forget(id);
        }

        visible.sort();
        visible.into_iter().filter_map(|id| self.start_load(id)).collect()
    }

    /// `pending -> loading`, producing the load future.
    fn start_load(&mut self, id: ElementId) -> Option<PendingLoad> {
        let element = self.elements.get_mut(&id)?;
        if !element.observing || !element.state.can_advance_to(ElementState::Loading) {
            return None;
        }
        let Some(node) = element.node.upgrade() else {
            self.forget(id);
            return None;
        };

        let data_src = node.attribute(DATA_SRC).or_else(|| {
            node.attribute(DATA_SRCSET)
                .and_then(|srcset| first_srcset_url(&srcset))
        });
        let Some(data_src) = data_src else {
            warn!("Element {} lost its data-src", id);
            return None;
        };

        element.state = ElementState::Loading;
        debug!("Element {} visible, loading", id);

        let priority = self.priorities.classify(&element.meta).priority;
        let kind = element.meta.kind;
        let variants = element.variants.clone();
        let loader = Arc::clone(&self.loader);
        let negotiator = Arc::clone(&self.negotiator);
        let retry = self.retry.clone();

        Some(
            async move {
                let url = match negotiator.choose_variant(&variants).await {
                    Some(url) => url.to_string(),
                    None => data_src,
                };
                // Without an explicit kind the builder infers one from the URL
                let mut builder = ResourceRequest::builder(url.as_str())
                    .priority(priority)
                    .variants(variants);
                if let Some(kind) = kind {
                    builder = builder.kind(kind);
                }
                let (attempts, result) = match builder.build() {
                    Ok(request) => load_with_retry(loader.as_ref(), request, &retry).await,
                    Err(e) => (
                        0,
                        Err(LoadError::Network {
                            message: e.to_string(),
                        }),
                    ),
                };
                LoadOutcome {
                    id,
                    url,
                    attempts,
                    result,
                }
            }
            .boxed(),
        )
    }

    /// Apply a finished load: `loading -> loaded` or `loading -> error`.
    pub fn complete(&mut self, outcome: LoadOutcome) {
        let LoadOutcome {
            id,
            url,
            attempts,
            result,
        } = outcome;
        let Some(element) = self.elements.get_mut(&id) else {
            return;
        };
        if element.state != ElementState::Loading {
            return;
        }
        let Some(node) = element.node.upgrade() else {
            self.forget(id);
            return;
        };

        let committed = result.and_then(|response| {
            node.commit(&response)
                .map_err(|message| LoadError::Decode { message })
        });

        element.observing = false;
        match committed {
            Ok(()) => {
                node.set_attribute("src", &url);
                if let Some(srcset) = node.attribute(DATA_SRCSET) {
                    node.set_attribute("srcset", &srcset);
                }
                node.remove_attribute(DATA_SRC);
                node.remove_attribute(DATA_SRCSET);
                element.state = ElementState::Loaded;
                debug!("Element {} loaded {} after {} attempt(s)", id, url, attempts);
            }
            Err(e) => {
                node.set_attribute("src", &self.fallback_src);
                element.state = ElementState::Error;
                warn!(
                    "Element {} failed after {} attempt(s): {}; using fallback",
                    id, attempts, e
                );
                self.reporter.report_error(e.kind(), url);
            }
        }
    }

    fn forget(&mut self, id: ElementId) {
        if self.elements.remove(&id).is_some() {
            debug!("Element {} dropped by the page", id);
        }
    }

    /// Drive the state machine until every element is terminal (or the
    /// observer stream ends) and all loads have finished.
    pub async fn run(&mut self, trigger: VisibilityTrigger) {
        let mut loads: FuturesUnordered<PendingLoad> = FuturesUnordered::new();

        match trigger {
            VisibilityTrigger::Observer(mut events) => {
                let mut events_open = true;
                loop {
                    if !events_open && loads.is_empty() {
                        break;
                    }
                    tokio::select! {
                        event = events.next(), if events_open => match event {
                            Some(event) => {
                                if let Some(load) = self.on_visibility(&event) {
                                    loads.push(load);
                                }
                            }
                            None => events_open = false,
                        },
                        Some(outcome) = loads.next(), if !loads.is_empty() => {
                            self.complete(outcome)
                        }
                    }
                }
            }
            VisibilityTrigger::Polling { viewport, interval } => {
                let mut ticks = IntervalStream::new(tokio::time::interval(interval));
                loop {
                    if self.active_count() == 0 && loads.is_empty() {
                        break;
                    }
                    tokio::select! {
                        Some(_) = ticks.next() => {
                            loads.extend(self.poll_visibility(&viewport.viewport()));
                        }
                        Some(outcome) = loads.next(), if !loads.is_empty() => {
                            self.complete(outcome)
                        }
                    }
                }
            }
        }
        debug!("Scheduler idle");
    }
}

/// First URL of a `srcset` value.
fn first_srcset_url(srcset: &str) -> Option<String> {
    srcset
        .split(',')
        .next()
        .and_then(|candidate| candidate.split_whitespace().next())
        .map(str::to_string)
}

/// Load `request`, retrying retryable failures up to `retry.max_retries`
/// times. Returns the attempts made and the final result.
async fn load_with_retry(
    loader: &dyn ResourceLoader,
    request: ResourceRequest,
    retry: &RetryPolicy,
) -> (u32, std::result::Result<Response, LoadError>) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match loader.load(request.clone()).await {
            Ok(response) => return (attempt, Ok(response)),
            Err(e) if e.is_retryable() && attempt <= retry.max_retries => {
                let delay = retry.delay(attempt);
                debug!(
                    "Load of {} failed ({}); retry {} in {:?}",
                    request.key(),
                    e,
                    attempt,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return (attempt, Err(e)),
        }
    }
}
