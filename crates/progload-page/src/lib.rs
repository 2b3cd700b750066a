//! # Progload Page
//!
//! Page side of the progressive loader. Decides when deferred resources are
//! requested and in which format, then hands the request to a
//! [`progload_domain::ResourceLoader`].
//!
//! - [`FormatNegotiator`] probes optional codecs once and picks variants
//! - [`ResourcePriorityManager`] sets fetch priority and emits early hints
//! - [`LazyLoadScheduler`] drives each element from `pending` to a terminal state
//! - [`PerformanceObserverBridge`] retunes the scheduler's root margin

pub mod config;
pub mod error;
pub mod format;
pub mod observer;
pub mod priority;
pub mod scheduler;

pub use config::{Backoff, BridgeConfig, PageConfig, RetryConfig};
pub use error::PageError;
pub use format::{
    choose_variant_with, CapabilityFlags, CodecProbe, FormatNegotiator, ImageDecodeProbe,
};
pub use observer::{PerformanceObserverBridge, PerformanceSnapshot};
pub use priority::{DecodingHint, EarlyHint, ElementMeta, Hints, ResourcePriorityManager};
pub use scheduler::{
    is_visible, DeferredElement, ElementId, ElementState, LazyLoadScheduler, LoadOutcome,
    PendingLoad, Rect, RetryPolicy, ViewportSource, Viewport, VisibilityEvent, VisibilityTrigger,
    DATA_SRC, DATA_SRCSET,
};

/// Result type for page operations
pub type Result<T> = std::result::Result<T, PageError>;
