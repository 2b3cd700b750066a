//! # Progload Domain
//!
//! Vocabulary shared by the two isolated halves of the loader:
//!
//! - the worker side (`progload-cache`), which intercepts requests and owns
//!   every cache namespace
//! - the page side (`progload-page`), which decides *when* a deferred resource
//!   is requested
//!
//! The halves never share mutable state. They meet only through
//! [`ResourceLoader`] (request in, response out) and the [`PerformanceSignal`]
//! channel used for observability.

pub mod error;
pub mod loader;
pub mod request;
pub mod response;
pub mod signal;

pub use error::{DomainError, ErrorKind, LoadError};
pub use loader::ResourceLoader;
pub use request::{
    Codec, CredentialsMode, Method, Priority, RequestKey, ResourceKind, ResourceRequest,
    ResourceRequestBuilder, Variant,
};
pub use response::{Payload, Response, ResponseSource};
pub use signal::{NetworkClass, PaintKind, PerformanceSignal, SignalReporter};

/// Result type for domain operations
pub type Result<T> = std::result::Result<T, DomainError>;
