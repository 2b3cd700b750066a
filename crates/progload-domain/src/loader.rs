//! The request/response boundary between the page and the worker

use async_trait::async_trait;

use crate::error::LoadError;
use crate::request::ResourceRequest;
use crate::response::Response;

/// Resolves a request on the far side of the isolation boundary.
///
/// Implementations must not share mutable state with the caller; the worker
/// handle implements this by message passing.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn load(&self, request: ResourceRequest) -> Result<Response, LoadError>;
}
