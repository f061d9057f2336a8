//! Port definition for fetching raw image bytes.

use async_trait::async_trait;

use crate::domain::entities::{FetchResult, ImageRequest, Liveness};
use crate::domain::errors::ImageResult;

/// Turns a request's resource locator into bytes.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Returns true if fetching `request` would reach the network.
    ///
    /// Used to enforce the request's depth limit before any I/O starts.
    fn is_network(&self, request: &ImageRequest) -> bool {
        let _ = request;
        false
    }

    /// Fetches the bytes for `request`.
    ///
    /// Implementations check `liveness` between chunks.
    async fn fetch(&self, request: &ImageRequest, liveness: &Liveness) -> ImageResult<FetchResult>;
}
