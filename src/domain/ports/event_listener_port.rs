//! Port definition for request lifecycle callbacks.

use crate::domain::entities::{DataSource, ImageRequest, RequestState};
use crate::domain::errors::ImageError;

/// Observes a request as it moves through the pipeline.
///
/// Listeners never influence cache keys. Callbacks run inline on the
/// pipeline task and must return quickly.
pub trait EventListener: Send + Sync {
    /// Called once when the request starts.
    fn on_start(&self, request: &ImageRequest) {
        let _ = request;
    }

    /// Called on every state transition.
    fn on_state(&self, request: &ImageRequest, state: RequestState) {
        let _ = (request, state);
    }

    /// Called when the request succeeds.
    fn on_success(&self, request: &ImageRequest, data_source: DataSource) {
        let _ = (request, data_source);
    }

    /// Called when the request fails.
    fn on_error(&self, request: &ImageRequest, error: &ImageError) {
        let _ = (request, error);
    }
}

/// Listener that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventListener;

impl EventListener for NoopEventListener {}
