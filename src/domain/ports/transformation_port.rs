//! Port definition for image transformations.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::entities::{DecodedImage, Size};
use crate::domain::errors::ImageResult;

/// Produces a new image from a decoded one.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transformation: Send + Sync {
    /// Stable tag identifying this transformation and its parameters.
    ///
    /// Part of the result key, so it must change whenever the output would.
    fn cache_key(&self) -> String;

    /// Transforms `image`; `Ok(None)` means the transformation was a no-op.
    async fn transform(
        &self,
        image: Arc<DecodedImage>,
        size: Size,
    ) -> ImageResult<Option<DecodedImage>>;
}
