//! `data:` URI fetcher.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::domain::entities::{DataSource, FetchResult, ImageRequest, Liveness};
use crate::domain::errors::{ImageError, ImageResult};
use crate::domain::ports::Fetcher;

/// Decodes images embedded in `data:` URIs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataUriFetcher;

impl DataUriFetcher {
    /// Creates the fetcher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns true for `data:` locators.
    #[must_use]
    pub fn handles(request: &ImageRequest) -> bool {
        request.data().starts_with("data:")
    }
}

#[async_trait]
impl Fetcher for DataUriFetcher {
    async fn fetch(&self, request: &ImageRequest, liveness: &Liveness) -> ImageResult<FetchResult> {
        liveness.check()?;
        let Some(rest) = request.data().strip_prefix("data:") else {
            return Err(ImageError::not_found(request.data()));
        };
        let Some((header, payload)) = rest.split_once(',') else {
            return Err(ImageError::decode("data URI has no payload"));
        };

        let mut parts = header.split(';');
        let mime_type = parts
            .next()
            .filter(|mime| !mime.is_empty())
            .map(str::to_string);
        let bytes = if parts.any(|part| part == "base64") {
            STANDARD
                .decode(payload.trim())
                .map_err(|e| ImageError::decode(format!("invalid base64 payload: {e}")))?
        } else {
            payload.as_bytes().to_vec()
        };

        Ok(FetchResult::new(bytes, mime_type, DataSource::Memory))
    }
}
