//! Result cache stages.
//!
//! Transformed results are written to their own disk cache as PNG with a
//! JSON sidecar, so a later request with the same transformations skips
//! fetching, decoding and transforming.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::fetch::write_entry;
use super::{Chain, Exchange, Interceptor, weights};
use crate::domain::entities::{
    DataSource, DecodeResult, DecodedImage, FetchDepth, ImageMetadata,
};
use crate::domain::errors::{ImageError, ImageResult};
use crate::infrastructure::image::disk_cache::{DiskCache, DiskCacheError};

#[derive(Debug, Serialize, Deserialize)]
struct ResultMetadata {
    metadata: ImageMetadata,
    transformations: Vec<String>,
}

fn uses_result_cache(exchange: &Exchange) -> bool {
    exchange.apply_transformations && !exchange.request.options().transformations.is_empty()
}

async fn encode_png(image: Arc<DecodedImage>) -> ImageResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let mut buffer = Cursor::new(Vec::new());
        image
            .pixels()
            .write_to(&mut buffer, image::ImageFormat::Png)
            .map_err(|err| ImageError::io(format!("failed to encode result: {err}")))?;
        Ok(buffer.into_inner())
    })
    .await
    .map_err(|err| ImageError::io(format!("encode task failed: {err}")))?
}

async fn decode_png(bytes: bytes::Bytes) -> ImageResult<DecodedImage> {
    tokio::task::spawn_blocking(move || {
        image::load_from_memory_with_format(&bytes, image::ImageFormat::Png)
            .map(DecodedImage::new)
            .map_err(|err| ImageError::decode(err.to_string()))
    })
    .await
    .map_err(|err| ImageError::decode(format!("decode task failed: {err}")))?
}

/// Serves transformed results from the result cache.
pub struct ResultCacheLookupInterceptor {
    cache: DiskCache,
}

impl ResultCacheLookupInterceptor {
    /// Creates the stage.
    #[must_use]
    pub const fn new(cache: DiskCache) -> Self {
        Self { cache }
    }

    async fn read(&self, exchange: &Exchange) -> ImageResult<Option<DecodeResult>> {
        let key = exchange.result_key();
        let Some(mut snapshot) = self.cache.open_snapshot(key).await? else {
            return Ok(None);
        };
        let Some(raw) = snapshot.read_metadata().await? else {
            return Ok(None);
        };
        let sidecar: ResultMetadata = serde_json::from_slice(&raw)
            .map_err(|err| ImageError::io(format!("unreadable result metadata: {err}")))?;
        let bytes = snapshot.read_data(&exchange.liveness).await?;
        drop(snapshot);

        let image = decode_png(bytes).await?;
        Ok(Some(DecodeResult {
            image: Arc::new(image),
            metadata: sidecar.metadata,
            data_source: DataSource::Disk,
            transformations: sidecar.transformations,
        }))
    }
}

#[async_trait]
impl Interceptor for ResultCacheLookupInterceptor {
    fn name(&self) -> &'static str {
        "result-cache"
    }

    fn sort_weight(&self) -> i32 {
        weights::RESULT_CACHE_LOOKUP
    }

    async fn intercept(&self, chain: Chain, mut exchange: Exchange) -> ImageResult<Exchange> {
        let options = exchange.request.options();
        let readable = options.disk_cache_policy.read_enabled() && options.depth >= FetchDepth::Disk;
        if !readable || exchange.decoded.is_some() || !uses_result_cache(&exchange) {
            return chain.proceed(exchange).await;
        }

        match self.read(&exchange).await {
            Ok(Some(decoded)) => {
                trace!(key = %exchange.result_key(), "Result cache hit");
                exchange.decoded = Some(decoded);
                exchange.transformed = true;
                exchange.from_result_cache = true;
            }
            Ok(None) => trace!(key = %exchange.result_key(), "Result cache miss"),
            Err(ImageError::Cancelled) => return Err(ImageError::Cancelled),
            Err(err) => {
                warn!(key = %exchange.result_key(), error = %err, "Result cache read failed");
            }
        }
        chain.proceed(exchange).await
    }
}

/// Writes freshly transformed results to the result cache.
pub struct ResultCacheStoreInterceptor {
    cache: DiskCache,
}

impl ResultCacheStoreInterceptor {
    /// Creates the stage.
    #[must_use]
    pub const fn new(cache: DiskCache) -> Self {
        Self { cache }
    }

    async fn store(&self, exchange: &Exchange, decoded: &DecodeResult) -> ImageResult<()> {
        let sidecar = serde_json::to_vec(&ResultMetadata {
            metadata: decoded.metadata.clone(),
            transformations: decoded.transformations.clone(),
        })
        .map_err(|err| ImageError::io(err.to_string()))?;
        let png = encode_png(Arc::clone(&decoded.image)).await?;

        let key = exchange.result_key();
        match write_entry(&self.cache, key, &png, &sidecar, &exchange.liveness).await {
            Ok(true) => debug!(key = %key, bytes = png.len(), "Stored in result cache"),
            Ok(false) => trace!(key = %key, "Result cache entry busy, not storing"),
            Err(DiskCacheError::Cancelled) => return Err(ImageError::Cancelled),
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}

#[async_trait]
impl Interceptor for ResultCacheStoreInterceptor {
    fn name(&self) -> &'static str {
        "result-cache-store"
    }

    fn sort_weight(&self) -> i32 {
        weights::RESULT_CACHE_STORE
    }

    async fn intercept(&self, chain: Chain, exchange: Exchange) -> ImageResult<Exchange> {
        let writable = exchange.request.options().disk_cache_policy.write_enabled();
        if writable
            && exchange.transformed
            && !exchange.from_result_cache
            && uses_result_cache(&exchange)
            && let Some(decoded) = &exchange.decoded
        {
            match self.store(&exchange, decoded).await {
                Ok(()) => {}
                Err(ImageError::Cancelled) => return Err(ImageError::Cancelled),
                Err(err) => warn!(key = %exchange.result_key(), error = %err, "Result cache write failed"),
            }
        }
        chain.proceed(exchange).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{ImageRequest, Orientation};
    use crate::domain::ports::MockTransformation;
    use crate::domain::services::CacheKeyCodec;
    use tempfile::TempDir;

    fn request() -> ImageRequest {
        let mut tag = MockTransformation::new();
        tag.expect_cache_key().return_const("tint".to_string());
        ImageRequest::builder("img://a")
            .transformation(Arc::new(tag))
            .build()
    }

    fn exchange(request: ImageRequest) -> Exchange {
        let keys = CacheKeyCodec::new().keys(&request);
        Exchange::new(request, keys)
    }

    fn transformed() -> DecodeResult {
        let pixels = image::DynamicImage::new_rgba8(3, 2);
        DecodeResult {
            image: Arc::new(DecodedImage::new(pixels)),
            metadata: ImageMetadata {
                width: 3,
                height: 2,
                mime_type: Some("image/png".to_string()),
                orientation: Orientation::Normal,
            },
            data_source: DataSource::Network,
            transformations: vec!["tint".to_string()],
        }
    }

    #[tokio::test]
    async fn test_transformed_result_round_trips_through_disk() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::open(dir.path(), 1, 1024 * 1024).await.unwrap();

        let mut fresh = exchange(request());
        fresh.decoded = Some(transformed());
        fresh.transformed = true;
        Chain::new(vec![Arc::new(ResultCacheStoreInterceptor::new(cache.clone()))])
            .proceed(fresh)
            .await
            .unwrap();
        assert_eq!(cache.len().await, 1);

        let hit = Chain::new(vec![Arc::new(ResultCacheLookupInterceptor::new(cache))])
            .proceed(exchange(request()))
            .await
            .unwrap();
        assert!(hit.from_result_cache);
        assert!(hit.transformed);
        let decoded = hit.decoded.unwrap();
        assert_eq!(decoded.data_source, DataSource::Disk);
        assert_eq!(decoded.transformations, vec!["tint"]);
        assert_eq!((decoded.image.width(), decoded.image.height()), (3, 2));
        assert_eq!(decoded.metadata.mime_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn test_untransformed_requests_bypass_result_cache() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::open(dir.path(), 1, 1024 * 1024).await.unwrap();

        let mut plain = exchange(ImageRequest::new("img://a"));
        plain.decoded = Some(transformed());
        plain.transformed = true;
        Chain::new(vec![Arc::new(ResultCacheStoreInterceptor::new(cache.clone()))])
            .proceed(plain)
            .await
            .unwrap();

        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_results_from_cache_are_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::open(dir.path(), 1, 1024 * 1024).await.unwrap();

        let mut cached = exchange(request());
        cached.decoded = Some(transformed());
        cached.transformed = true;
        cached.from_result_cache = true;
        Chain::new(vec![Arc::new(ResultCacheStoreInterceptor::new(cache.clone()))])
            .proceed(cached)
            .await
            .unwrap();

        assert!(cache.is_empty().await);
    }
}
