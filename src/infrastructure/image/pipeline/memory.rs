//! Memory cache stages.

use async_trait::async_trait;
use tracing::trace;

use super::{Chain, Exchange, Interceptor, weights};
use crate::domain::entities::{FetchDepth, RequestState};
use crate::domain::errors::{ImageError, ImageResult};
use crate::infrastructure::image::memory_cache::{CachedImage, MemoryCache, PinKind};

/// Serves results from the memory cache without touching the coordinator.
pub struct MemoryCacheInterceptor {
    cache: MemoryCache,
}

impl MemoryCacheInterceptor {
    /// Creates the stage.
    #[must_use]
    pub const fn new(cache: MemoryCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Interceptor for MemoryCacheInterceptor {
    fn name(&self) -> &'static str {
        "memory-cache"
    }

    fn sort_weight(&self) -> i32 {
        weights::MEMORY_CACHE
    }

    async fn intercept(&self, chain: Chain, mut exchange: Exchange) -> ImageResult<Exchange> {
        let options = exchange.request.options();
        let readable = options.memory_cache_policy.read_enabled();
        let depth = options.depth;

        if readable
            && let Some(pin) = self.cache.get_pinned(exchange.result_key(), PinKind::Pending)
        {
            exchange.transition(RequestState::MemoryHit);
            exchange.decoded = Some(pin.value().to_result());
            exchange.memory_hold = Some(pin);
            return Ok(exchange);
        }

        exchange.transition(RequestState::MemoryMiss);
        if depth == FetchDepth::Memory {
            return Err(ImageError::depth_limit(FetchDepth::Memory, FetchDepth::Disk));
        }
        chain.proceed(exchange).await
    }
}

/// Publishes the decoded result to the memory cache.
///
/// The entry is stored with a pending pin that travels back to the callers,
/// so eviction pressure between storing and delivery cannot reclaim it.
pub struct MemoryStoreInterceptor {
    cache: MemoryCache,
}

impl MemoryStoreInterceptor {
    /// Creates the stage.
    #[must_use]
    pub const fn new(cache: MemoryCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Interceptor for MemoryStoreInterceptor {
    fn name(&self) -> &'static str {
        "memory-store"
    }

    fn sort_weight(&self) -> i32 {
        weights::MEMORY_STORE
    }

    async fn intercept(&self, chain: Chain, mut exchange: Exchange) -> ImageResult<Exchange> {
        let writable = exchange.request.options().memory_cache_policy.write_enabled();
        if writable
            && exchange.memory_hold.is_none()
            && let Some(decoded) = &exchange.decoded
        {
            let value = CachedImage::from(decoded);
            let size = value.byte_size();
            exchange.transition(RequestState::Storing);
            exchange.memory_hold =
                self.cache
                    .put_pinned(exchange.keys.result.clone(), value, size, PinKind::Pending);
        } else {
            trace!(key = %exchange.result_key(), "Skipping memory cache store");
        }
        chain.proceed(exchange).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{
        CachePolicy, DataSource, DecodeResult, DecodedImage, ImageMetadata, ImageRequest,
        Orientation,
    };
    use crate::domain::ports::mocks::RecordingListener;
    use crate::domain::services::CacheKeyCodec;
    use std::sync::Arc;

    fn exchange(request: ImageRequest) -> Exchange {
        let keys = CacheKeyCodec::new().keys(&request);
        let mut exchange = Exchange::new(request, keys);
        exchange.transition(RequestState::KeyDerived);
        exchange
    }

    fn decoded() -> DecodeResult {
        DecodeResult {
            image: Arc::new(DecodedImage::new(image::DynamicImage::new_rgba8(4, 4))),
            metadata: ImageMetadata {
                width: 4,
                height: 4,
                mime_type: None,
                orientation: Orientation::Normal,
            },
            data_source: DataSource::Network,
            transformations: Vec::new(),
        }
    }

    fn store_chain(cache: &MemoryCache) -> Chain {
        Chain::new(vec![
            Arc::new(MemoryCacheInterceptor::new(cache.clone())),
            Arc::new(MemoryStoreInterceptor::new(cache.clone())),
        ])
    }

    #[tokio::test]
    async fn test_store_then_hit() {
        let cache = MemoryCache::new(1024);
        let mut first = exchange(ImageRequest::new("img://a"));
        first.decoded = Some(decoded());
        let first = Chain::new(vec![Arc::new(MemoryStoreInterceptor::new(cache.clone()))])
            .proceed(first)
            .await
            .unwrap();
        assert!(first.memory_hold.is_some());
        assert_eq!(cache.len(), 1);

        let hit = store_chain(&cache)
            .proceed(exchange(ImageRequest::new("img://a")))
            .await
            .unwrap();
        assert_eq!(hit.state(), RequestState::MemoryHit);
        let result = hit.decoded.unwrap();
        assert_eq!(result.data_source, DataSource::MemoryCache);
        assert!(Arc::ptr_eq(&result.image, &first.decoded.unwrap().image));
    }

    #[tokio::test]
    async fn test_read_disabled_skips_lookup() {
        let cache = MemoryCache::new(1024);
        let key = CacheKeyCodec::new().keys(&ImageRequest::new("img://a")).result;
        cache.put(key, CachedImage::from(&decoded()), 64);

        let request = ImageRequest::builder("img://a")
            .memory_cache_policy(CachePolicy::WriteOnly)
            .build();
        let miss = store_chain(&cache).proceed(exchange(request)).await.unwrap();

        assert_eq!(miss.state(), RequestState::MemoryMiss);
        assert!(miss.decoded.is_none());
    }

    #[tokio::test]
    async fn test_memory_depth_fails_on_miss() {
        let cache = MemoryCache::new(1024);
        let request = ImageRequest::builder("img://a")
            .depth(FetchDepth::Memory)
            .build();

        let err = store_chain(&cache).proceed(exchange(request)).await.unwrap_err();
        assert_eq!(
            err,
            ImageError::depth_limit(FetchDepth::Memory, FetchDepth::Disk)
        );
    }

    #[tokio::test]
    async fn test_write_disabled_skips_store() {
        let cache = MemoryCache::new(1024);
        let request = ImageRequest::builder("img://a")
            .memory_cache_policy(CachePolicy::ReadOnly)
            .build();
        let mut exchange = exchange(request);
        exchange.decoded = Some(decoded());

        let done = Chain::new(vec![Arc::new(MemoryStoreInterceptor::new(cache.clone()))])
            .proceed(exchange)
            .await
            .unwrap();
        assert!(done.memory_hold.is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_hit_and_miss_follow_key_derivation() {
        let cache = MemoryCache::new(1024);
        let key = CacheKeyCodec::new().keys(&ImageRequest::new("img://a")).result;
        cache.put(key, CachedImage::from(&decoded()), 64);

        let listener = Arc::new(RecordingListener::default());
        let request = ImageRequest::builder("img://a")
            .listener(listener.clone())
            .build();
        let hit = store_chain(&cache).proceed(exchange(request)).await.unwrap();
        assert_eq!(hit.state(), RequestState::MemoryHit);
        assert_eq!(
            listener.states(),
            vec![RequestState::KeyDerived, RequestState::MemoryHit]
        );

        let listener = Arc::new(RecordingListener::default());
        let request = ImageRequest::builder("img://b")
            .listener(listener.clone())
            .build();
        let miss = store_chain(&cache).proceed(exchange(request)).await.unwrap();
        assert_eq!(miss.state(), RequestState::MemoryMiss);
        assert_eq!(
            listener.states(),
            vec![RequestState::KeyDerived, RequestState::MemoryMiss]
        );
    }
}
