//! Image loading engine.
//!
//! Wires the caches, the coordinators and the collaborators into the two
//! interceptor chains and exposes them as `execute`, `decode`, `enqueue`
//! and `prefetch`.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::application::services::RequestCoordinator;
use crate::domain::entities::{DecodeResult, ImageRequest, RequestState};
use crate::domain::errors::{ImageError, ImageResult};
use crate::domain::ports::{BufferRecycler, Decoder, Fetcher};
use crate::domain::services::CacheKeyCodec;

use super::disk_cache::{DEFAULT_DOWNLOAD_CACHE_SIZE, DEFAULT_RESULT_CACHE_SIZE, DiskCache};
use super::memory_cache::{CacheStats, DEFAULT_MEMORY_CACHE_SIZE, MemoryCache};
use super::pipeline::{
    Chain, CoordinatorInterceptor, DecodeInterceptor, DownloadCacheInterceptor, Exchange,
    FetchInterceptor, FlightScope, ImageResponse, Interceptor, MemoryCacheInterceptor,
    MemoryStoreInterceptor, Outcome, ResultCacheLookupInterceptor, ResultCacheStoreInterceptor,
    TransformInterceptor,
};

/// Version stamped into disk cache journals; bump to orphan old entries.
pub const CACHE_APP_VERSION: u32 = 1;

const DOWNLOAD_DIR: &str = "download";
const RESULT_DIR: &str = "result";

/// Message sent when an enqueued request finishes.
#[derive(Debug, Clone)]
pub struct ImageLoadedEvent {
    /// The request that was loaded.
    pub request: ImageRequest,
    /// The response, or why loading failed.
    pub result: ImageResult<ImageResponse>,
}

/// Configuration for the image loader.
#[derive(Debug, Clone)]
pub struct ImageLoaderConfig {
    /// Memory cache budget in bytes.
    pub memory_cache_size: u64,
    /// Download cache budget in bytes.
    pub download_cache_size: u64,
    /// Result cache budget in bytes.
    pub result_cache_size: u64,
    /// Root of the disk caches; `None` disables both.
    pub cache_dir: Option<PathBuf>,
    /// Maximum concurrent network fetches.
    pub max_concurrent_fetches: usize,
    /// Maximum concurrent decodes and transformations.
    pub max_concurrent_decodes: usize,
}

impl Default for ImageLoaderConfig {
    fn default() -> Self {
        Self {
            memory_cache_size: DEFAULT_MEMORY_CACHE_SIZE,
            download_cache_size: DEFAULT_DOWNLOAD_CACHE_SIZE,
            result_cache_size: DEFAULT_RESULT_CACHE_SIZE,
            cache_dir: None,
            max_concurrent_fetches: 4,
            max_concurrent_decodes: std::thread::available_parallelism()
                .map_or(2, NonZeroUsize::get),
        }
    }
}

/// Handle to an enqueued request.
///
/// Dropping the handle leaves the request running; [`RequestHandle::cancel`]
/// detaches it from its execution and reports `Cancelled`.
#[derive(Debug)]
pub struct RequestHandle {
    cancel: Arc<Notify>,
    task: JoinHandle<()>,
}

impl RequestHandle {
    /// Cancels the request.
    pub fn cancel(&self) {
        self.cancel.notify_one();
    }

    /// Returns true once the request has finished and its event was sent.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the request to finish.
    pub async fn join(self) {
        if let Err(err) = self.task.await {
            warn!(error = %err, "Image request task failed");
        }
    }
}

/// Builder for [`ImageLoader`].
pub struct ImageLoaderBuilder {
    fetcher: Arc<dyn Fetcher>,
    decoder: Arc<dyn Decoder>,
    config: ImageLoaderConfig,
    recycler: Option<Arc<dyn BufferRecycler>>,
    memory_cache: Option<MemoryCache>,
    download_cache: Option<DiskCache>,
    result_cache: Option<DiskCache>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    decode_interceptors: Vec<Arc<dyn Interceptor>>,
    events: Option<mpsc::UnboundedSender<ImageLoadedEvent>>,
}

impl ImageLoaderBuilder {
    /// Sets budgets, cache location and concurrency limits.
    #[must_use]
    pub fn config(mut self, config: ImageLoaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the hook called when memory cache buffers are reclaimed.
    #[must_use]
    pub fn recycler(mut self, recycler: Arc<dyn BufferRecycler>) -> Self {
        self.recycler = Some(recycler);
        self
    }

    /// Uses an existing memory cache instead of creating one.
    #[must_use]
    pub fn memory_cache(mut self, cache: MemoryCache) -> Self {
        self.memory_cache = Some(cache);
        self
    }

    /// Uses an existing download cache instead of opening one.
    #[must_use]
    pub fn download_cache(mut self, cache: DiskCache) -> Self {
        self.download_cache = Some(cache);
        self
    }

    /// Uses an existing result cache instead of opening one.
    #[must_use]
    pub fn result_cache(mut self, cache: DiskCache) -> Self {
        self.result_cache = Some(cache);
        self
    }

    /// Adds a stage to the request-level chain.
    #[must_use]
    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Adds a stage to the decode-level chain.
    #[must_use]
    pub fn decode_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.decode_interceptors.push(interceptor);
        self
    }

    /// Sets where [`ImageLoader::enqueue`] reports results.
    #[must_use]
    pub fn events(mut self, events: mpsc::UnboundedSender<ImageLoadedEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Opens the disk caches and assembles the chains.
    ///
    /// # Errors
    /// Returns an I/O error if a disk cache directory cannot be opened.
    pub async fn build(self) -> ImageResult<ImageLoader> {
        let config = self.config;

        let memory_cache = match (self.memory_cache, self.recycler) {
            (Some(cache), _) => cache,
            (None, Some(recycler)) => MemoryCache::with_recycler(config.memory_cache_size, recycler),
            (None, None) => MemoryCache::new(config.memory_cache_size),
        };

        let download_cache = match (self.download_cache, &config.cache_dir) {
            (Some(cache), _) => Some(cache),
            (None, Some(dir)) => Some(
                DiskCache::open(
                    dir.join(DOWNLOAD_DIR),
                    CACHE_APP_VERSION,
                    config.download_cache_size,
                )
                .await?,
            ),
            (None, None) => None,
        };
        let result_cache = match (self.result_cache, &config.cache_dir) {
            (Some(cache), _) => Some(cache),
            (None, Some(dir)) => Some(
                DiskCache::open(dir.join(RESULT_DIR), CACHE_APP_VERSION, config.result_cache_size)
                    .await?,
            ),
            (None, None) => None,
        };

        let network_permits = Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1)));
        let decode_permits = Arc::new(Semaphore::new(config.max_concurrent_decodes.max(1)));
        let request_coordinator = Arc::new(RequestCoordinator::new());
        let decode_coordinator = Arc::new(RequestCoordinator::new());

        let fetch = Arc::new(FetchInterceptor::new(
            self.fetcher,
            download_cache.clone(),
            network_permits,
        ));
        let decode = Arc::new(DecodeInterceptor::new(self.decoder, Arc::clone(&decode_permits)));
        let transform = Arc::new(TransformInterceptor::new(decode_permits));

        let mut request_stages: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(MemoryCacheInterceptor::new(memory_cache.clone())),
            Arc::new(CoordinatorInterceptor::new(
                Arc::clone(&request_coordinator),
                FlightScope::Request,
            )),
            fetch.clone(),
            decode.clone(),
            transform.clone(),
            Arc::new(MemoryStoreInterceptor::new(memory_cache.clone())),
        ];
        let mut decode_stages: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(CoordinatorInterceptor::new(
                Arc::clone(&decode_coordinator),
                FlightScope::Decode,
            )),
            fetch,
            decode,
            transform,
        ];
        if let Some(cache) = &download_cache {
            let store: Arc<dyn Interceptor> = Arc::new(DownloadCacheInterceptor::new(cache.clone()));
            request_stages.push(Arc::clone(&store));
            decode_stages.push(store);
        }
        if let Some(cache) = &result_cache {
            request_stages.push(Arc::new(ResultCacheLookupInterceptor::new(cache.clone())));
            request_stages.push(Arc::new(ResultCacheStoreInterceptor::new(cache.clone())));
        }
        request_stages.extend(self.interceptors);
        decode_stages.extend(self.decode_interceptors);

        let request_chain = Chain::new(request_stages);
        let decode_chain = Chain::new(decode_stages);
        debug!(stages = ?request_chain.names(), "Request chain");
        debug!(stages = ?decode_chain.names(), "Decode chain");

        Ok(ImageLoader {
            inner: Arc::new(LoaderInner {
                codec: CacheKeyCodec::new(),
                memory_cache,
                download_cache,
                result_cache,
                request_chain,
                decode_chain,
                request_coordinator,
                decode_coordinator,
                events: self.events,
            }),
        })
    }
}

struct LoaderInner {
    codec: CacheKeyCodec,
    memory_cache: MemoryCache,
    download_cache: Option<DiskCache>,
    result_cache: Option<DiskCache>,
    request_chain: Chain,
    decode_chain: Chain,
    request_coordinator: Arc<RequestCoordinator<Outcome>>,
    decode_coordinator: Arc<RequestCoordinator<Outcome>>,
    events: Option<mpsc::UnboundedSender<ImageLoadedEvent>>,
}

/// Loads images through the caches and the interceptor chains.
///
/// Cheap to clone; clones share caches, coordinators and chains.
#[derive(Clone)]
pub struct ImageLoader {
    inner: Arc<LoaderInner>,
}

impl std::fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLoader")
            .field("request_chain", &self.inner.request_chain)
            .field("decode_chain", &self.inner.decode_chain)
            .field("memory_cache", &self.inner.memory_cache)
            .finish_non_exhaustive()
    }
}

impl ImageLoader {
    /// Starts building a loader around `fetcher` and `decoder`.
    #[must_use]
    pub fn builder(fetcher: Arc<dyn Fetcher>, decoder: Arc<dyn Decoder>) -> ImageLoaderBuilder {
        ImageLoaderBuilder {
            fetcher,
            decoder,
            config: ImageLoaderConfig::default(),
            recycler: None,
            memory_cache: None,
            download_cache: None,
            result_cache: None,
            interceptors: Vec::new(),
            decode_interceptors: Vec::new(),
            events: None,
        }
    }

    /// Loads `request` through the request-level chain.
    ///
    /// Concurrent calls for the same result share one execution; each caller
    /// gets its own pending pin on the memory cache entry.
    ///
    /// # Errors
    /// Returns the failure of the execution serving this request.
    pub async fn execute(&self, request: ImageRequest) -> ImageResult<ImageResponse> {
        let exchange = self.start(request);
        let request = exchange.request.clone();
        let keys = exchange.keys.clone();

        match self.inner.request_chain.clone().proceed(exchange).await {
            Ok(mut exchange) => {
                let Some(result) = exchange.decoded.take() else {
                    let err = ImageError::not_found(exchange.request.data());
                    Self::report_failure(&request, &err);
                    return Err(err);
                };
                exchange.transition(RequestState::Done);
                if let Some(listener) = request.listener() {
                    listener.on_success(&request, result.data_source);
                }
                debug!(data = %request.data(), source = %result.data_source, "Image loaded");
                Ok(ImageResponse {
                    request,
                    keys,
                    result,
                    pin: exchange.memory_hold.take(),
                })
            }
            Err(err) => {
                Self::report_failure(&request, &err);
                Err(err)
            }
        }
    }

    /// Decodes `request` through the decode-level chain.
    ///
    /// Bypasses the memory cache. Transformations run only when
    /// `apply_transformations` is set.
    ///
    /// # Errors
    /// Returns the failure of the execution serving this request.
    pub async fn decode(
        &self,
        request: ImageRequest,
        apply_transformations: bool,
    ) -> ImageResult<DecodeResult> {
        let mut exchange = self.start(request);
        exchange.apply_transformations = apply_transformations;
        exchange.transition(RequestState::MemoryMiss);
        let request = exchange.request.clone();

        match self.inner.decode_chain.clone().proceed(exchange).await {
            Ok(mut exchange) => {
                let Some(result) = exchange.decoded.take() else {
                    let err = ImageError::not_found(request.data());
                    Self::report_failure(&request, &err);
                    return Err(err);
                };
                exchange.transition(RequestState::Done);
                if let Some(listener) = request.listener() {
                    listener.on_success(&request, result.data_source);
                }
                Ok(result)
            }
            Err(err) => {
                Self::report_failure(&request, &err);
                Err(err)
            }
        }
    }

    /// Loads `request` in the background and reports an [`ImageLoadedEvent`].
    ///
    /// Must be called inside a Tokio runtime.
    pub fn enqueue(&self, request: ImageRequest) -> RequestHandle {
        let cancel = Arc::new(Notify::new());
        let loader = self.clone();
        let signal = Arc::clone(&cancel);

        let task = tokio::spawn(async move {
            let result = tokio::select! {
                result = loader.execute(request.clone()) => result,
                () = signal.notified() => {
                    debug!(data = %request.data(), "Enqueued request cancelled");
                    Self::report_failure(&request, &ImageError::Cancelled);
                    Err(ImageError::Cancelled)
                }
            };
            if let Some(events) = &loader.inner.events
                && events.send(ImageLoadedEvent { request, result }).is_err()
            {
                debug!("Image event receiver dropped");
            }
        });

        RequestHandle { cancel, task }
    }

    /// Warms the caches for `requests` without reporting results.
    pub fn prefetch(&self, requests: Vec<ImageRequest>) -> Vec<RequestHandle> {
        requests
            .into_iter()
            .map(|request| {
                let cancel = Arc::new(Notify::new());
                let loader = self.clone();
                let signal = Arc::clone(&cancel);
                let task = tokio::spawn(async move {
                    tokio::select! {
                        result = loader.execute(request.clone()) => {
                            if let Err(err) = result {
                                debug!(data = %request.data(), error = %err, "Prefetch failed");
                            }
                        }
                        () = signal.notified() => {}
                    }
                });
                RequestHandle { cancel, task }
            })
            .collect()
    }

    /// Clears the memory cache and both disk caches.
    pub async fn clear_all(&self) {
        self.inner.memory_cache.clear();
        for cache in [&self.inner.download_cache, &self.inner.result_cache]
            .into_iter()
            .flatten()
        {
            if let Err(err) = cache.clear().await {
                warn!(dir = %cache.directory().display(), error = %err, "Failed to clear disk cache");
            }
        }
        info!("Cleared all image caches");
    }

    /// Flushes and closes the disk caches.
    pub async fn shutdown(&self) {
        for cache in [&self.inner.download_cache, &self.inner.result_cache]
            .into_iter()
            .flatten()
        {
            if let Err(err) = cache.close().await {
                warn!(dir = %cache.directory().display(), error = %err, "Failed to close disk cache");
            }
        }
    }

    /// The memory cache.
    #[must_use]
    pub fn memory_cache(&self) -> &MemoryCache {
        &self.inner.memory_cache
    }

    /// The download cache, if disk caching is enabled.
    #[must_use]
    pub fn download_cache(&self) -> Option<&DiskCache> {
        self.inner.download_cache.as_ref()
    }

    /// The result cache, if disk caching is enabled.
    #[must_use]
    pub fn result_cache(&self) -> Option<&DiskCache> {
        self.inner.result_cache.as_ref()
    }

    /// Returns memory cache statistics.
    #[must_use]
    pub fn memory_cache_stats(&self) -> CacheStats {
        self.inner.memory_cache.stats()
    }

    /// Number of executions currently running across both chains.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.inner.request_coordinator.in_flight_count()
            + self.inner.decode_coordinator.in_flight_count()
    }

    /// Stage names of the request-level chain, in order.
    #[must_use]
    pub fn request_stages(&self) -> Vec<&'static str> {
        self.inner.request_chain.names()
    }

    /// Stage names of the decode-level chain, in order.
    #[must_use]
    pub fn decode_stages(&self) -> Vec<&'static str> {
        self.inner.decode_chain.names()
    }

    fn start(&self, request: ImageRequest) -> Exchange {
        if let Some(listener) = request.listener() {
            listener.on_start(&request);
        }
        let keys = self.inner.codec.keys(&request);
        let mut exchange = Exchange::new(request, keys);
        exchange.transition(RequestState::KeyDerived);
        exchange
    }

    fn report_failure(request: &ImageRequest, err: &ImageError) {
        if err.is_cancelled() {
            debug!(data = %request.data(), "Image request cancelled");
        } else {
            warn!(data = %request.data(), error = %err, "Image request failed");
        }
        if let Some(listener) = request.listener() {
            listener.on_state(request, RequestState::Failed);
            listener.on_error(request, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{CachePolicy, DataSource, DecodedImage, FetchDepth, Size};
    use crate::domain::ports::MockTransformation;
    use crate::domain::ports::mocks::{CountingFetcher, RecordingListener, SyntheticDecoder};
    use crate::infrastructure::image::memory_cache::PinKind;
    use crate::infrastructure::image::pipeline::weights;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn delayed_fetcher() -> Arc<CountingFetcher> {
        Arc::new(CountingFetcher::new(&b"png"[..]).with_delay(Duration::from_millis(50)))
    }

    async fn loader(fetcher: Arc<CountingFetcher>, decoder: Arc<SyntheticDecoder>) -> ImageLoader {
        ImageLoader::builder(fetcher, decoder).build().await.unwrap()
    }

    async fn disk_loader(
        dir: &TempDir,
        fetcher: Arc<CountingFetcher>,
        decoder: Arc<SyntheticDecoder>,
    ) -> ImageLoader {
        let config = ImageLoaderConfig {
            cache_dir: Some(dir.path().to_path_buf()),
            ..ImageLoaderConfig::default()
        };
        ImageLoader::builder(fetcher, decoder)
            .config(config)
            .build()
            .await
            .unwrap()
    }

    fn halving(tag: &'static str) -> Arc<MockTransformation> {
        let mut mock = MockTransformation::new();
        mock.expect_cache_key().return_const(tag.to_string());
        mock.expect_transform().returning(|image, _| {
            Ok(Some(DecodedImage::new(image::DynamicImage::new_rgba8(
                image.width() / 2,
                image.height() / 2,
            ))))
        });
        Arc::new(mock)
    }

    #[tokio::test]
    async fn test_concurrent_requests_fetch_once() {
        let fetcher = delayed_fetcher();
        let decoder = Arc::new(SyntheticDecoder::new());
        let loader = loader(fetcher.clone(), decoder.clone()).await;
        let request = || ImageRequest::builder("img://a").dimensions(100, 100).build();

        let (first, second) = tokio::join!(loader.execute(request()), loader.execute(request()));
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(decoder.calls(), 1);
        assert_eq!((first.result.metadata.width, first.result.metadata.height), (100, 100));
        assert_eq!(first.result.metadata, second.result.metadata);
        assert!(Arc::ptr_eq(&first.result.image, &second.result.image));
    }

    #[tokio::test]
    async fn test_many_callers_share_one_execution_and_hold_own_pins() {
        let fetcher = delayed_fetcher();
        let loader = loader(fetcher.clone(), Arc::new(SyntheticDecoder::new())).await;

        let responses = futures_util::future::join_all(
            (0..8).map(|_| loader.execute(ImageRequest::new("img://a"))),
        )
        .await;

        assert_eq!(fetcher.calls(), 1);
        let responses: Vec<ImageResponse> = responses.into_iter().map(Result::unwrap).collect();
        let image = &responses[0].result.image;
        for response in &responses {
            assert!(Arc::ptr_eq(image, &response.result.image));
            assert_eq!(response.pin.as_ref().map(|pin| pin.kind()), Some(PinKind::Pending));
        }

        let key = responses[0].keys.result.clone();
        loader.memory_cache().remove(&key);
        drop(responses);
        assert_eq!(loader.memory_cache().stats().detached, 0);
    }

    #[tokio::test]
    async fn test_second_request_is_memory_hit() {
        let fetcher = Arc::new(CountingFetcher::new(&b"png"[..]));
        let loader = loader(fetcher.clone(), Arc::new(SyntheticDecoder::new())).await;

        let first = loader.execute(ImageRequest::new("img://a")).await.unwrap();
        let second = loader.execute(ImageRequest::new("img://a")).await.unwrap();

        assert_eq!(first.result.data_source, DataSource::Network);
        assert_eq!(second.result.data_source, DataSource::MemoryCache);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_listener_sees_state_sequence() {
        let loader = loader(
            Arc::new(CountingFetcher::new(&b"png"[..])),
            Arc::new(SyntheticDecoder::new()),
        )
        .await;
        let miss = Arc::new(RecordingListener::default());
        let hit = Arc::new(RecordingListener::default());

        loader
            .execute(ImageRequest::builder("img://a").listener(miss.clone()).build())
            .await
            .unwrap();
        loader
            .execute(ImageRequest::builder("img://a").listener(hit.clone()).build())
            .await
            .unwrap();

        assert_eq!(
            miss.states(),
            vec![
                RequestState::KeyDerived,
                RequestState::MemoryMiss,
                RequestState::Coordinating,
                RequestState::Fetching,
                RequestState::Decoding,
                RequestState::Storing,
                RequestState::Done,
            ]
        );
        assert_eq!(miss.successes(), vec![DataSource::Network]);
        assert_eq!(
            hit.states(),
            vec![
                RequestState::KeyDerived,
                RequestState::MemoryHit,
                RequestState::Done
            ]
        );
    }

    #[tokio::test]
    async fn test_memory_depth_miss_fails() {
        let fetcher = Arc::new(CountingFetcher::new(&b"png"[..]));
        let loader = loader(fetcher.clone(), Arc::new(SyntheticDecoder::new())).await;
        let listener = Arc::new(RecordingListener::default());
        let request = ImageRequest::builder("img://a")
            .depth(FetchDepth::Memory)
            .listener(listener.clone())
            .build();

        let err = loader.execute(request).await.unwrap_err();

        assert_eq!(
            err,
            ImageError::depth_limit(FetchDepth::Memory, FetchDepth::Disk)
        );
        assert_eq!(listener.errors(), vec![err]);
        assert_eq!(listener.states().last(), Some(&RequestState::Failed));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_offline_request_does_not_join_network_execution() {
        let fetcher = delayed_fetcher();
        let loader = loader(fetcher.clone(), Arc::new(SyntheticDecoder::new())).await;
        let offline = ImageRequest::builder("img://b")
            .network_cache_policy(CachePolicy::Disabled)
            .build();

        let (online, offline) = tokio::join!(
            loader.execute(ImageRequest::new("img://b")),
            loader.execute(offline)
        );

        assert_eq!(online.unwrap().result.data_source, DataSource::Network);
        assert_eq!(
            offline.unwrap_err(),
            ImageError::depth_limit(FetchDepth::Disk, FetchDepth::Network)
        );
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_memory_writer_does_not_join_non_storing_execution() {
        let fetcher = delayed_fetcher();
        let loader = loader(fetcher.clone(), Arc::new(SyntheticDecoder::new())).await;
        let no_store = ImageRequest::builder("img://b")
            .memory_cache_policy(CachePolicy::Disabled)
            .build();

        let (leader, writer) = tokio::join!(
            loader.execute(no_store),
            loader.execute(ImageRequest::new("img://b"))
        );
        let (leader, writer) = (leader.unwrap(), writer.unwrap());

        assert!(leader.pin.is_none());
        assert_eq!(writer.pin.as_ref().map(|pin| pin.kind()), Some(PinKind::Pending));
        assert_eq!(loader.memory_cache().len(), 1);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_decode_failure_reaches_every_caller() {
        let fetcher = Arc::new(CountingFetcher::new(&b"bad"[..]).with_delay(Duration::from_millis(30)));
        let decoder = Arc::new(SyntheticDecoder::new());
        let loader = loader(fetcher.clone(), decoder.clone()).await;

        let (first, second) = tokio::join!(
            loader.execute(ImageRequest::new("img://a")),
            loader.execute(ImageRequest::new("img://a"))
        );

        assert!(matches!(first, Err(ImageError::Decode { .. })));
        assert_eq!(first.unwrap_err(), second.unwrap_err());
        assert_eq!(decoder.calls(), 1);
        assert!(loader.memory_cache().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_stop_others() {
        let fetcher = delayed_fetcher();
        let loader = loader(fetcher.clone(), Arc::new(SyntheticDecoder::new())).await;

        let cancelled = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.execute(ImageRequest::new("img://a")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let survivor = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.execute(ImageRequest::new("img://a")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancelled.abort();

        let response = survivor.await.unwrap().unwrap();
        assert_eq!(response.result.data_source, DataSource::Network);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_download_cache_survives_restart() {
        let dir = TempDir::new().unwrap();
        let first_fetcher = Arc::new(CountingFetcher::new(&b"png"[..]));
        let first = disk_loader(&dir, first_fetcher.clone(), Arc::new(SyntheticDecoder::new())).await;
        first.execute(ImageRequest::new("img://a")).await.unwrap();
        first.shutdown().await;
        drop(first);

        let second_fetcher = Arc::new(CountingFetcher::new(&b"png"[..]));
        let second =
            disk_loader(&dir, second_fetcher.clone(), Arc::new(SyntheticDecoder::new())).await;
        let response = second.execute(ImageRequest::new("img://a")).await.unwrap();

        assert_eq!(first_fetcher.calls(), 1);
        assert_eq!(second_fetcher.calls(), 0);
        assert_eq!(response.result.data_source, DataSource::Disk);
    }

    #[tokio::test]
    async fn test_result_cache_skips_fetch_and_decode() {
        let dir = TempDir::new().unwrap();
        let request = || {
            ImageRequest::builder("img://a")
                .size(Size::exact(8, 8))
                .transformation(halving("half"))
                .build()
        };

        let first = disk_loader(
            &dir,
            Arc::new(CountingFetcher::new(&b"png"[..])),
            Arc::new(SyntheticDecoder::new()),
        )
        .await;
        let fresh = first.execute(request()).await.unwrap();
        assert_eq!(fresh.result.transformations, vec!["half"]);
        first.shutdown().await;
        drop(first);

        let fetcher = Arc::new(CountingFetcher::new(&b"png"[..]));
        let decoder = Arc::new(SyntheticDecoder::new());
        let second = disk_loader(&dir, fetcher.clone(), decoder.clone()).await;
        let cached = second.execute(request()).await.unwrap();

        assert_eq!(fetcher.calls(), 0);
        assert_eq!(decoder.calls(), 0);
        assert_eq!(cached.result.data_source, DataSource::Disk);
        assert_eq!(cached.result.transformations, vec!["half"]);
        assert_eq!((cached.result.image.width(), cached.result.image.height()), (4, 4));
    }

    #[tokio::test]
    async fn test_decode_chain_transforms_only_on_request() {
        let loader = loader(
            Arc::new(CountingFetcher::new(&b"png"[..])),
            Arc::new(SyntheticDecoder::new()),
        )
        .await;
        let request = || {
            ImageRequest::builder("img://a")
                .transformation(halving("half"))
                .build()
        };

        let raw = loader.decode(request(), false).await.unwrap();
        let transformed = loader.decode(request(), true).await.unwrap();

        assert_eq!(raw.image.width(), 16);
        assert!(raw.transformations.is_empty());
        assert_eq!(transformed.image.width(), 8);
        assert_eq!(transformed.transformations, vec!["half"]);
        assert!(loader.memory_cache().is_empty());
    }

    #[tokio::test]
    async fn test_decode_chain_coalesces_separately_from_request_chain() {
        let fetcher = delayed_fetcher();
        let loader = loader(fetcher.clone(), Arc::new(SyntheticDecoder::new())).await;

        let (response, decoded) = tokio::join!(
            loader.execute(ImageRequest::new("img://a")),
            loader.decode(ImageRequest::new("img://a"), true)
        );
        assert!(response.is_ok() && decoded.is_ok());
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(loader.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_reports_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let loader = ImageLoader::builder(
            Arc::new(CountingFetcher::new(&b"png"[..])),
            Arc::new(SyntheticDecoder::new()),
        )
        .events(tx)
        .build()
        .await
        .unwrap();

        loader.enqueue(ImageRequest::new("img://a")).join().await;
        let event = rx.recv().await.unwrap();

        assert_eq!(event.request.data(), "img://a");
        assert_eq!(event.result.unwrap().result.data_source, DataSource::Network);
    }

    #[tokio::test]
    async fn test_cancelled_enqueue_reports_cancellation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fetcher = Arc::new(CountingFetcher::new(&b"png"[..]).with_delay(Duration::from_secs(5)));
        let loader = ImageLoader::builder(fetcher, Arc::new(SyntheticDecoder::new()))
            .events(tx)
            .build()
            .await
            .unwrap();

        let handle = loader.enqueue(ImageRequest::new("img://a"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        handle.join().await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.result.unwrap_err(), ImageError::Cancelled);
        assert_eq!(loader.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_prefetch_warms_memory_cache() {
        let fetcher = Arc::new(CountingFetcher::new(&b"png"[..]));
        let loader = loader(fetcher.clone(), Arc::new(SyntheticDecoder::new())).await;

        let handles = loader.prefetch(vec![
            ImageRequest::new("img://a"),
            ImageRequest::new("img://b"),
        ]);
        for handle in handles {
            handle.join().await;
        }

        assert_eq!(loader.memory_cache().len(), 2);
        let hit = loader.execute(ImageRequest::new("img://b")).await.unwrap();
        assert_eq!(hit.result.data_source, DataSource::MemoryCache);
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_clear_all_empties_every_layer() {
        let dir = TempDir::new().unwrap();
        let loader = disk_loader(
            &dir,
            Arc::new(CountingFetcher::new(&b"png"[..])),
            Arc::new(SyntheticDecoder::new()),
        )
        .await;
        drop(loader.execute(ImageRequest::new("img://a")).await.unwrap());

        loader.clear_all().await;

        assert!(loader.memory_cache().is_empty());
        assert!(loader.download_cache().unwrap().is_empty().await);
    }

    struct Counting {
        weight: i32,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Interceptor for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn sort_weight(&self) -> i32 {
            self.weight
        }

        async fn intercept(&self, chain: Chain, exchange: Exchange) -> ImageResult<Exchange> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            chain.proceed(exchange).await
        }
    }

    #[tokio::test]
    async fn test_custom_interceptors_run_at_their_weight() {
        let before_coordination = Arc::new(Counting {
            weight: weights::MEMORY_CACHE + 1,
            calls: AtomicUsize::new(0),
        });
        let inside_execution = Arc::new(Counting {
            weight: weights::FETCH + 1,
            calls: AtomicUsize::new(0),
        });
        let loader = ImageLoader::builder(delayed_fetcher(), Arc::new(SyntheticDecoder::new()))
            .interceptor(before_coordination.clone())
            .interceptor(inside_execution.clone())
            .build()
            .await
            .unwrap();

        let stages = loader.request_stages();
        assert_eq!(stages[0], "memory-cache");
        assert_eq!(stages[1], "counting");
        assert_eq!(stages[2], "coordinate");

        let (first, second) = tokio::join!(
            loader.execute(ImageRequest::new("img://a")),
            loader.execute(ImageRequest::new("img://a"))
        );
        assert!(first.is_ok() && second.is_ok());
        assert_eq!(before_coordination.calls.load(Ordering::SeqCst), 2);
        assert_eq!(inside_execution.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stage_order() {
        let dir = TempDir::new().unwrap();
        let loader = disk_loader(
            &dir,
            Arc::new(CountingFetcher::new(&b"png"[..])),
            Arc::new(SyntheticDecoder::new()),
        )
        .await;

        assert_eq!(
            loader.request_stages(),
            vec![
                "memory-cache",
                "coordinate",
                "result-cache",
                "fetch",
                "download-cache",
                "decode",
                "transform",
                "result-cache-store",
                "memory-store",
            ]
        );
        assert_eq!(
            loader.decode_stages(),
            vec!["coordinate", "fetch", "download-cache", "decode", "transform"]
        );
    }
}
