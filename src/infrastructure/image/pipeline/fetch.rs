//! Fetch and download cache stages.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

use super::{Chain, Exchange, Interceptor, weights};
use crate::domain::entities::{
    CacheKey, DataSource, FetchDepth, FetchResult, Liveness, RequestState,
};
use crate::domain::errors::{ImageError, ImageResult};
use crate::domain::ports::Fetcher;
use crate::infrastructure::image::disk_cache::{DiskCache, DiskCacheError, DiskCacheResult};

/// Bytes written to a disk entry between liveness checks.
const WRITE_CHUNK: usize = 64 * 1024;

/// Sidecar stored next to downloaded bytes.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DownloadMetadata {
    mime_type: Option<String>,
}

/// Writes one disk cache entry under the key's edit lock.
///
/// Returns `Ok(false)` when another editor holds the key. Any failure aborts
/// the edit and leaves the previous entry in place.
pub(super) async fn write_entry(
    cache: &DiskCache,
    key: &CacheKey,
    data: &[u8],
    metadata: &[u8],
    liveness: &Liveness,
) -> DiskCacheResult<bool> {
    let _lock = cache.edit_lock(key).await;
    let Some(mut editor) = cache.open_editor(key).await? else {
        return Ok(false);
    };

    let written: DiskCacheResult<()> = async {
        let mut sink = editor.data_sink().await?;
        for chunk in data.chunks(WRITE_CHUNK) {
            if liveness.is_cancelled() {
                return Err(DiskCacheError::Cancelled);
            }
            sink.write_all(chunk).await?;
        }
        sink.finish().await?;

        if !metadata.is_empty() {
            let mut sink = editor.metadata_sink().await?;
            sink.write_all(metadata).await?;
            sink.finish().await?;
        }
        Ok(())
    }
    .await;

    match written {
        Ok(()) => {
            editor.commit().await?;
            Ok(true)
        }
        Err(err) => {
            editor.abort().await;
            Err(err)
        }
    }
}

/// Produces the exchange's bytes.
///
/// Reads the download cache first when the request allows it, then asks the
/// fetcher, enforcing the request's depth limit before any network access.
pub struct FetchInterceptor {
    fetcher: Arc<dyn Fetcher>,
    download_cache: Option<DiskCache>,
    network_permits: Arc<Semaphore>,
}

impl FetchInterceptor {
    /// Creates the stage.
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        download_cache: Option<DiskCache>,
        network_permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            fetcher,
            download_cache,
            network_permits,
        }
    }

    async fn read_download_cache(
        &self,
        cache: &DiskCache,
        exchange: &Exchange,
    ) -> DiskCacheResult<Option<FetchResult>> {
        let Some(mut snapshot) = cache.open_snapshot(&exchange.keys.download).await? else {
            return Ok(None);
        };
        let bytes = snapshot.read_data(&exchange.liveness).await?;
        let metadata = match snapshot.read_metadata().await? {
            Some(raw) => serde_json::from_slice::<DownloadMetadata>(&raw).unwrap_or_else(|err| {
                debug!(key = %exchange.keys.download, error = %err, "Ignoring unreadable download metadata");
                DownloadMetadata::default()
            }),
            None => DownloadMetadata::default(),
        };
        Ok(Some(FetchResult::new(bytes, metadata.mime_type, DataSource::Disk)))
    }

    async fn fetch_remote(&self, exchange: &Exchange) -> ImageResult<FetchResult> {
        let options = exchange.request.options();
        if options.depth < FetchDepth::Network {
            return Err(ImageError::depth_limit(options.depth, FetchDepth::Network));
        }
        if !options.network_cache_policy.read_enabled() {
            return Err(ImageError::depth_limit(FetchDepth::Disk, FetchDepth::Network));
        }

        let _permit = self
            .network_permits
            .acquire()
            .await
            .map_err(|_| ImageError::Cancelled)?;
        exchange.liveness.check()?;
        debug!(data = %exchange.request.data(), "Fetching from network");
        self.fetcher.fetch(&exchange.request, &exchange.liveness).await
    }
}

#[async_trait]
impl Interceptor for FetchInterceptor {
    fn name(&self) -> &'static str {
        "fetch"
    }

    fn sort_weight(&self) -> i32 {
        weights::FETCH
    }

    async fn intercept(&self, chain: Chain, mut exchange: Exchange) -> ImageResult<Exchange> {
        if exchange.decoded.is_some() || exchange.fetched.is_some() {
            return chain.proceed(exchange).await;
        }

        exchange.transition(RequestState::Fetching);
        let options = exchange.request.options();
        if options.depth == FetchDepth::Memory {
            return Err(ImageError::depth_limit(FetchDepth::Memory, FetchDepth::Disk));
        }

        if options.disk_cache_policy.read_enabled()
            && let Some(cache) = &self.download_cache
        {
            match self.read_download_cache(cache, &exchange).await {
                Ok(Some(fetched)) => {
                    trace!(key = %exchange.keys.download, "Serving bytes from download cache");
                    exchange.fetched = Some(fetched);
                    return chain.proceed(exchange).await;
                }
                Ok(None) => {}
                Err(DiskCacheError::Cancelled) => return Err(ImageError::Cancelled),
                Err(err) => {
                    warn!(key = %exchange.keys.download, error = %err, "Download cache read failed");
                }
            }
        }

        let fetched = if self.fetcher.is_network(&exchange.request) {
            self.fetch_remote(&exchange).await?
        } else {
            self.fetcher.fetch(&exchange.request, &exchange.liveness).await?
        };
        trace!(
            data = %exchange.request.data(),
            bytes = fetched.bytes.len(),
            source = %fetched.data_source,
            "Fetched"
        );
        exchange.fetched = Some(fetched);
        chain.proceed(exchange).await
    }
}

/// Stores freshly downloaded bytes in the download cache.
///
/// A failed write is logged and the request continues with the bytes it
/// already holds; only cancellation is propagated.
pub struct DownloadCacheInterceptor {
    cache: DiskCache,
}

impl DownloadCacheInterceptor {
    /// Creates the stage.
    #[must_use]
    pub const fn new(cache: DiskCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Interceptor for DownloadCacheInterceptor {
    fn name(&self) -> &'static str {
        "download-cache"
    }

    fn sort_weight(&self) -> i32 {
        weights::DOWNLOAD_CACHE
    }

    async fn intercept(&self, chain: Chain, exchange: Exchange) -> ImageResult<Exchange> {
        let writable = exchange.request.options().disk_cache_policy.write_enabled();
        if writable
            && let Some(fetched) = &exchange.fetched
            && fetched.data_source == DataSource::Network
        {
            let metadata = serde_json::to_vec(&DownloadMetadata {
                mime_type: fetched.mime_type.clone(),
            })
            .unwrap_or_default();
            let key = &exchange.keys.download;
            match write_entry(&self.cache, key, &fetched.bytes, &metadata, &exchange.liveness).await
            {
                Ok(true) => debug!(key = %key, bytes = fetched.bytes.len(), "Stored in download cache"),
                Ok(false) => trace!(key = %key, "Download cache entry busy, not storing"),
                Err(DiskCacheError::Cancelled) => return Err(ImageError::Cancelled),
                Err(err) => warn!(key = %key, error = %err, "Download cache write failed"),
            }
        }
        chain.proceed(exchange).await
    }
}
