//! Default fetchers, decoder and transformations, and the registry that
//! picks between them.

mod data_uri;
mod decoder;
mod file;
mod http;
mod transformations;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::domain::entities::{DecodedOutput, FetchResult, ImageRequest, Liveness, RequestOptions};
use crate::domain::errors::{ImageError, ImageResult};
use crate::domain::ports::{Decoder, Fetcher};

pub use data_uri::DataUriFetcher;
pub use decoder::ImageDecoder;
pub use file::FileFetcher;
pub use http::{DEFAULT_USER_AGENT, HttpFetcher};
pub use transformations::{BlurTransformation, GrayscaleTransformation};

/// Decides whether a fetcher handles a request.
pub type FetcherPredicate = Arc<dyn Fn(&ImageRequest) -> bool + Send + Sync>;

/// Decides whether a decoder handles fetched bytes.
pub type DecoderPredicate = Arc<dyn Fn(&FetchResult) -> bool + Send + Sync>;

struct Registered<P, H: ?Sized> {
    priority: i32,
    name: &'static str,
    predicate: P,
    handler: Arc<H>,
}

/// Ordered `(priority, predicate, handler)` lists of fetchers and decoders.
///
/// Entries are tested by ascending priority, in registration order for equal
/// priorities; the first match handles the request. The registry is itself
/// a [`Fetcher`] and a [`Decoder`], so the pipeline only sees the ports.
#[derive(Default)]
pub struct ComponentRegistry {
    fetchers: Vec<Registered<FetcherPredicate, dyn Fetcher>>,
    decoders: Vec<Registered<DecoderPredicate, dyn Decoder>>,
}

impl ComponentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the data URI, file and HTTP fetchers and the image
    /// decoder.
    #[must_use]
    pub fn with_defaults(http: HttpFetcher) -> Self {
        Self::new()
            .fetcher(0, "data-uri", DataUriFetcher::handles, Arc::new(DataUriFetcher::new()))
            .fetcher(10, "file", FileFetcher::handles, Arc::new(FileFetcher::new()))
            .fetcher(20, "http", HttpFetcher::handles, Arc::new(http))
            .decoder(0, "image", ImageDecoder::handles, Arc::new(ImageDecoder::new()))
    }

    /// Registers a fetcher.
    #[must_use]
    pub fn fetcher(
        mut self,
        priority: i32,
        name: &'static str,
        predicate: impl Fn(&ImageRequest) -> bool + Send + Sync + 'static,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        self.fetchers.push(Registered {
            priority,
            name,
            predicate: Arc::new(predicate),
            handler: fetcher,
        });
        self.fetchers.sort_by_key(|entry| entry.priority);
        self
    }

    /// Registers a decoder.
    #[must_use]
    pub fn decoder(
        mut self,
        priority: i32,
        name: &'static str,
        predicate: impl Fn(&FetchResult) -> bool + Send + Sync + 'static,
        decoder: Arc<dyn Decoder>,
    ) -> Self {
        self.decoders.push(Registered {
            priority,
            name,
            predicate: Arc::new(predicate),
            handler: decoder,
        });
        self.decoders.sort_by_key(|entry| entry.priority);
        self
    }

    fn fetcher_for(&self, request: &ImageRequest) -> Option<&Registered<FetcherPredicate, dyn Fetcher>> {
        self.fetchers.iter().find(|entry| (entry.predicate)(request))
    }

    fn decoder_for(&self, fetched: &FetchResult) -> Option<&Registered<DecoderPredicate, dyn Decoder>> {
        self.decoders.iter().find(|entry| (entry.predicate)(fetched))
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fetchers: Vec<_> = self.fetchers.iter().map(|e| e.name).collect();
        let decoders: Vec<_> = self.decoders.iter().map(|e| e.name).collect();
        f.debug_struct("ComponentRegistry")
            .field("fetchers", &fetchers)
            .field("decoders", &decoders)
            .finish()
    }
}

#[async_trait]
impl Fetcher for ComponentRegistry {
    fn is_network(&self, request: &ImageRequest) -> bool {
        self.fetcher_for(request)
            .is_some_and(|entry| entry.handler.is_network(request))
    }

    async fn fetch(&self, request: &ImageRequest, liveness: &Liveness) -> ImageResult<FetchResult> {
        let Some(entry) = self.fetcher_for(request) else {
            return Err(ImageError::not_found(request.data()));
        };
        trace!(data = %request.data(), fetcher = entry.name, "Selected fetcher");
        entry.handler.fetch(request, liveness).await
    }
}

#[async_trait]
impl Decoder for ComponentRegistry {
    async fn decode(
        &self,
        fetched: &FetchResult,
        options: &RequestOptions,
    ) -> ImageResult<DecodedOutput> {
        let Some(entry) = self.decoder_for(fetched) else {
            return Err(ImageError::decode(format!(
                "no decoder for {}",
                fetched.mime_type.as_deref().unwrap_or("unknown format")
            )));
        };
        trace!(decoder = entry.name, "Selected decoder");
        entry.handler.decode(fetched, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::DataSource;
    use crate::domain::ports::mocks::{CountingFetcher, SyntheticDecoder};

    fn registry(first: &Arc<CountingFetcher>, second: &Arc<CountingFetcher>) -> ComponentRegistry {
        ComponentRegistry::new()
            .fetcher(20, "second", |r: &ImageRequest| r.data().starts_with("img://"), second.clone())
            .fetcher(10, "first", |r: &ImageRequest| r.data().ends_with(".png"), first.clone())
    }

    #[tokio::test]
    async fn test_lowest_priority_match_wins() {
        let first = Arc::new(CountingFetcher::new(&b"1"[..]).local());
        let second = Arc::new(CountingFetcher::new(&b"2"[..]));
        let registry = registry(&first, &second);

        let png = registry
            .fetch(&ImageRequest::new("img://a.png"), &Liveness::new())
            .await
            .unwrap();
        let other = registry
            .fetch(&ImageRequest::new("img://a.jpg"), &Liveness::new())
            .await
            .unwrap();

        assert_eq!(&png.bytes[..], b"1");
        assert_eq!(&other.bytes[..], b"2");
        assert!(!registry.is_network(&ImageRequest::new("img://a.png")));
        assert!(registry.is_network(&ImageRequest::new("img://a.jpg")));
    }

    #[tokio::test]
    async fn test_unmatched_locator_is_not_found() {
        let first = Arc::new(CountingFetcher::new(&b"1"[..]));
        let registry = registry(&first, &first);

        let err = registry
            .fetch(&ImageRequest::new("ftp://a"), &Liveness::new())
            .await
            .unwrap_err();
        assert_eq!(err, ImageError::not_found("ftp://a"));
        assert!(!registry.is_network(&ImageRequest::new("ftp://a")));
    }

    #[tokio::test]
    async fn test_decoder_selection() {
        let registry = ComponentRegistry::new().decoder(
            0,
            "synthetic",
            |f: &FetchResult| f.mime_type.as_deref() == Some("image/x-test"),
            Arc::new(SyntheticDecoder::new()),
        );
        let options = ImageRequest::new("img://a").options().clone();

        let known = FetchResult::new(&b"ok"[..], Some("image/x-test".into()), DataSource::Disk);
        let unknown = FetchResult::new(&b"ok"[..], None, DataSource::Disk);

        assert!(registry.decode(&known, &options).await.is_ok());
        assert!(matches!(
            registry.decode(&unknown, &options).await,
            Err(ImageError::Decode { .. })
        ));
    }

    #[test]
    fn test_defaults_route_by_scheme() {
        let http = HttpFetcher::new(DEFAULT_USER_AGENT, std::time::Duration::from_secs(1)).unwrap();
        let registry = ComponentRegistry::with_defaults(http);

        assert!(registry.is_network(&ImageRequest::new("https://a/b.png")));
        assert!(!registry.is_network(&ImageRequest::new("/tmp/b.png")));
        assert!(!registry.is_network(&ImageRequest::new("data:,x")));
        assert_eq!(
            format!("{registry:?}"),
            r#"ComponentRegistry { fetchers: ["data-uri", "file", "http"], decoders: ["image"] }"#
        );
    }
}
