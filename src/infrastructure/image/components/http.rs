//! HTTP fetcher.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::{Client, StatusCode, header};
use tracing::{debug, warn};

use crate::domain::entities::{DataSource, FetchResult, ImageRequest, Liveness};
use crate::domain::errors::{ImageError, ImageResult};
use crate::domain::ports::Fetcher;

/// Default `User-Agent` header.
pub const DEFAULT_USER_AGENT: &str = concat!("pixflow/", env!("CARGO_PKG_VERSION"));

/// Largest preallocation taken from a `Content-Length` header.
const MAX_PREALLOCATION: u64 = 16 * 1024 * 1024;

/// Downloads `http://` and `https://` locators.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Creates a fetcher with its own connection pool.
    ///
    /// # Errors
    /// Returns an I/O error if the HTTP client cannot be built.
    pub fn new(user_agent: &str, timeout: Duration) -> ImageResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| ImageError::io(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Returns true for locators this fetcher can download.
    #[must_use]
    pub fn handles(request: &ImageRequest) -> bool {
        let data = request.data();
        data.starts_with("http://") || data.starts_with("https://")
    }
}

fn request_error(err: &reqwest::Error) -> ImageError {
    if err.is_timeout() {
        ImageError::io("request timed out")
    } else if err.is_connect() {
        ImageError::io(format!("failed to connect: {err}"))
    } else {
        ImageError::io(err.to_string())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn is_network(&self, _request: &ImageRequest) -> bool {
        true
    }

    async fn fetch(&self, request: &ImageRequest, liveness: &Liveness) -> ImageResult<FetchResult> {
        let url = request.data();
        let mut builder = self.client.get(url);
        for (name, value) in &request.options().headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let mut response = builder.send().await.map_err(|e| {
            warn!(url = %url, error = %e, "Image request failed");
            request_error(&e)
        })?;

        let status = response.status();
        if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
            return Err(ImageError::not_found(url));
        }
        if !status.is_success() {
            return Err(ImageError::io(format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            )));
        }

        let mime_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let expected = response.content_length().unwrap_or(0).min(MAX_PREALLOCATION);
        let mut body = BytesMut::with_capacity(usize::try_from(expected).unwrap_or(0));
        while let Some(chunk) = response.chunk().await.map_err(|e| request_error(&e))? {
            liveness.check()?;
            body.extend_from_slice(&chunk);
        }

        debug!(url = %url, bytes = body.len(), mime = ?mime_type, "Downloaded image");
        Ok(FetchResult::new(body.freeze(), mime_type, DataSource::Network))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0; 4096];
            let read = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..read]).to_string()
        });
        (format!("http://{addr}/image.png"), server)
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(DEFAULT_USER_AGENT, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_handles_http_schemes_only() {
        assert!(HttpFetcher::handles(&ImageRequest::new("https://a/b.png")));
        assert!(HttpFetcher::handles(&ImageRequest::new("http://a/b.png")));
        assert!(!HttpFetcher::handles(&ImageRequest::new("file:///b.png")));
    }

    #[tokio::test]
    async fn test_fetch_reads_body_and_headers() {
        let (url, server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: image/png; charset=binary\r\nContent-Length: 3\r\nConnection: close\r\n\r\nabc",
        )
        .await;
        let request = ImageRequest::builder(url).header("X-Token", "secret").build();

        let fetched = fetcher().fetch(&request, &Liveness::new()).await.unwrap();
        let sent = server.await.unwrap();

        assert_eq!(&fetched.bytes[..], b"abc");
        assert_eq!(fetched.mime_type.as_deref(), Some("image/png"));
        assert_eq!(fetched.data_source, DataSource::Network);
        assert!(sent.to_ascii_lowercase().contains("x-token: secret"));
    }

    #[tokio::test]
    async fn test_missing_resource_is_not_found() {
        let (url, _server) = serve_once(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let request = ImageRequest::new(url.clone());

        let err = fetcher().fetch(&request, &Liveness::new()).await.unwrap_err();
        assert_eq!(err, ImageError::not_found(url));
    }

    #[tokio::test]
    async fn test_server_error_is_io() {
        let (url, _server) = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let err = fetcher()
            .fetch(&ImageRequest::new(url), &Liveness::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ImageError::Io { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_download_stops() {
        let (url, _server) = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 3\r\nConnection: close\r\n\r\nabc",
        )
        .await;
        let liveness = Liveness::new();
        liveness.cancel();

        let err = fetcher()
            .fetch(&ImageRequest::new(url), &liveness)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
