//! Local file fetcher.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::trace;

use crate::domain::entities::{DataSource, FetchResult, ImageRequest, Liveness};
use crate::domain::errors::{ImageError, ImageResult};
use crate::domain::ports::Fetcher;

const READ_CHUNK: usize = 64 * 1024;

/// Reads `file://` locators and plain filesystem paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileFetcher;

impl FileFetcher {
    /// Creates the fetcher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns true for locators naming a local file.
    #[must_use]
    pub fn handles(request: &ImageRequest) -> bool {
        Self::path(request.data()).is_some()
    }

    fn path(data: &str) -> Option<PathBuf> {
        if let Some(path) = data.strip_prefix("file://") {
            return Some(PathBuf::from(path));
        }
        if data.contains("://") || data.starts_with("data:") {
            return None;
        }
        let path = Path::new(data);
        (path.is_absolute() || data.starts_with("./") || data.starts_with("../"))
            .then(|| path.to_path_buf())
    }
}

/// Guesses a MIME type from the file extension.
fn mime_from_path(path: &Path) -> Option<String> {
    image::ImageFormat::from_path(path)
        .ok()
        .map(|format| format.to_mime_type().to_string())
}

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self, request: &ImageRequest, liveness: &Liveness) -> ImageResult<FetchResult> {
        let Some(path) = Self::path(request.data()) else {
            return Err(ImageError::not_found(request.data()));
        };

        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ImageError::not_found(request.data()));
            }
            Err(err) => return Err(err.into()),
        };

        let mut body = BytesMut::new();
        let mut chunk = vec![0; READ_CHUNK];
        loop {
            liveness.check()?;
            let read = file.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }

        trace!(path = %path.display(), bytes = body.len(), "Read image file");
        Ok(FetchResult::new(body.freeze(), mime_from_path(&path), DataSource::Disk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_case::test_case;

    #[test_case("file:///tmp/a.png", true ; "file_scheme")]
    #[test_case("/tmp/a.png", true ; "absolute_path")]
    #[test_case("./a.png", true ; "relative_path")]
    #[test_case("https://a/b.png", false ; "http")]
    #[test_case("data:image/png;base64,AA==", false ; "data_uri")]
    #[test_case("a.png", false ; "bare_name")]
    fn test_handles(data: &str, expected: bool) {
        assert_eq!(FileFetcher::handles(&ImageRequest::new(data)), expected);
    }

    #[tokio::test]
    async fn test_reads_file_with_mime() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pic.png");
        std::fs::write(&path, b"pixels").unwrap();
        let request = ImageRequest::new(format!("file://{}", path.display()));

        let fetched = FileFetcher::new().fetch(&request, &Liveness::new()).await.unwrap();

        assert_eq!(&fetched.bytes[..], b"pixels");
        assert_eq!(fetched.mime_type.as_deref(), Some("image/png"));
        assert_eq!(fetched.data_source, DataSource::Disk);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.png");
        let request = ImageRequest::new(path.display().to_string());

        let err = FileFetcher::new().fetch(&request, &Liveness::new()).await.unwrap_err();
        assert!(matches!(err, ImageError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_read_stops() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pic.png");
        std::fs::write(&path, b"pixels").unwrap();
        let liveness = Liveness::new();
        liveness.cancel();

        let err = FileFetcher::new()
            .fetch(&ImageRequest::new(path.display().to_string()), &liveness)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
