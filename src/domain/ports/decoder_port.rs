//! Port definition for decoding bytes into images.

use async_trait::async_trait;

use crate::domain::entities::{DecodedOutput, FetchResult, RequestOptions};
use crate::domain::errors::ImageResult;

/// Decodes fetched bytes into pixels honouring the request's options.
///
/// Decoding is CPU-bound; implementations move the work off the async
/// executor.
#[async_trait]
pub trait Decoder: Send + Sync {
    /// Decodes `fetched` for a request with `options`.
    async fn decode(
        &self,
        fetched: &FetchResult,
        options: &RequestOptions,
    ) -> ImageResult<DecodedOutput>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::domain::entities::{DecodedImage, ImageMetadata, Orientation, Size};
    use crate::domain::errors::ImageError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Decoder producing blank RGBA images of the requested size.
    ///
    /// Bytes starting with `bad` fail to decode.
    #[derive(Default)]
    pub struct SyntheticDecoder {
        calls: AtomicUsize,
    }

    impl SyntheticDecoder {
        /// Creates a decoder.
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of decodes performed.
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Decoder for SyntheticDecoder {
        async fn decode(
            &self,
            fetched: &FetchResult,
            options: &RequestOptions,
        ) -> ImageResult<DecodedOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if fetched.bytes.starts_with(b"bad") {
                return Err(ImageError::decode("unrecognised signature"));
            }
            let (width, height) = match options.size {
                Size::Original => (16, 16),
                Size::Exact { width, height } => (width, height),
            };
            Ok(DecodedOutput {
                image: DecodedImage::new(image::DynamicImage::new_rgba8(width, height)),
                metadata: ImageMetadata {
                    width,
                    height,
                    mime_type: fetched.mime_type.clone(),
                    orientation: Orientation::Normal,
                },
                transformations: Vec::new(),
            })
        }
    }
}
