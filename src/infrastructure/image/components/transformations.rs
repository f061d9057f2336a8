//! Built-in transformations.

use std::sync::Arc;

use async_trait::async_trait;
use image::DynamicImage;

use crate::domain::entities::{DecodedImage, Size};
use crate::domain::errors::{ImageError, ImageResult};
use crate::domain::ports::Transformation;

async fn run_blocking<F>(tag: String, work: F) -> ImageResult<Option<DecodedImage>>
where
    F: FnOnce() -> Option<DynamicImage> + Send + 'static,
{
    let output = tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ImageError::transform(tag, format!("task panicked: {e}")))?;
    Ok(output.map(DecodedImage::new))
}

/// Converts the image to 8-bit grayscale.
#[derive(Debug, Clone, Copy, Default)]
pub struct GrayscaleTransformation;

#[async_trait]
impl Transformation for GrayscaleTransformation {
    fn cache_key(&self) -> String {
        "grayscale".to_string()
    }

    async fn transform(
        &self,
        image: Arc<DecodedImage>,
        _size: Size,
    ) -> ImageResult<Option<DecodedImage>> {
        run_blocking(self.cache_key(), move || {
            let pixels = image.pixels();
            if matches!(pixels, DynamicImage::ImageLuma8(_)) {
                return None;
            }
            Some(DynamicImage::ImageLuma8(pixels.to_luma8()))
        })
        .await
    }
}

/// Gaussian blur with a fixed sigma.
#[derive(Debug, Clone, Copy)]
pub struct BlurTransformation {
    sigma: f32,
}

impl BlurTransformation {
    /// Creates a blur; `sigma` must be positive and finite.
    ///
    /// # Errors
    /// Returns a transform error for an unusable sigma.
    pub fn new(sigma: f32) -> ImageResult<Self> {
        if !sigma.is_finite() || sigma <= 0.0 {
            return Err(ImageError::transform(
                format!("blur({sigma})"),
                "sigma must be positive",
            ));
        }
        Ok(Self { sigma })
    }
}

#[async_trait]
impl Transformation for BlurTransformation {
    fn cache_key(&self) -> String {
        format!("blur({})", self.sigma)
    }

    async fn transform(
        &self,
        image: Arc<DecodedImage>,
        _size: Size,
    ) -> ImageResult<Option<DecodedImage>> {
        let sigma = self.sigma;
        run_blocking(self.cache_key(), move || Some(image.pixels().blur(sigma))).await
    }
}
