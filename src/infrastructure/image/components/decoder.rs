//! Decoder backed by the `image` crate.

use std::io::Cursor;

use async_trait::async_trait;
use image::imageops::FilterType;
use image::metadata::Orientation as SourceOrientation;
use image::{DynamicImage, ImageDecoder as _, ImageReader};
use tracing::trace;

use crate::domain::entities::{
    ColorPolicy, DecodedImage, DecodedOutput, FetchResult, ImageMetadata, Orientation, Precision,
    RequestOptions, Scale, Size,
};
use crate::domain::errors::{ImageError, ImageResult};
use crate::domain::ports::Decoder;

/// Decodes PNG, JPEG, WebP and GIF, then resamples and converts the pixels
/// as the request asks.
///
/// Decoding runs on the blocking pool; a panicking decode is reported as a
/// decode error.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDecoder;

impl ImageDecoder {
    /// Creates the decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns true if the bytes carry a signature this decoder recognises.
    #[must_use]
    pub fn handles(fetched: &FetchResult) -> bool {
        image::guess_format(&fetched.bytes).is_ok()
    }
}

#[derive(Debug, Clone, Copy)]
struct Target {
    size: Size,
    scale: Scale,
    precision: Precision,
    color: ColorPolicy,
}

fn resample(image: DynamicImage, target: Target) -> (DynamicImage, Option<String>) {
    let Size::Exact { width, height } = target.size else {
        return (image, None);
    };
    if width == 0 || height == 0 {
        return (image, None);
    }

    let (source_width, source_height) = (image.width(), image.height());
    if target.precision == Precision::Inexact {
        let already_small = match target.scale {
            Scale::Fit => source_width <= width && source_height <= height,
            Scale::Fill => source_width <= width || source_height <= height,
        };
        if already_small {
            return (image, None);
        }
    }

    let resized = match target.scale {
        Scale::Fit => image.resize(width, height, FilterType::Lanczos3),
        Scale::Fill => image.resize_to_fill(width, height, FilterType::Lanczos3),
    };
    if (resized.width(), resized.height()) == (source_width, source_height) {
        return (image, None);
    }
    let scale = match target.scale {
        Scale::Fit => "fit",
        Scale::Fill => "fill",
    };
    let tag = format!("resize({}x{},{scale})", resized.width(), resized.height());
    (resized, Some(tag))
}

fn convert(image: DynamicImage, color: ColorPolicy) -> DynamicImage {
    match color {
        ColorPolicy::Native => image,
        ColorPolicy::Rgba8 => DynamicImage::ImageRgba8(image.to_rgba8()),
        ColorPolicy::Rgb8 => DynamicImage::ImageRgb8(image.to_rgb8()),
        ColorPolicy::Luma8 => DynamicImage::ImageLuma8(image.to_luma8()),
    }
}

const fn orientation_of(source: SourceOrientation) -> Orientation {
    match source {
        SourceOrientation::NoTransforms => Orientation::Normal,
        SourceOrientation::FlipHorizontal => Orientation::FlipHorizontal,
        SourceOrientation::Rotate180 => Orientation::Rotate180,
        SourceOrientation::FlipVertical => Orientation::FlipVertical,
        SourceOrientation::Rotate90 => Orientation::Rotate90,
        SourceOrientation::Rotate270 => Orientation::Rotate270,
        SourceOrientation::Rotate90FlipH => Orientation::Rotate90FlipHorizontal,
        SourceOrientation::Rotate270FlipH => Orientation::Rotate270FlipHorizontal,
    }
}

fn decode_blocking(bytes: &[u8], target: Target) -> ImageResult<DecodedOutput> {
    let format = image::guess_format(bytes)
        .map_err(|e| ImageError::decode(format!("unrecognised image format: {e}")))?;
    let mut decoder = ImageReader::with_format(Cursor::new(bytes), format)
        .into_decoder()
        .map_err(|e| ImageError::decode(e.to_string()))?;
    // A broken EXIF block is not worth failing the decode over.
    let orientation = decoder
        .orientation()
        .map_or(Orientation::Normal, orientation_of);
    let decoded =
        DynamicImage::from_decoder(decoder).map_err(|e| ImageError::decode(e.to_string()))?;

    let (resampled, tag) = resample(decoded, target);
    let pixels = convert(resampled, target.color);

    let metadata = ImageMetadata {
        width: pixels.width(),
        height: pixels.height(),
        mime_type: Some(format.to_mime_type().to_string()),
        orientation,
    };
    Ok(DecodedOutput {
        image: DecodedImage::new(pixels),
        metadata,
        transformations: tag.into_iter().collect(),
    })
}

#[async_trait]
impl Decoder for ImageDecoder {
    async fn decode(
        &self,
        fetched: &FetchResult,
        options: &RequestOptions,
    ) -> ImageResult<DecodedOutput> {
        let bytes = fetched.bytes.clone();
        let target = Target {
            size: options.size,
            scale: options.scale,
            precision: options.effective_precision(),
            color: options.color,
        };

        let output = tokio::task::spawn_blocking(move || decode_blocking(&bytes, target))
            .await
            .map_err(|e| ImageError::decode(format!("decode task panicked: {e}")))??;

        trace!(
            width = output.metadata.width,
            height = output.metadata.height,
            mime = ?output.metadata.mime_type,
            "Decoded image"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{DataSource, ImageRequest};
    use image::ImageFormat;
    use test_case::test_case;

    fn png(width: u32, height: u32) -> FetchResult {
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::new_rgb8(width, height)
            .write_to(&mut buffer, ImageFormat::Png)
            .unwrap();
        FetchResult::new(buffer.into_inner(), None, DataSource::Network)
    }

    async fn decode(fetched: &FetchResult, request: &ImageRequest) -> DecodedOutput {
        ImageDecoder::new()
            .decode(fetched, request.options())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_decodes_original_size() {
        let output = decode(&png(20, 10), &ImageRequest::new("img://a")).await;

        assert_eq!((output.metadata.width, output.metadata.height), (20, 10));
        assert_eq!(output.metadata.mime_type.as_deref(), Some("image/png"));
        assert_eq!(output.metadata.orientation, Orientation::Normal);
        assert!(output.transformations.is_empty());
    }

    #[test_case(SourceOrientation::NoTransforms, Orientation::Normal ; "none")]
    #[test_case(SourceOrientation::Rotate90, Orientation::Rotate90 ; "rotate_90")]
    #[test_case(SourceOrientation::FlipVertical, Orientation::FlipVertical ; "flip_vertical")]
    #[test_case(SourceOrientation::Rotate270FlipH, Orientation::Rotate270FlipHorizontal ; "rotate_270_flip")]
    fn test_source_orientation_is_reported(source: SourceOrientation, expected: Orientation) {
        assert_eq!(orientation_of(source), expected);
    }

    #[test_case(Scale::Fit, Precision::Exact, (40, 40), (40, 20) ; "fit_exact_upscales")]
    #[test_case(Scale::Fit, Precision::Inexact, (40, 40), (20, 10) ; "fit_inexact_keeps_small_source")]
    #[test_case(Scale::Fit, Precision::Inexact, (10, 10), (10, 5) ; "fit_inexact_downscales")]
    #[test_case(Scale::Fill, Precision::Exact, (8, 8), (8, 8) ; "fill_crops_to_box")]
    #[test_case(Scale::Fill, Precision::Inexact, (8, 16), (20, 10) ; "fill_inexact_keeps_short_side")]
    #[tokio::test]
    async fn test_resampling(
        scale: Scale,
        precision: Precision,
        target: (u32, u32),
        expected: (u32, u32),
    ) {
        let request = ImageRequest::builder("img://a")
            .dimensions(target.0, target.1)
            .scale(scale)
            .precision(precision)
            .build();

        let output = decode(&png(20, 10), &request).await;

        assert_eq!((output.metadata.width, output.metadata.height), expected);
        assert_eq!(output.transformations.is_empty(), expected == (20, 10));
    }

    #[tokio::test]
    async fn test_color_policy_converts_pixels() {
        let request = ImageRequest::builder("img://a")
            .color(ColorPolicy::Luma8)
            .build();

        let output = decode(&png(4, 4), &request).await;

        assert_eq!(output.image.pixels().color(), image::ColorType::L8);
    }

    #[tokio::test]
    async fn test_garbage_is_decode_error() {
        let garbage = FetchResult::new(&b"not an image"[..], None, DataSource::Network);
        let err = ImageDecoder::new()
            .decode(&garbage, ImageRequest::new("img://a").options())
            .await
            .unwrap_err();

        assert!(matches!(err, ImageError::Decode { .. }));
        assert!(!ImageDecoder::handles(&garbage));
        assert!(ImageDecoder::handles(&png(1, 1)));
    }
}
