//! Domain types for fetched bytes and decoded images.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Where a result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    /// Bytes embedded in the locator itself (data URIs, in-memory buffers).
    Memory,
    /// Served from the decoded memory cache.
    MemoryCache,
    /// Read from a disk cache layer or a local file.
    Disk,
    /// Downloaded from the network.
    Network,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::MemoryCache => f.write_str("memory_cache"),
            Self::Disk => f.write_str("disk"),
            Self::Network => f.write_str("network"),
        }
    }
}

/// EXIF-style orientation of the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    /// No rotation or flip.
    #[default]
    Normal,
    /// Mirrored horizontally.
    FlipHorizontal,
    /// Rotated 180 degrees.
    Rotate180,
    /// Mirrored vertically.
    FlipVertical,
    /// Rotated 90 degrees clockwise.
    Rotate90,
    /// Rotated 270 degrees clockwise.
    Rotate270,
    /// Rotated 90 degrees clockwise, then mirrored horizontally.
    Rotate90FlipHorizontal,
    /// Rotated 270 degrees clockwise, then mirrored horizontally.
    Rotate270FlipHorizontal,
}

/// Metadata describing a decoded image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Width of the decoded pixels.
    pub width: u32,
    /// Height of the decoded pixels.
    pub height: u32,
    /// MIME type of the source bytes, if known.
    pub mime_type: Option<String>,
    /// Source orientation.
    #[serde(default)]
    pub orientation: Orientation,
}

/// A decoded, immutable pixel buffer.
///
/// Shared behind `Arc` once published; nothing mutates it afterwards.
pub struct DecodedImage {
    pixels: image::DynamicImage,
}

impl DecodedImage {
    /// Wraps decoded pixels.
    #[must_use]
    pub const fn new(pixels: image::DynamicImage) -> Self {
        Self { pixels }
    }

    /// Returns the pixel buffer.
    #[must_use]
    pub const fn pixels(&self) -> &image::DynamicImage {
        &self.pixels
    }

    /// Width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    /// Height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Size of the pixel buffer in bytes.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.pixels.as_bytes().len() as u64
    }
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedImage")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("color", &self.pixels.color())
            .finish()
    }
}

impl From<image::DynamicImage> for DecodedImage {
    fn from(pixels: image::DynamicImage) -> Self {
        Self::new(pixels)
    }
}

/// Raw bytes produced by a fetcher.
#[derive(Debug, Clone)]
pub struct FetchResult {
    /// The fetched bytes.
    pub bytes: Bytes,
    /// Detected MIME type, if any.
    pub mime_type: Option<String>,
    /// Provenance of the bytes.
    pub data_source: DataSource,
}

impl FetchResult {
    /// Creates a fetch result.
    #[must_use]
    pub fn new(bytes: impl Into<Bytes>, mime_type: Option<String>, data_source: DataSource) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type,
            data_source,
        }
    }
}

/// What a decoder hands back.
#[derive(Debug)]
pub struct DecodedOutput {
    /// The decoded pixels.
    pub image: DecodedImage,
    /// Metadata of the decoded pixels.
    pub metadata: ImageMetadata,
    /// Tags for work the decoder applied itself (e.g. resampling).
    pub transformations: Vec<String>,
}

/// A decoded artifact travelling through the pipeline.
///
/// Transform stages build a new value instead of mutating this one.
#[derive(Debug, Clone)]
pub struct DecodeResult {
    /// The decoded artifact.
    pub image: Arc<DecodedImage>,
    /// Image metadata.
    pub metadata: ImageMetadata,
    /// Provenance.
    pub data_source: DataSource,
    /// Transformation tags applied so far, in order.
    pub transformations: Vec<String>,
}

impl DecodeResult {
    /// Builds a result from decoder output.
    #[must_use]
    pub fn from_output(output: DecodedOutput, data_source: DataSource) -> Self {
        Self {
            image: Arc::new(output.image),
            metadata: output.metadata,
            data_source,
            transformations: output.transformations,
        }
    }

    /// Returns a new result with `image` replacing the artifact and `tag` appended.
    #[must_use]
    pub fn with_transformed(&self, image: DecodedImage, tag: String) -> Self {
        let mut transformations = self.transformations.clone();
        transformations.push(tag);
        Self {
            metadata: ImageMetadata {
                width: image.width(),
                height: image.height(),
                ..self.metadata.clone()
            },
            image: Arc::new(image),
            data_source: self.data_source,
            transformations,
        }
    }
}
