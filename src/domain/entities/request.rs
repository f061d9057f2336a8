//! Image requests and their option set.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::ports::{EventListener, Transformation};

/// Requested output dimensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Size {
    /// Keep the source dimensions.
    #[default]
    Original,
    /// Fit the output into a `width` x `height` box.
    Exact {
        /// Target width in pixels.
        width: u32,
        /// Target height in pixels.
        height: u32,
    },
}

impl Size {
    /// Creates an exact target size.
    #[must_use]
    pub const fn exact(width: u32, height: u32) -> Self {
        Self::Exact { width, height }
    }

    /// Returns true if no resampling target was requested.
    #[must_use]
    pub const fn is_original(self) -> bool {
        matches!(self, Self::Original)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Original => f.write_str("original"),
            Self::Exact { width, height } => write!(f, "{width}x{height}"),
        }
    }
}

/// How the source is mapped into the target box.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scale {
    /// Scale so the whole image fits inside the box.
    #[default]
    Fit,
    /// Scale so the image covers the box, cropping the overflow.
    Fill,
}

/// Whether the decoded output must match the target size exactly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Output dimensions must match the target exactly.
    Exact,
    /// Output may be larger than the target; only downsampling happens.
    Inexact,
    /// Exact when transformations are present, inexact otherwise.
    #[default]
    Automatic,
}

impl Precision {
    /// Resolves `Automatic` against the request's transformation list.
    #[must_use]
    pub const fn resolve(self, has_transformations: bool) -> Self {
        match self {
            Self::Automatic if has_transformations => Self::Exact,
            Self::Automatic => Self::Inexact,
            other => other,
        }
    }
}

/// Pixel layout of the decoded artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorPolicy {
    /// Keep the decoder's native layout.
    #[default]
    Native,
    /// Force 8-bit RGBA.
    Rgba8,
    /// Force 8-bit RGB without alpha.
    Rgb8,
    /// Force 8-bit grayscale.
    Luma8,
}

/// Read/write policy for one cache layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Read and write.
    #[default]
    Enabled,
    /// Read only.
    ReadOnly,
    /// Write only.
    WriteOnly,
    /// Neither read nor write.
    Disabled,
}

impl CachePolicy {
    /// Returns true if the layer may be read.
    #[must_use]
    pub const fn read_enabled(self) -> bool {
        matches!(self, Self::Enabled | Self::ReadOnly)
    }

    /// Returns true if the layer may be written.
    #[must_use]
    pub const fn write_enabled(self) -> bool {
        matches!(self, Self::Enabled | Self::WriteOnly)
    }
}

/// Deepest tier a request is allowed to reach.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FetchDepth {
    /// Only the memory cache.
    Memory,
    /// Memory and disk caches, plus local sources.
    Disk,
    /// Everything, including the network.
    #[default]
    Network,
}

impl fmt::Display for FetchDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Disk => f.write_str("disk"),
            Self::Network => f.write_str("network"),
        }
    }
}

/// Immutable option set attached to a request.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Target output size.
    pub size: Size,
    /// Scale mode applied when `size` is exact.
    pub scale: Scale,
    /// Size precision.
    pub precision: Precision,
    /// Pixel layout of the output.
    pub color: ColorPolicy,
    /// Transformations applied in order after decoding.
    pub transformations: Vec<Arc<dyn Transformation>>,
    /// Memory cache policy.
    pub memory_cache_policy: CachePolicy,
    /// Disk cache policy (download and result layers).
    pub disk_cache_policy: CachePolicy,
    /// Network policy; only the read side is meaningful.
    pub network_cache_policy: CachePolicy,
    /// Deepest tier this request may reach.
    pub depth: FetchDepth,
    /// Overrides the derived result key.
    pub memory_cache_key: Option<String>,
    /// Overrides the derived download key.
    pub disk_cache_key: Option<String>,
    /// Extra values folded into the result key.
    pub memory_cache_key_extras: BTreeMap<String, String>,
    /// Headers sent by network fetchers.
    pub headers: BTreeMap<String, String>,
}

impl RequestOptions {
    /// Returns the cache tags of the configured transformations, in order.
    #[must_use]
    pub fn transformation_keys(&self) -> Vec<String> {
        self.transformations.iter().map(|t| t.cache_key()).collect()
    }

    /// Returns the precision after resolving `Automatic`.
    #[must_use]
    pub fn effective_precision(&self) -> Precision {
        self.precision.resolve(!self.transformations.is_empty())
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("size", &self.size)
            .field("scale", &self.scale)
            .field("precision", &self.precision)
            .field("color", &self.color)
            .field("transformations", &self.transformation_keys())
            .field("memory_cache_policy", &self.memory_cache_policy)
            .field("disk_cache_policy", &self.disk_cache_policy)
            .field("network_cache_policy", &self.network_cache_policy)
            .field("depth", &self.depth)
            .field("memory_cache_key", &self.memory_cache_key)
            .field("disk_cache_key", &self.disk_cache_key)
            .field("memory_cache_key_extras", &self.memory_cache_key_extras)
            .field("headers", &self.headers)
            .finish()
    }
}

impl PartialEq for RequestOptions {
    fn eq(&self, other: &Self) -> bool {
        self.size == other.size
            && self.scale == other.scale
            && self.precision == other.precision
            && self.color == other.color
            && self.transformation_keys() == other.transformation_keys()
            && self.memory_cache_policy == other.memory_cache_policy
            && self.disk_cache_policy == other.disk_cache_policy
            && self.network_cache_policy == other.network_cache_policy
            && self.depth == other.depth
            && self.memory_cache_key == other.memory_cache_key
            && self.disk_cache_key == other.disk_cache_key
            && self.memory_cache_key_extras == other.memory_cache_key_extras
            && self.headers == other.headers
    }
}

impl Eq for RequestOptions {}

impl Hash for RequestOptions {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.size.hash(state);
        self.scale.hash(state);
        self.precision.hash(state);
        self.color.hash(state);
        self.transformation_keys().hash(state);
        self.memory_cache_policy.hash(state);
        self.disk_cache_policy.hash(state);
        self.network_cache_policy.hash(state);
        self.depth.hash(state);
        self.memory_cache_key.hash(state);
        self.disk_cache_key.hash(state);
        self.memory_cache_key_extras.hash(state);
        self.headers.hash(state);
    }
}

/// A request for one image: a resource locator plus options.
///
/// Requests are built once through [`ImageRequestBuilder`] and never mutated.
/// Equality and hashing cover the locator and options; the listener is
/// excluded.
#[derive(Clone)]
pub struct ImageRequest {
    data: String,
    options: RequestOptions,
    listener: Option<Arc<dyn EventListener>>,
}

impl ImageRequest {
    /// Starts building a request for `data`.
    #[must_use]
    pub fn builder(data: impl Into<String>) -> ImageRequestBuilder {
        ImageRequestBuilder::new(data)
    }

    /// Creates a request with default options.
    #[must_use]
    pub fn new(data: impl Into<String>) -> Self {
        Self::builder(data).build()
    }

    /// Returns the resource locator.
    #[must_use]
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Returns the option set.
    #[must_use]
    pub const fn options(&self) -> &RequestOptions {
        &self.options
    }

    /// Returns the event listener, if any.
    #[must_use]
    pub fn listener(&self) -> Option<&Arc<dyn EventListener>> {
        self.listener.as_ref()
    }

    /// Returns a builder seeded with this request's values.
    #[must_use]
    pub fn to_builder(&self) -> ImageRequestBuilder {
        ImageRequestBuilder {
            data: self.data.clone(),
            options: self.options.clone(),
            listener: self.listener.clone(),
        }
    }
}

impl fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageRequest")
            .field("data", &self.data)
            .field("options", &self.options)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl PartialEq for ImageRequest {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data && self.options == other.options
    }
}

impl Eq for ImageRequest {}

impl Hash for ImageRequest {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.hash(state);
        self.options.hash(state);
    }
}

/// Builder for [`ImageRequest`].
#[derive(Clone)]
pub struct ImageRequestBuilder {
    data: String,
    options: RequestOptions,
    listener: Option<Arc<dyn EventListener>>,
}

impl ImageRequestBuilder {
    /// Creates a builder for `data` with default options.
    #[must_use]
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            options: RequestOptions::default(),
            listener: None,
        }
    }

    /// Sets the target size.
    #[must_use]
    pub fn size(mut self, size: Size) -> Self {
        self.options.size = size;
        self
    }

    /// Sets an exact target size.
    #[must_use]
    pub fn dimensions(self, width: u32, height: u32) -> Self {
        self.size(Size::exact(width, height))
    }

    /// Sets the scale mode.
    #[must_use]
    pub fn scale(mut self, scale: Scale) -> Self {
        self.options.scale = scale;
        self
    }

    /// Sets the size precision.
    #[must_use]
    pub fn precision(mut self, precision: Precision) -> Self {
        self.options.precision = precision;
        self
    }

    /// Sets the color policy.
    #[must_use]
    pub fn color(mut self, color: ColorPolicy) -> Self {
        self.options.color = color;
        self
    }

    /// Appends a transformation.
    #[must_use]
    pub fn transformation(mut self, transformation: Arc<dyn Transformation>) -> Self {
        self.options.transformations.push(transformation);
        self
    }

    /// Replaces the transformation list.
    #[must_use]
    pub fn transformations(mut self, transformations: Vec<Arc<dyn Transformation>>) -> Self {
        self.options.transformations = transformations;
        self
    }

    /// Sets the memory cache policy.
    #[must_use]
    pub fn memory_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.options.memory_cache_policy = policy;
        self
    }

    /// Sets the disk cache policy.
    #[must_use]
    pub fn disk_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.options.disk_cache_policy = policy;
        self
    }

    /// Sets the network policy.
    #[must_use]
    pub fn network_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.options.network_cache_policy = policy;
        self
    }

    /// Limits how deep the request may go.
    #[must_use]
    pub fn depth(mut self, depth: FetchDepth) -> Self {
        self.options.depth = depth;
        self
    }

    /// Overrides the derived result key.
    #[must_use]
    pub fn memory_cache_key(mut self, key: impl Into<String>) -> Self {
        self.options.memory_cache_key = Some(key.into());
        self
    }

    /// Overrides the derived download key.
    #[must_use]
    pub fn disk_cache_key(mut self, key: impl Into<String>) -> Self {
        self.options.disk_cache_key = Some(key.into());
        self
    }

    /// Adds an extra value to the result key.
    #[must_use]
    pub fn memory_cache_key_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options
            .memory_cache_key_extras
            .insert(key.into(), value.into());
        self
    }

    /// Adds a header for network fetchers.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the event listener.
    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Finishes the request.
    #[must_use]
    pub fn build(self) -> ImageRequest {
        ImageRequest {
            data: self.data,
            options: self.options,
            listener: self.listener,
        }
    }
}
