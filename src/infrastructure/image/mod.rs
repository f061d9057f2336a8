//! Image handling infrastructure.
//!
//! This module provides:
//! - A memory cache of decoded images with pin-aware eviction
//! - Journaled disk caches for downloaded bytes and transformed results
//! - The request-level and decode-level interceptor chains
//! - The loader tying them together, plus default fetchers and decoder

pub mod components;
pub mod disk_cache;
pub mod loader;
pub mod memory_cache;
pub mod pipeline;

pub use components::{
    BlurTransformation, ComponentRegistry, DataUriFetcher, FileFetcher, GrayscaleTransformation,
    HttpFetcher, ImageDecoder,
};
pub use disk_cache::{DiskCache, DiskCacheError, DiskCacheResult, Editor, Snapshot};
pub use loader::{ImageLoadedEvent, ImageLoader, ImageLoaderBuilder, ImageLoaderConfig, RequestHandle};
pub use memory_cache::{CacheStats, CachedImage, MemoryCache, MemoryPin, PinKind};
pub use pipeline::{Chain, Exchange, ImageResponse, Interceptor};
