//! Infrastructure layer with caches, the pipeline and default collaborators.

/// Pipeline configuration.
pub mod config;
/// Image handling (caching, pipeline, loading).
pub mod image;

pub use config::{CliArgs, Command, ConfigError, LogLevel, PipelineConfig, StorageManager};
pub use image::{
    CacheStats, ComponentRegistry, DiskCache, HttpFetcher, ImageLoadedEvent, ImageLoader,
    ImageLoaderConfig, ImageResponse, MemoryCache, MemoryPin, PinKind,
};
