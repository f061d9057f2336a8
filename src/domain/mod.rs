//! Domain layer with core entities, errors, port definitions and pure services.

/// Entity definitions.
pub mod entities;
/// Error types.
pub mod errors;
/// Port definitions.
pub mod ports;
/// Pure services.
pub mod services;

pub use entities::{CacheKey, ImageRequest, RequestKeys};
pub use errors::{ImageError, ImageResult};
pub use ports::{BufferRecycler, Decoder, EventListener, Fetcher, Transformation};
pub use services::CacheKeyCodec;
