//! Domain entity definitions.

mod cache_key;
mod image;
mod liveness;
mod request;
mod request_state;

pub use cache_key::{CacheKey, RequestKeys};
pub use image::{
    DataSource, DecodeResult, DecodedImage, DecodedOutput, FetchResult, ImageMetadata, Orientation,
};
pub use liveness::{CancelOnDrop, Liveness};
pub use request::{
    CachePolicy, ColorPolicy, FetchDepth, ImageRequest, ImageRequestBuilder, Precision,
    RequestOptions, Scale, Size,
};
pub use request_state::RequestState;
