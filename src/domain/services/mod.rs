//! Pure domain services.

mod cache_key_codec;

pub use cache_key_codec::{CacheKeyCodec, KEY_SCHEME_VERSION};
