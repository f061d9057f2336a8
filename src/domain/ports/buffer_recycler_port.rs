//! Port definition for reclaimed pixel buffers.

use std::sync::Arc;

use crate::domain::entities::{CacheKey, DecodedImage};

/// Receives buffers the memory cache has released.
///
/// Called exactly once per buffer, only after every pin on the entry is gone
/// and the entry has left the LRU index.
pub trait BufferRecycler: Send + Sync {
    /// Takes ownership of the cache's reference to `image`.
    fn recycle(&self, key: &CacheKey, image: Arc<DecodedImage>);
}

/// Recycler that simply drops the buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct DropRecycler;

impl BufferRecycler for DropRecycler {
    fn recycle(&self, _key: &CacheKey, image: Arc<DecodedImage>) {
        drop(image);
    }
}
