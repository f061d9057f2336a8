//! The value passed along an interceptor chain.

use tracing::{debug, warn};

use crate::domain::entities::{
    CacheKey, DecodeResult, FetchResult, ImageRequest, Liveness, RequestKeys, RequestState,
};

use crate::infrastructure::image::memory_cache::MemoryPin;

/// One request's progress through a chain.
///
/// Interceptors receive the exchange by value, fill in what their stage
/// produces and hand it on; nothing about a chain execution lives in
/// shared mutable state.
#[derive(Debug)]
pub struct Exchange {
    /// The request being served.
    pub request: ImageRequest,
    /// Keys derived from the request.
    pub keys: RequestKeys,
    /// Liveness of the execution this exchange runs in.
    pub liveness: Liveness,
    /// Bytes produced by the fetch stage, until decoded.
    pub fetched: Option<FetchResult>,
    /// Decoded result, once available.
    pub decoded: Option<DecodeResult>,
    /// Whether the transform stage runs.
    pub apply_transformations: bool,
    /// Transformations were already applied (fresh or from the result cache).
    pub transformed: bool,
    /// The decoded result was read from the result cache.
    pub from_result_cache: bool,
    /// Pin keeping the stored memory entry alive until handed to the caller.
    pub memory_hold: Option<MemoryPin>,
    state: RequestState,
}

impl Exchange {
    /// Creates an exchange in the `Created` state.
    #[must_use]
    pub fn new(request: ImageRequest, keys: RequestKeys) -> Self {
        Self {
            request,
            keys,
            liveness: Liveness::new(),
            fetched: None,
            decoded: None,
            apply_transformations: true,
            transformed: false,
            from_result_cache: false,
            memory_hold: None,
            state: RequestState::Created,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> RequestState {
        self.state
    }

    /// Moves to `next`, reporting it to the request's listener.
    ///
    /// Staying in the same state is a no-op; an illegal transition is logged
    /// and ignored.
    pub fn transition(&mut self, next: RequestState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!(
                data = %self.request.data(),
                from = %self.state,
                to = %next,
                "Ignoring invalid request state transition"
            );
            return;
        }
        debug!(data = %self.request.data(), from = %self.state, to = %next, "Request state");
        self.state = next;
        if let Some(listener) = self.request.listener() {
            listener.on_state(&self.request, next);
        }
    }

    /// Copies the request-level fields into a fresh exchange for a shared
    /// execution.
    #[must_use]
    pub fn fork(&self, liveness: Liveness) -> Self {
        Self {
            request: self.request.clone(),
            keys: self.keys.clone(),
            liveness,
            fetched: None,
            decoded: None,
            apply_transformations: self.apply_transformations,
            transformed: false,
            from_result_cache: false,
            memory_hold: None,
            state: self.state,
        }
    }

    /// Key of the result this exchange produces.
    #[must_use]
    pub const fn result_key(&self) -> &CacheKey {
        &self.keys.result
    }
}

/// What a shared execution hands to every attached caller.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// The decoded result.
    pub decoded: DecodeResult,
    /// Pin on the stored memory entry; each clone is a separate pin.
    pub pin: Option<MemoryPin>,
}

/// The final result of a request.
#[derive(Debug, Clone)]
pub struct ImageResponse {
    /// The request that was served.
    pub request: ImageRequest,
    /// Keys used for the request.
    pub keys: RequestKeys,
    /// The decoded image.
    pub result: DecodeResult,
    /// Pending pin on the memory cache entry, if the result was cached.
    ///
    /// Promote it to `Displayed` while the image is on screen; dropping it
    /// lets the cache reclaim the buffer once evicted.
    pub pin: Option<MemoryPin>,
}
