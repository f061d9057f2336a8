//! Per-request lifecycle state.

use std::fmt;

/// Where a request is in the pipeline.
///
/// `Created -> KeyDerived -> (MemoryHit -> Done) | (MemoryMiss -> Coordinating ->
/// Fetching -> Decoding -> Transforming -> Storing -> Done)`, with `Failed`
/// reachable from the working states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Request accepted.
    #[default]
    Created,
    /// Cache keys computed.
    KeyDerived,
    /// Served from the memory cache.
    MemoryHit,
    /// Not in the memory cache.
    MemoryMiss,
    /// Attached to a single-flight execution.
    Coordinating,
    /// Fetching bytes.
    Fetching,
    /// Decoding bytes.
    Decoding,
    /// Applying transformations.
    Transforming,
    /// Writing results to caches.
    Storing,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
}

impl RequestState {
    /// Returns true if moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use RequestState::{
            Coordinating, Created, Decoding, Done, Failed, Fetching, KeyDerived, MemoryHit,
            MemoryMiss, Storing, Transforming,
        };
        matches!(
            (self, next),
            (Created, KeyDerived)
                | (KeyDerived, MemoryHit | MemoryMiss)
                | (MemoryHit, Done)
                | (MemoryMiss, Coordinating)
                // A result-cache hit skips fetching and decoding.
                | (Coordinating, Fetching | Transforming | Storing | Done | Failed)
                | (Fetching, Decoding | Failed)
                // Decode-level executions finish without storing.
                | (Decoding, Transforming | Storing | Done | Failed)
                | (Transforming, Storing | Done | Failed)
                | (Storing, Done | Failed)
                | (KeyDerived | MemoryMiss, Failed)
        )
    }

    /// Returns true for `Done` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::KeyDerived => "key_derived",
            Self::MemoryHit => "memory_hit",
            Self::MemoryMiss => "memory_miss",
            Self::Coordinating => "coordinating",
            Self::Fetching => "fetching",
            Self::Decoding => "decoding",
            Self::Transforming => "transforming",
            Self::Storing => "storing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
