//! Opaque cache keys.

use std::fmt;

/// Identifies one entry in a cache layer.
///
/// Keys are produced by [`CacheKeyCodec`](crate::domain::services::CacheKeyCodec);
/// callers should treat the contents as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wraps an already-derived key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the key and returns the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The pair of keys derived for a single request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKeys {
    /// Identifies the raw fetched bytes.
    pub download: CacheKey,
    /// Identifies the fully processed decoded artifact.
    pub result: CacheKey,
}
