//! In-memory LRU cache of decoded images with pin-protected reclamation.
//!
//! Every entry carries three counters (pending, cached, displayed). An entry
//! with any non-zero counter is pinned: the eviction sweep skips it, and if it
//! leaves the index anyway (remove, replace, clear) its buffer is only handed
//! to the [`BufferRecycler`] once the last pin is released.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::domain::entities::{CacheKey, DataSource, DecodeResult, DecodedImage, ImageMetadata};
use crate::domain::ports::{BufferRecycler, DropRecycler};

/// Default memory budget in bytes.
pub const DEFAULT_MEMORY_CACHE_SIZE: u64 = 64 * 1024 * 1024;

/// A decoded image as stored in the memory cache.
#[derive(Debug, Clone)]
pub struct CachedImage {
    /// Shared, read-only pixels.
    pub image: Arc<DecodedImage>,
    /// Metadata of the pixels.
    pub metadata: ImageMetadata,
    /// Transformation tags applied to produce the pixels.
    pub transformations: Vec<String>,
}

impl CachedImage {
    /// Byte size used for budget accounting.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.image.byte_size()
    }

    /// Converts back into a pipeline result served from memory.
    #[must_use]
    pub fn to_result(&self) -> DecodeResult {
        DecodeResult {
            image: Arc::clone(&self.image),
            metadata: self.metadata.clone(),
            data_source: DataSource::MemoryCache,
            transformations: self.transformations.clone(),
        }
    }
}

impl From<&DecodeResult> for CachedImage {
    fn from(result: &DecodeResult) -> Self {
        Self {
            image: Arc::clone(&result.image),
            metadata: result.metadata.clone(),
            transformations: result.transformations.clone(),
        }
    }
}

/// Which counter a [`MemoryPin`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinKind {
    /// Result is on its way to a consumer.
    Pending,
    /// Referenced by another cache layer.
    Cached,
    /// Currently shown on screen.
    Displayed,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    pending: u32,
    cached: u32,
    displayed: u32,
}

impl Counters {
    const fn get_mut(&mut self, kind: PinKind) -> &mut u32 {
        match kind {
            PinKind::Pending => &mut self.pending,
            PinKind::Cached => &mut self.cached,
            PinKind::Displayed => &mut self.displayed,
        }
    }

    const fn is_zero(self) -> bool {
        self.pending == 0 && self.cached == 0 && self.displayed == 0
    }
}

struct Entry {
    key: CacheKey,
    value: CachedImage,
    size: u64,
    counters: Counters,
    in_index: bool,
}

type EntryId = u64;
type Reclaimed = Vec<(CacheKey, Arc<DecodedImage>)>;

struct State {
    index: LruCache<CacheKey, EntryId>,
    entries: HashMap<EntryId, Entry>,
    next_id: EntryId,
    size: u64,
}

impl State {
    fn current(&self, key: &CacheKey) -> Option<EntryId> {
        self.index.peek(key).copied()
    }

    /// Most recent entry for `key`, including ones already dropped from the index.
    fn resolve(&self, key: &CacheKey) -> Option<EntryId> {
        self.current(key).or_else(|| {
            self.entries
                .iter()
                .filter(|(_, entry)| !entry.in_index && &entry.key == key)
                .map(|(id, _)| *id)
                .max()
        })
    }

    /// Drops `id` from the index, reclaiming it if unpinned.
    fn detach(&mut self, id: EntryId, reclaimed: &mut Reclaimed) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.in_index {
            entry.in_index = false;
            self.size = self.size.saturating_sub(entry.size);
            if self.index.peek(&entry.key) == Some(&id) {
                self.index.pop(&entry.key);
            }
        }
        if entry.counters.is_zero() {
            self.reclaim(id, reclaimed);
        } else {
            trace!(key = %entry.key, "Entry detached while pinned");
        }
    }

    fn reclaim(&mut self, id: EntryId, reclaimed: &mut Reclaimed) {
        if let Some(entry) = self.entries.remove(&id) {
            debug!(key = %entry.key, size = entry.size, "Reclaiming image buffer");
            reclaimed.push((entry.key, entry.value.image));
        }
    }

    /// Evicts unpinned entries oldest-first until `target` is met.
    fn sweep(&mut self, target: u64, keep: Option<EntryId>, reclaimed: &mut Reclaimed) {
        if self.size <= target {
            return;
        }
        let mut excess = self.size - target;
        let mut victims = Vec::new();
        for (_, id) in self.index.iter().rev() {
            if excess == 0 {
                break;
            }
            if Some(*id) == keep {
                continue;
            }
            if let Some(entry) = self.entries.get(id)
                && entry.counters.is_zero()
            {
                excess = excess.saturating_sub(entry.size);
                victims.push(*id);
            }
        }
        for id in victims {
            if let Some(entry) = self.entries.get(&id) {
                debug!(key = %entry.key, size = entry.size, "Evicting from memory cache");
            }
            self.detach(id, reclaimed);
        }
    }

    fn adjust(&mut self, id: EntryId, kind: PinKind, pinned: bool, reclaimed: &mut Reclaimed) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        let counter = entry.counters.get_mut(kind);
        if pinned {
            *counter = counter.saturating_add(1);
            return true;
        }
        if *counter == 0 {
            return false;
        }
        *counter -= 1;
        if entry.counters.is_zero() && !entry.in_index {
            self.reclaim(id, reclaimed);
        }
        true
    }
}

struct Inner {
    state: Mutex<State>,
    max_size: u64,
    recycler: Arc<dyn BufferRecycler>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Inner {
    fn recycle(&self, reclaimed: Reclaimed) {
        for (key, image) in reclaimed {
            self.recycler.recycle(&key, image);
        }
    }

    fn release(&self, id: EntryId, kind: PinKind) {
        let mut reclaimed = Vec::new();
        self.state.lock().adjust(id, kind, false, &mut reclaimed);
        self.recycle(reclaimed);
    }
}

/// Size-bounded LRU cache of decoded images keyed by result key.
///
/// Cheap to clone; clones share the same storage.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<Inner>,
}

impl MemoryCache {
    /// Creates a cache with a byte budget that drops reclaimed buffers.
    #[must_use]
    pub fn new(max_size: u64) -> Self {
        Self::with_recycler(max_size, Arc::new(DropRecycler))
    }

    /// Creates a cache that hands reclaimed buffers to `recycler`.
    #[must_use]
    pub fn with_recycler(max_size: u64, recycler: Arc<dyn BufferRecycler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    index: LruCache::unbounded(),
                    entries: HashMap::new(),
                    next_id: 0,
                    size: 0,
                }),
                max_size,
                recycler,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// Looks up `key` and marks it recently used.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<CachedImage> {
        let mut state = self.inner.state.lock();
        let found = state.index.get(key).copied();
        let value = found.and_then(|id| state.entries.get(&id).map(|e| e.value.clone()));
        drop(state);
        self.record(key, value.is_some());
        value
    }

    /// Looks up `key`, marks it recently used and pins it in one step.
    #[must_use]
    pub fn get_pinned(&self, key: &CacheKey, kind: PinKind) -> Option<MemoryPin> {
        let mut state = self.inner.state.lock();
        let pin = match state.index.get(key).copied() {
            Some(id) => self.pin_locked(&mut state, id, kind),
            None => None,
        };
        drop(state);
        self.record(key, pin.is_some());
        pin
    }

    /// Looks up `key` without touching LRU order or statistics.
    #[must_use]
    pub fn peek(&self, key: &CacheKey) -> Option<CachedImage> {
        let state = self.inner.state.lock();
        state
            .current(key)
            .and_then(|id| state.entries.get(&id))
            .map(|entry| entry.value.clone())
    }

    /// Returns true if `key` is in the index.
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.state.lock().index.contains(key)
    }

    /// Inserts or replaces `key`, then evicts unpinned entries oldest-first.
    pub fn put(&self, key: CacheKey, value: CachedImage, size: u64) {
        drop(self.insert(key, value, size, None));
    }

    /// Inserts `key` and returns a pin taken before any eviction can see it.
    ///
    /// Returns `None` when the cache is disabled (zero budget).
    #[must_use]
    pub fn put_pinned(
        &self,
        key: CacheKey,
        value: CachedImage,
        size: u64,
        kind: PinKind,
    ) -> Option<MemoryPin> {
        self.insert(key, value, size, Some(kind))
    }

    fn insert(
        &self,
        key: CacheKey,
        value: CachedImage,
        size: u64,
        pin: Option<PinKind>,
    ) -> Option<MemoryPin> {
        if self.inner.max_size == 0 {
            trace!(key = %key, "Memory cache disabled, not storing");
            return None;
        }

        let mut reclaimed = Vec::new();
        let mut state = self.inner.state.lock();

        if let Some(previous) = state.current(&key) {
            state.detach(previous, &mut reclaimed);
        }

        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert(
            id,
            Entry {
                key: key.clone(),
                value,
                size,
                counters: Counters::default(),
                in_index: true,
            },
        );
        state.index.put(key.clone(), id);
        state.size += size;
        debug!(key = %key, size = size, total = state.size, "Stored in memory cache");

        let pinned = pin.and_then(|kind| self.pin_locked(&mut state, id, kind));
        let max_size = self.inner.max_size;
        // An unpinned entry larger than the whole budget is not worth keeping.
        let keep = (pinned.is_some() || size <= max_size).then_some(id);
        state.sweep(max_size, keep, &mut reclaimed);
        drop(state);

        self.inner.recycle(reclaimed);
        pinned
    }

    /// Takes a pin on the current entry for `key`.
    #[must_use]
    pub fn pin(&self, key: &CacheKey, kind: PinKind) -> Option<MemoryPin> {
        let mut state = self.inner.state.lock();
        let id = state.current(key)?;
        self.pin_locked(&mut state, id, kind)
    }

    fn pin_locked(&self, state: &mut State, id: EntryId, kind: PinKind) -> Option<MemoryPin> {
        let mut none = Vec::new();
        if !state.adjust(id, kind, true, &mut none) {
            return None;
        }
        let entry = state.entries.get(&id)?;
        Some(MemoryPin {
            inner: Arc::clone(&self.inner),
            id,
            key: entry.key.clone(),
            kind,
            value: entry.value.clone(),
        })
    }

    /// Increments or decrements the pending counter of `key`.
    ///
    /// Returns false if there is no entry or the counter is already zero.
    pub fn set_pending(&self, key: &CacheKey, pending: bool) -> bool {
        self.set_counter(key, PinKind::Pending, pending)
    }

    /// Increments or decrements the cached counter of `key`.
    pub fn set_cached(&self, key: &CacheKey, cached: bool) -> bool {
        self.set_counter(key, PinKind::Cached, cached)
    }

    /// Increments or decrements the displayed counter of `key`.
    pub fn set_displayed(&self, key: &CacheKey, displayed: bool) -> bool {
        self.set_counter(key, PinKind::Displayed, displayed)
    }

    fn set_counter(&self, key: &CacheKey, kind: PinKind, pinned: bool) -> bool {
        let mut reclaimed = Vec::new();
        let mut state = self.inner.state.lock();
        let changed = match state.resolve(key) {
            Some(id) => state.adjust(id, kind, pinned, &mut reclaimed),
            None => false,
        };
        drop(state);
        trace!(key = %key, kind = ?kind, pinned = pinned, changed = changed, "Counter update");
        self.inner.recycle(reclaimed);
        changed
    }

    /// Removes `key` from the index. Pinned buffers are reclaimed on last unpin.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut reclaimed = Vec::new();
        let mut state = self.inner.state.lock();
        let removed = match state.current(key) {
            Some(id) => {
                state.detach(id, &mut reclaimed);
                true
            }
            None => false,
        };
        drop(state);
        self.inner.recycle(reclaimed);
        removed
    }

    /// Empties the index.
    pub fn clear(&self) {
        let mut reclaimed = Vec::new();
        let mut state = self.inner.state.lock();
        let ids: Vec<EntryId> = state.index.iter().map(|(_, id)| *id).collect();
        for id in ids {
            state.detach(id, &mut reclaimed);
        }
        drop(state);
        debug!(reclaimed = reclaimed.len(), "Cleared memory cache");
        self.inner.recycle(reclaimed);
    }

    /// Evicts unpinned entries oldest-first until the size is at most `target`.
    pub fn trim_to_size(&self, target: u64) {
        let mut reclaimed = Vec::new();
        self.inner.state.lock().sweep(target, None, &mut reclaimed);
        self.inner.recycle(reclaimed);
    }

    /// Bytes held by entries in the index.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.state.lock().size
    }

    /// Configured budget in bytes.
    #[must_use]
    pub fn max_size(&self) -> u64 {
        self.inner.max_size
    }

    /// Number of entries in the index.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().index.len()
    }

    /// Returns true when the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns cache statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            (hits as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        let state = self.inner.state.lock();
        CacheStats {
            hits,
            misses,
            hit_rate,
            size: state.index.len(),
            bytes: state.size,
            detached: state.entries.values().filter(|e| !e.in_index).count(),
        }
    }

    fn record(&self, key: &CacheKey, hit: bool) {
        if hit {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache hit");
        } else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            trace!(key = %key, "Memory cache miss");
        }
    }
}

impl fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCache")
            .field("max_size", &self.inner.max_size)
            .field("stats", &self.stats())
            .finish()
    }
}

/// An outstanding reference to a memory cache entry.
///
/// While alive the entry's buffer is never reclaimed. Cloning takes another
/// pin of the same kind; dropping releases it.
pub struct MemoryPin {
    inner: Arc<Inner>,
    id: EntryId,
    key: CacheKey,
    kind: PinKind,
    value: CachedImage,
}

impl MemoryPin {
    /// Key of the pinned entry.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Kind of counter this pin holds.
    #[must_use]
    pub const fn kind(&self) -> PinKind {
        self.kind
    }

    /// The pinned image.
    #[must_use]
    pub const fn value(&self) -> &CachedImage {
        &self.value
    }

    /// Exchanges this pin for one of another kind without an unpinned gap.
    #[must_use]
    pub fn promote(self, kind: PinKind) -> Self {
        if kind == self.kind {
            return self;
        }
        let mut none = Vec::new();
        self.inner.state.lock().adjust(self.id, kind, true, &mut none);
        Self {
            inner: Arc::clone(&self.inner),
            id: self.id,
            key: self.key.clone(),
            kind,
            value: self.value.clone(),
        }
    }
}

impl Clone for MemoryPin {
    fn clone(&self) -> Self {
        let mut none = Vec::new();
        self.inner
            .state
            .lock()
            .adjust(self.id, self.kind, true, &mut none);
        Self {
            inner: Arc::clone(&self.inner),
            id: self.id,
            key: self.key.clone(),
            kind: self.kind,
            value: self.value.clone(),
        }
    }
}

impl Drop for MemoryPin {
    fn drop(&mut self) {
        self.inner.release(self.id, self.kind);
    }
}

impl fmt::Debug for MemoryPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPin")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Statistics about cache performance.
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Hit rate as a percentage.
    pub hit_rate: f64,
    /// Current number of indexed images.
    pub size: usize,
    /// Bytes held by indexed images.
    pub bytes: u64,
    /// Entries evicted from the index but still pinned.
    pub detached: usize,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cache: {} images ({} bytes, {} pinned outside index), {:.1}% hit rate ({} hits, {} misses)",
            self.size, self.bytes, self.detached, self.hit_rate, self.hits, self.misses
        )
    }
}
