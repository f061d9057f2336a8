//! Journaled, size-bounded LRU store of byte blobs.
//!
//! Every entry has a data value (`<hash>.0`) and an optional metadata
//! sidecar (`<hash>.1`), where `<hash>` is the SHA-256 of the cache key.
//! Writes go through an [`Editor`] into `<hash>.N.tmp` files that are synced
//! and renamed into place on commit; reads go through a [`Snapshot`] that
//! keeps its files open, so a later commit to the same key never changes
//! what an existing snapshot sees.

mod error;
mod journal;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, trace, warn};

use crate::domain::entities::{CacheKey, Liveness};

pub use error::{DiskCacheError, DiskCacheResult};
use journal::{JOURNAL_BACKUP, JOURNAL_FILE, JOURNAL_TMP, JournalWriter, Lengths, Record, VALUE_COUNT};

/// Default budget for the download cache (200 MB).
pub const DEFAULT_DOWNLOAD_CACHE_SIZE: u64 = 200 * 1024 * 1024;

/// Default budget for the result cache (100 MB).
pub const DEFAULT_RESULT_CACHE_SIZE: u64 = 100 * 1024 * 1024;

/// Redundant journal records tolerated before the journal is rewritten.
const COMPACT_THRESHOLD: usize = 2000;

/// Chunk size for reads; liveness is checked between chunks.
const READ_CHUNK: usize = 64 * 1024;

const DATA_INDEX: usize = 0;
const METADATA_INDEX: usize = 1;

/// Hashes a cache key into its on-disk name.
#[must_use]
pub fn hash_key(key: &CacheKey) -> String {
    hex::encode(Sha256::digest(key.as_str().as_bytes()))
}

#[derive(Debug, Default, Clone, Copy)]
struct Handles {
    editing: bool,
    readers: usize,
}

struct State {
    entries: LruCache<String, Lengths>,
    size: u64,
    journal: Option<JournalWriter>,
    records: usize,
    #[cfg(test)]
    rebuilds: usize,
}

struct Inner {
    directory: PathBuf,
    app_version: u32,
    max_size: u64,
    state: Mutex<State>,
    handles: parking_lot::Mutex<HashMap<String, Handles>>,
    edit_locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Journaled LRU cache of byte blobs on disk.
///
/// Cheap to clone; clones share the same index and journal.
#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<Inner>,
}

impl DiskCache {
    /// Opens the cache in `directory`, replaying or rebuilding its journal.
    ///
    /// A missing or corrupt journal is rebuilt from the files present;
    /// unfinished edits are discarded along with their partial files.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or read.
    pub async fn open(
        directory: impl Into<PathBuf>,
        app_version: u32,
        max_size: u64,
    ) -> DiskCacheResult<Self> {
        let directory = directory.into();
        fs::create_dir_all(&directory).await?;
        journal::restore_backup(&directory).await?;

        let loaded = match fs::read_to_string(directory.join(JOURNAL_FILE)).await {
            Ok(contents) => match journal::replay(&contents, app_version) {
                Ok(replay) => Some(replay),
                Err(err) => {
                    warn!(dir = %directory.display(), error = %err, "Disk cache journal is corrupt, rebuilding");
                    None
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                warn!(dir = %directory.display(), "Disk cache journal is not text, rebuilding");
                None
            }
            Err(err) => return Err(err.into()),
        };

        let rebuilt = loaded.is_none();
        let (entries, records) = if let Some(replay) = loaded {
            let records = replay.records;
            let (entries, changed) = recover(&directory, replay).await?;
            if changed {
                write_journal(&directory, app_version, &entries, &[]).await?;
                (entries, 0)
            } else {
                (entries, records)
            }
        } else {
            let entries = rebuild(&directory).await?;
            write_journal(&directory, app_version, &entries, &[]).await?;
            (entries, 0)
        };

        let size = entries.iter().map(|(_, lengths)| total(lengths)).sum();
        let writer = JournalWriter::open(&directory).await?;
        info!(
            dir = %directory.display(),
            entries = entries.len(),
            size = size,
            rebuilt = rebuilt,
            "Opened disk cache"
        );

        let cache = Self {
            inner: Arc::new(Inner {
                directory,
                app_version,
                max_size,
                state: Mutex::new(State {
                    entries,
                    size,
                    journal: Some(writer),
                    records,
                    #[cfg(test)]
                    rebuilds: usize::from(rebuilt),
                }),
                handles: parking_lot::Mutex::new(HashMap::new()),
                edit_locks: parking_lot::Mutex::new(HashMap::new()),
            }),
        };

        {
            let mut state = cache.inner.state.lock().await;
            cache.inner.sweep(&mut state).await?;
        }
        Ok(cache)
    }

    /// Acquires the per-key edit lock.
    ///
    /// Writers hold it around `open_editor` so that concurrent edits of the
    /// same key wait for each other instead of failing; edits of different
    /// keys never contend.
    pub async fn edit_lock(&self, key: &CacheKey) -> OwnedMutexGuard<()> {
        let hash = hash_key(key);
        let lock = {
            let mut locks = self.inner.edit_locks.lock();
            if locks.len() > 64 {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            Arc::clone(locks.entry(hash).or_default())
        };
        lock.lock_owned().await
    }

    /// Starts an edit of `key`.
    ///
    /// Returns `Ok(None)` while another editor for `key` is open.
    ///
    /// # Errors
    /// Returns `Closed` after [`DiskCache::close`], or an I/O error if the
    /// journal cannot be written.
    pub async fn open_editor(&self, key: &CacheKey) -> DiskCacheResult<Option<Editor>> {
        let hash = hash_key(key);
        {
            let mut handles = self.inner.handles.lock();
            let handle = handles.entry(hash.clone()).or_default();
            if handle.editing {
                trace!(key = %key, "Editor already open");
                return Ok(None);
            }
            handle.editing = true;
        }

        let mut editor = Editor {
            cache: Arc::clone(&self.inner),
            key: key.clone(),
            hash: hash.clone(),
            written: [false; VALUE_COUNT],
            done: false,
        };

        let mut state = self.inner.state.lock().await;
        if let Err(err) = self.inner.append(&mut state, &Record::Dirty(hash), true).await {
            editor.done = true;
            return Err(err);
        }
        trace!(key = %key, "Opened editor");
        Ok(Some(editor))
    }

    /// Returns a snapshot of the committed entry for `key`.
    ///
    /// # Errors
    /// Returns `Closed` after [`DiskCache::close`], or an I/O error.
    pub async fn open_snapshot(&self, key: &CacheKey) -> DiskCacheResult<Option<Snapshot>> {
        let hash = hash_key(key);
        let mut state = self.inner.state.lock().await;
        if state.journal.is_none() {
            return Err(DiskCacheError::Closed);
        }
        let Some(lengths) = state.entries.get(&hash).copied() else {
            trace!(key = %key, "Disk cache miss");
            return Ok(None);
        };

        let snapshot = self.inner.snapshot_locked(&mut state, key, &hash, lengths).await?;
        if snapshot.is_some() {
            self.inner.append(&mut state, &Record::Read(hash), false).await?;
            self.inner.compact_if_needed(&mut state).await?;
            trace!(key = %key, "Disk cache hit");
        }
        Ok(snapshot)
    }

    /// Removes the entry for `key`.
    ///
    /// Returns false if there is no entry or it is being edited. Open
    /// snapshots stay readable.
    ///
    /// # Errors
    /// Returns `Closed` after [`DiskCache::close`], or an I/O error.
    pub async fn remove(&self, key: &CacheKey) -> DiskCacheResult<bool> {
        let hash = hash_key(key);
        let mut state = self.inner.state.lock().await;
        if state.journal.is_none() {
            return Err(DiskCacheError::Closed);
        }
        if !state.entries.contains(&hash) || self.inner.handle(&hash).editing {
            return Ok(false);
        }
        self.inner.remove_entry(&mut state, &hash).await?;
        self.inner.compact_if_needed(&mut state).await?;
        debug!(key = %key, "Removed from disk cache");
        Ok(true)
    }

    /// Removes every entry that is not being edited.
    ///
    /// # Errors
    /// Returns `Closed` after [`DiskCache::close`], or an I/O error.
    pub async fn clear(&self) -> DiskCacheResult<()> {
        let mut state = self.inner.state.lock().await;
        if state.journal.is_none() {
            return Err(DiskCacheError::Closed);
        }
        let hashes: Vec<String> = state.entries.iter().map(|(hash, _)| hash.clone()).collect();
        for hash in hashes {
            if !self.inner.handle(&hash).editing {
                self.inner.remove_entry(&mut state, &hash).await?;
            }
        }
        self.inner.compact(&mut state).await?;
        info!(dir = %self.inner.directory.display(), "Cleared disk cache");
        Ok(())
    }

    /// Flushes and closes the journal; later operations fail with `Closed`.
    ///
    /// # Errors
    /// Returns an I/O error if the final flush fails.
    pub async fn close(&self) -> DiskCacheResult<()> {
        let mut state = self.inner.state.lock().await;
        if let Some(writer) = state.journal.take() {
            writer.close().await?;
            debug!(dir = %self.inner.directory.display(), "Closed disk cache");
        }
        Ok(())
    }

    /// Sum of committed value sizes in bytes.
    pub async fn size(&self) -> u64 {
        self.inner.state.lock().await.size
    }

    /// Number of committed entries.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    /// Returns true if no entries are committed.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Configured budget in bytes.
    #[must_use]
    pub fn max_size(&self) -> u64 {
        self.inner.max_size
    }

    /// Root directory of the cache.
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    #[cfg(test)]
    async fn rebuilds(&self) -> usize {
        self.inner.state.lock().await.rebuilds
    }
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("directory", &self.inner.directory)
            .field("max_size", &self.inner.max_size)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn value_path(&self, hash: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{hash}.{index}"))
    }

    fn tmp_path(&self, hash: &str, index: usize) -> PathBuf {
        self.directory.join(format!("{hash}.{index}.tmp"))
    }

    fn handle(&self, hash: &str) -> Handles {
        self.handles.lock().get(hash).copied().unwrap_or_default()
    }

    fn update_handle(&self, hash: &str, update: impl FnOnce(&mut Handles)) {
        let mut handles = self.handles.lock();
        if let Some(handle) = handles.get_mut(hash) {
            update(handle);
            if !handle.editing && handle.readers == 0 {
                handles.remove(hash);
            }
        }
    }

    async fn append(&self, state: &mut State, record: &Record, durable: bool) -> DiskCacheResult<()> {
        let writer = state.journal.as_mut().ok_or(DiskCacheError::Closed)?;
        writer.append(record, durable).await?;
        state.records += 1;
        Ok(())
    }

    async fn snapshot_locked(
        self: &Arc<Self>,
        state: &mut State,
        key: &CacheKey,
        hash: &str,
        lengths: Lengths,
    ) -> DiskCacheResult<Option<Snapshot>> {
        let mut files: [Option<File>; VALUE_COUNT] = [None, None];
        for (index, slot) in files.iter_mut().enumerate() {
            if index == DATA_INDEX || lengths[index] > 0 {
                match File::open(self.value_path(hash, index)).await {
                    Ok(file) => *slot = Some(file),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        warn!(key = %key, "Disk cache file vanished, dropping entry");
                        self.remove_entry(state, hash).await?;
                        return Ok(None);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        self.handles
            .lock()
            .entry(hash.to_string())
            .or_default()
            .readers += 1;

        Ok(Some(Snapshot {
            cache: Arc::clone(self),
            key: key.clone(),
            hash: hash.to_string(),
            lengths,
            files,
        }))
    }

    async fn remove_entry(&self, state: &mut State, hash: &str) -> DiskCacheResult<()> {
        if let Some(lengths) = state.entries.pop(hash) {
            state.size = state.size.saturating_sub(total(&lengths));
        }
        for index in 0..VALUE_COUNT {
            journal::remove_if_exists(&self.value_path(hash, index)).await?;
        }
        self.append(state, &Record::Remove(hash.to_string()), false)
            .await
    }

    /// Evicts least recently used entries until within budget, skipping
    /// entries with an open editor or snapshot.
    async fn sweep(&self, state: &mut State) -> DiskCacheResult<()> {
        if state.size <= self.max_size {
            return Ok(());
        }
        let oldest_first: Vec<String> = state
            .entries
            .iter()
            .rev()
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in oldest_first {
            if state.size <= self.max_size {
                break;
            }
            let handle = self.handle(&hash);
            if handle.editing || handle.readers > 0 {
                trace!(hash = %hash, "Skipping busy entry during eviction");
                continue;
            }
            self.remove_entry(state, &hash).await?;
            debug!(hash = %hash, size = state.size, "Evicted from disk cache");
        }
        self.compact_if_needed(state).await
    }

    async fn compact_if_needed(&self, state: &mut State) -> DiskCacheResult<()> {
        let redundant = state.records.saturating_sub(state.entries.len());
        if redundant >= COMPACT_THRESHOLD && redundant >= state.entries.len() {
            self.compact(state).await?;
        }
        Ok(())
    }

    async fn compact(&self, state: &mut State) -> DiskCacheResult<()> {
        let Some(writer) = state.journal.take() else {
            return Err(DiskCacheError::Closed);
        };
        writer.close().await?;

        let editing: Vec<String> = self
            .handles
            .lock()
            .iter()
            .filter(|(_, handle)| handle.editing)
            .map(|(hash, _)| hash.clone())
            .collect();
        let result = write_journal(&self.directory, self.app_version, &state.entries, &editing).await;
        state.journal = Some(JournalWriter::open(&self.directory).await?);
        result?;
        state.records = state.entries.len() + editing.len();
        debug!(entries = state.entries.len(), "Compacted disk cache journal");
        Ok(())
    }

    async fn install(
        self: &Arc<Self>,
        state: &mut State,
        key: &CacheKey,
        hash: &str,
        written: [bool; VALUE_COUNT],
    ) -> DiskCacheResult<Option<Snapshot>> {
        if state.journal.is_none() {
            return Err(DiskCacheError::Closed);
        }
        for (index, _) in written.iter().enumerate().filter(|(_, w)| **w) {
            let file = OpenOptions::new()
                .write(true)
                .open(self.tmp_path(hash, index))
                .await?;
            file.sync_all().await?;
        }

        // From here on the previous files are gone; any failure drops the entry.
        let result = async {
            for index in 0..VALUE_COUNT {
                journal::remove_if_exists(&self.value_path(hash, index)).await?;
            }
            let mut lengths = [0; VALUE_COUNT];
            for index in (0..VALUE_COUNT).rev().filter(|i| written[*i]) {
                let target = self.value_path(hash, index);
                fs::rename(self.tmp_path(hash, index), &target).await?;
                lengths[index] = fs::metadata(&target).await?.len();
            }
            Ok::<_, io::Error>(lengths)
        }
        .await;

        let lengths = match result {
            Ok(lengths) => lengths,
            Err(err) => {
                if state.entries.contains(hash) {
                    self.remove_entry(state, hash).await?;
                }
                return Err(err.into());
            }
        };

        self.append(state, &Record::Clean(hash.to_string(), lengths), true)
            .await?;
        if let Some(previous) = state.entries.put(hash.to_string(), lengths) {
            state.size = state.size.saturating_sub(total(&previous));
        }
        state.size += total(&lengths);
        debug!(key = %key, size = total(&lengths), total = state.size, "Committed to disk cache");

        let snapshot = self.snapshot_locked(state, key, hash, lengths).await?;
        self.sweep(state).await?;
        Ok(snapshot)
    }
}

/// Write-intent handle for one key.
///
/// At most one editor per key is open at a time. Dropping an editor without
/// committing aborts it.
pub struct Editor {
    cache: Arc<Inner>,
    key: CacheKey,
    hash: String,
    written: [bool; VALUE_COUNT],
    done: bool,
}

impl Editor {
    /// Key being edited.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Opens a fresh sink for the data value.
    ///
    /// # Errors
    /// Returns an I/O error if the temporary file cannot be created.
    pub async fn data_sink(&mut self) -> DiskCacheResult<Sink> {
        self.sink(DATA_INDEX).await
    }

    /// Opens a fresh sink for the metadata sidecar.
    ///
    /// # Errors
    /// Returns an I/O error if the temporary file cannot be created.
    pub async fn metadata_sink(&mut self) -> DiskCacheResult<Sink> {
        self.sink(METADATA_INDEX).await
    }

    async fn sink(&mut self, index: usize) -> DiskCacheResult<Sink> {
        let file = File::create(self.cache.tmp_path(&self.hash, index)).await?;
        self.written[index] = true;
        Ok(Sink { file, written: 0 })
    }

    /// Publishes the written values, replacing any previous entry.
    ///
    /// Returns a snapshot of the new entry, or `None` if its files
    /// disappeared before they could be opened.
    ///
    /// # Errors
    /// Returns `MissingData` if no data value was written, or an I/O error.
    /// In both cases the edit is aborted.
    pub async fn commit(mut self) -> DiskCacheResult<Option<Snapshot>> {
        if !self.written[DATA_INDEX] {
            self.discard().await;
            return Err(DiskCacheError::MissingData {
                key: self.key.to_string(),
            });
        }

        let cache = Arc::clone(&self.cache);
        let mut state = cache.state.lock().await;
        let result = cache
            .install(&mut state, &self.key, &self.hash, self.written)
            .await;
        drop(state);

        if result.is_err() {
            self.discard().await;
        } else {
            self.done = true;
        }
        result
    }

    /// Discards the written values. The previous entry, if any, is untouched.
    pub async fn abort(mut self) {
        self.discard().await;
        trace!(key = %self.key, "Aborted editor");
    }

    async fn discard(&mut self) {
        for index in 0..VALUE_COUNT {
            if let Err(err) = journal::remove_if_exists(&self.cache.tmp_path(&self.hash, index)).await {
                warn!(key = %self.key, error = %err, "Failed to remove partial write");
            }
        }
        self.done = true;
    }
}

impl Drop for Editor {
    /// Partial writes are removed on the runtime when one is available. The
    /// key stays locked for editing until they are gone.
    fn drop(&mut self) {
        let paths: Vec<PathBuf> = if self.done {
            Vec::new()
        } else {
            debug!(key = %self.key, "Editor dropped without commit");
            (0..VALUE_COUNT)
                .filter(|&index| self.written[index])
                .map(|index| self.cache.tmp_path(&self.hash, index))
                .collect()
        };
        if paths.is_empty() {
            self.cache.update_handle(&self.hash, |handle| handle.editing = false);
            return;
        }

        let cache = Arc::clone(&self.cache);
        let hash = self.hash.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                for path in &paths {
                    if let Err(err) = journal::remove_if_exists(path).await {
                        warn!(path = %path.display(), error = %err, "Failed to remove partial write");
                    }
                }
                cache.update_handle(&hash, |handle| handle.editing = false);
            });
        } else {
            for path in &paths {
                let _ = std::fs::remove_file(path);
            }
            cache.update_handle(&hash, |handle| handle.editing = false);
        }
    }
}

impl std::fmt::Debug for Editor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Editor").field("key", &self.key).finish_non_exhaustive()
    }
}

/// Writable stream into one value of an [`Editor`].
///
/// Call [`Sink::finish`] before committing.
#[derive(Debug)]
pub struct Sink {
    file: File,
    written: u64,
}

impl Sink {
    /// Appends `bytes`.
    ///
    /// # Errors
    /// Returns an I/O error if the write fails.
    pub async fn write_all(&mut self, bytes: &[u8]) -> DiskCacheResult<()> {
        self.file.write_all(bytes).await?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.written
    }

    /// Flushes the sink and returns the number of bytes written.
    ///
    /// # Errors
    /// Returns an I/O error if the flush fails.
    pub async fn finish(mut self) -> DiskCacheResult<u64> {
        self.file.flush().await?;
        Ok(self.written)
    }
}

/// Read handle over a committed entry.
///
/// Holds the entry's files open: a later commit or removal of the same key
/// does not affect what this snapshot reads.
pub struct Snapshot {
    cache: Arc<Inner>,
    key: CacheKey,
    hash: String,
    lengths: Lengths,
    files: [Option<File>; VALUE_COUNT],
}

impl Snapshot {
    /// Key of the entry.
    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Size of the data value in bytes.
    #[must_use]
    pub const fn data_len(&self) -> u64 {
        self.lengths[DATA_INDEX]
    }

    /// Returns true if the entry has a metadata sidecar.
    #[must_use]
    pub const fn has_metadata(&self) -> bool {
        self.lengths[METADATA_INDEX] > 0
    }

    /// Reads the data value, checking `liveness` between chunks.
    ///
    /// # Errors
    /// Returns `Cancelled` once `liveness` is cancelled, or an I/O error.
    pub async fn read_data(&mut self, liveness: &Liveness) -> DiskCacheResult<Bytes> {
        self.read_value(DATA_INDEX, liveness).await
    }

    /// Reads the metadata sidecar, if the entry has one.
    ///
    /// # Errors
    /// Returns an I/O error.
    pub async fn read_metadata(&mut self) -> DiskCacheResult<Option<Bytes>> {
        if !self.has_metadata() {
            return Ok(None);
        }
        self.read_value(METADATA_INDEX, &Liveness::new())
            .await
            .map(Some)
    }

    async fn read_value(&mut self, index: usize, liveness: &Liveness) -> DiskCacheResult<Bytes> {
        let capacity = usize::try_from(self.lengths[index]).unwrap_or(0);
        let Some(file) = self.files[index].as_mut() else {
            return Err(DiskCacheError::MissingData {
                key: self.key.to_string(),
            });
        };
        file.rewind().await?;

        let mut buffer = BytesMut::with_capacity(capacity);
        let mut chunk = vec![0; READ_CHUNK];
        loop {
            if liveness.is_cancelled() {
                return Err(DiskCacheError::Cancelled);
            }
            let read = file.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
        }
        Ok(buffer.freeze())
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.cache
            .update_handle(&self.hash, |handle| handle.readers = handle.readers.saturating_sub(1));
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("key", &self.key)
            .field("lengths", &self.lengths)
            .finish_non_exhaustive()
    }
}

fn total(lengths: &Lengths) -> u64 {
    lengths.iter().sum()
}

async fn write_journal(
    directory: &Path,
    app_version: u32,
    entries: &LruCache<String, Lengths>,
    editing: &[String],
) -> io::Result<()> {
    let mut records: Vec<Record> = entries
        .iter()
        .rev()
        .map(|(hash, lengths)| Record::Clean(hash.clone(), *lengths))
        .collect();
    records.extend(editing.iter().cloned().map(Record::Dirty));
    journal::rewrite(directory, app_version, &records).await
}

/// Discards unfinished edits and entries whose files do not match the
/// journal. Returns the surviving index and whether anything was dropped.
async fn recover(
    directory: &Path,
    replay: journal::Replay,
) -> DiskCacheResult<(LruCache<String, Lengths>, bool)> {
    let journal::Replay {
        mut entries,
        pending,
        truncated,
        ..
    } = replay;

    for hash in &pending {
        for index in 0..VALUE_COUNT {
            journal::remove_if_exists(&directory.join(format!("{hash}.{index}.tmp"))).await?;
        }
        debug!(hash = %hash, "Discarded unfinished edit");
    }

    let mut invalid = Vec::new();
    for (hash, lengths) in entries.iter() {
        for (index, expected) in lengths.iter().enumerate() {
            let path = directory.join(format!("{hash}.{index}"));
            let valid = match fs::metadata(&path).await {
                Ok(meta) => meta.len() == *expected,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    index != DATA_INDEX && *expected == 0
                }
                Err(err) => return Err(err.into()),
            };
            if !valid {
                invalid.push(hash.clone());
                break;
            }
        }
    }

    for hash in &invalid {
        warn!(hash = %hash, "Disk cache entry does not match journal, dropping");
        entries.pop(hash);
        for index in 0..VALUE_COUNT {
            journal::remove_if_exists(&directory.join(format!("{hash}.{index}"))).await?;
        }
    }

    Ok((entries, truncated || !pending.is_empty() || !invalid.is_empty()))
}

/// Rebuilds the index from the files in `directory`.
///
/// Temporary and unrecognized files are deleted. Entries are ordered by
/// data file modification time, ties broken by name.
async fn rebuild(directory: &Path) -> DiskCacheResult<LruCache<String, Lengths>> {
    let mut found: HashMap<String, (Lengths, bool, SystemTime)> = HashMap::new();
    let mut strays = Vec::new();

    let mut dir = fs::read_dir(directory).await?;
    while let Some(entry) = dir.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if matches!(name.as_str(), JOURNAL_FILE | JOURNAL_TMP | JOURNAL_BACKUP) {
            continue;
        }

        let parsed = name.split_once('.').and_then(|(hash, suffix)| {
            let index = match suffix {
                "0" => DATA_INDEX,
                "1" => METADATA_INDEX,
                _ => return None,
            };
            journal::is_valid_hash(hash).then(|| (hash.to_string(), index))
        });
        let Some((hash, index)) = parsed else {
            strays.push(entry.path());
            continue;
        };

        let slot = found
            .entry(hash)
            .or_insert(([0; VALUE_COUNT], false, SystemTime::UNIX_EPOCH));
        slot.0[index] = meta.len();
        if index == DATA_INDEX {
            slot.1 = true;
            slot.2 = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        }
    }

    for path in strays {
        debug!(path = %path.display(), "Removing unrecognized cache file");
        journal::remove_if_exists(&path).await?;
    }

    let mut valid = Vec::new();
    for (hash, (lengths, has_data, modified)) in found {
        if has_data {
            valid.push((modified, hash, lengths));
        } else {
            journal::remove_if_exists(&directory.join(format!("{hash}.{METADATA_INDEX}"))).await?;
        }
    }
    valid.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    let mut entries = LruCache::unbounded();
    for (_, hash, lengths) in valid {
        entries.put(hash, lengths);
    }
    info!(dir = %directory.display(), entries = entries.len(), "Rebuilt disk cache index");
    Ok(entries)
}
