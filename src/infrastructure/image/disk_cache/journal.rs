//! Line-based journal backing the disk cache index.
//!
//! ```text
//! pixflow.disk-cache
//! 1
//! <app version>
//! 2
//!
//! DIRTY 3400330d1dfc7f3f7f4b8d4d803dfcf6...
//! CLEAN 3400330d1dfc7f3f7f4b8d4d803dfcf6... 832 21
//! READ 3400330d1dfc7f3f7f4b8d4d803dfcf6...
//! REMOVE 3400330d1dfc7f3f7f4b8d4d803dfcf6...
//! ```
//!
//! The header guards against journals written by another format or app
//! version. Each record line names the hashed key. `CLEAN` carries one size
//! per stored value (the metadata size is omitted when there is none).

use std::collections::HashSet;
use std::io;
use std::path::Path;

use lru::LruCache;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::error::{DiskCacheError, DiskCacheResult};

/// Journal file name.
pub const JOURNAL_FILE: &str = "journal";
/// Journal being rewritten.
pub const JOURNAL_TMP: &str = "journal.tmp";
/// Previous journal kept while a rewrite is swapped in.
pub const JOURNAL_BACKUP: &str = "journal.bkp";

const MAGIC: &str = "pixflow.disk-cache";
const FORMAT_VERSION: &str = "1";
const HEADER_LINES: usize = 5;

/// Values stored per entry: data and metadata sidecar.
pub const VALUE_COUNT: usize = 2;

/// Byte sizes of an entry's values; a zero metadata size means no sidecar.
pub type Lengths = [u64; VALUE_COUNT];

/// One journal line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// An edit was started.
    Dirty(String),
    /// An edit was committed with the given value sizes.
    Clean(String, Lengths),
    /// An entry was read.
    Read(String),
    /// An entry was removed.
    Remove(String),
}

impl Record {
    /// Formats the record as a journal line, newline included.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Dirty(hash) => format!("DIRTY {hash}\n"),
            Self::Clean(hash, [data, 0]) => format!("CLEAN {hash} {data}\n"),
            Self::Clean(hash, [data, meta]) => format!("CLEAN {hash} {data} {meta}\n"),
            Self::Read(hash) => format!("READ {hash}\n"),
            Self::Remove(hash) => format!("REMOVE {hash}\n"),
        }
    }

    fn parse(line: &str, line_no: usize) -> DiskCacheResult<Self> {
        let mut parts = line.split(' ');
        let op = parts.next().unwrap_or_default();
        let hash = parts
            .next()
            .filter(|hash| is_valid_hash(hash))
            .ok_or_else(|| DiskCacheError::corrupt(line_no, "missing or malformed key"))?
            .to_string();
        let sizes: Vec<&str> = parts.collect();

        let record = match op {
            "DIRTY" => Self::Dirty(hash),
            "READ" => Self::Read(hash),
            "REMOVE" => Self::Remove(hash),
            "CLEAN" => {
                if sizes.is_empty() || sizes.len() > VALUE_COUNT {
                    return Err(DiskCacheError::corrupt(line_no, "wrong number of sizes"));
                }
                let mut lengths = [0; VALUE_COUNT];
                for (slot, size) in lengths.iter_mut().zip(&sizes) {
                    *slot = size
                        .parse()
                        .map_err(|_| DiskCacheError::corrupt(line_no, "invalid size"))?;
                }
                return Ok(Self::Clean(hash, lengths));
            }
            other => {
                return Err(DiskCacheError::corrupt(
                    line_no,
                    format!("unknown record {other:?}"),
                ));
            }
        };
        if sizes.is_empty() {
            Ok(record)
        } else {
            Err(DiskCacheError::corrupt(line_no, "unexpected trailing fields"))
        }
    }
}

/// Returns true for a lowercase hex SHA-256 digest.
#[must_use]
pub fn is_valid_hash(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Index reconstructed from a journal.
#[derive(Debug)]
pub struct Replay {
    /// Committed entries, least recently used last when iterated.
    pub entries: LruCache<String, Lengths>,
    /// Keys whose last edit never completed.
    pub pending: HashSet<String>,
    /// Number of record lines read.
    pub records: usize,
    /// The final line was cut off mid-write.
    pub truncated: bool,
}

/// Formats the journal header.
#[must_use]
pub fn header(app_version: u32) -> String {
    format!("{MAGIC}\n{FORMAT_VERSION}\n{app_version}\n{VALUE_COUNT}\n\n")
}

/// Replays `contents` into an index.
///
/// # Errors
/// Returns `CorruptJournal` if the header does not match or a complete line
/// cannot be parsed. A trailing line without a newline is treated as an
/// interrupted append and ignored.
pub fn replay(contents: &str, app_version: u32) -> DiskCacheResult<Replay> {
    let mut lines: Vec<&str> = contents.split('\n').collect();
    // split leaves an empty tail after the final newline; anything else there
    // is a partially written record.
    let tail = lines.pop().unwrap_or_default();
    let truncated = !tail.is_empty();

    let expected = [
        MAGIC.to_string(),
        FORMAT_VERSION.to_string(),
        app_version.to_string(),
        VALUE_COUNT.to_string(),
        String::new(),
    ];
    for (index, want) in expected.iter().enumerate() {
        match lines.get(index) {
            Some(line) if line == want => {}
            Some(line) => {
                return Err(DiskCacheError::corrupt(
                    index + 1,
                    format!("unexpected header {line:?}"),
                ));
            }
            None => return Err(DiskCacheError::corrupt(index + 1, "truncated header")),
        }
    }

    let mut entries = LruCache::unbounded();
    let mut pending = HashSet::new();
    let mut records = 0;

    for (offset, line) in lines.iter().enumerate().skip(HEADER_LINES) {
        match Record::parse(line, offset + 1)? {
            Record::Dirty(hash) => {
                pending.insert(hash);
            }
            Record::Clean(hash, lengths) => {
                pending.remove(&hash);
                entries.put(hash, lengths);
            }
            Record::Read(hash) => {
                entries.promote(&hash);
            }
            Record::Remove(hash) => {
                pending.remove(&hash);
                entries.pop(&hash);
            }
        }
        records += 1;
    }

    Ok(Replay {
        entries,
        pending,
        records,
        truncated,
    })
}

/// Append handle on the live journal.
#[derive(Debug)]
pub struct JournalWriter {
    file: File,
}

impl JournalWriter {
    /// Opens the journal in `directory` for appending.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened.
    pub async fn open(directory: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(directory.join(JOURNAL_FILE))
            .await?;
        Ok(Self { file })
    }

    /// Appends `record`; `durable` additionally syncs it to storage.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub async fn append(&mut self, record: &Record, durable: bool) -> io::Result<()> {
        self.file.write_all(record.encode().as_bytes()).await?;
        self.file.flush().await?;
        if durable {
            self.file.sync_data().await?;
        }
        Ok(())
    }

    /// Flushes pending writes.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    pub async fn close(mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await
    }
}

/// Replaces the journal with `records` under a fresh header.
///
/// Writes `journal.tmp`, moves the old journal aside to `journal.bkp`, swaps
/// the new one in and drops the backup.
///
/// # Errors
/// Returns an error if any step fails; the old journal or its backup is
/// left in place.
pub async fn rewrite(directory: &Path, app_version: u32, records: &[Record]) -> io::Result<()> {
    let tmp = directory.join(JOURNAL_TMP);
    let live = directory.join(JOURNAL_FILE);
    let backup = directory.join(JOURNAL_BACKUP);

    let mut contents = header(app_version);
    for record in records {
        contents.push_str(&record.encode());
    }

    let mut file = File::create(&tmp).await?;
    file.write_all(contents.as_bytes()).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if fs::try_exists(&live).await? {
        fs::rename(&live, &backup).await?;
    }
    fs::rename(&tmp, &live).await?;
    remove_if_exists(&backup).await
}

/// Recovers from a rewrite interrupted between moving the old journal
/// aside and swapping the new one in.
///
/// # Errors
/// Returns an error if the backup cannot be restored or removed.
pub async fn restore_backup(directory: &Path) -> io::Result<()> {
    let live = directory.join(JOURNAL_FILE);
    let backup = directory.join(JOURNAL_BACKUP);
    if !fs::try_exists(&backup).await? {
        return Ok(());
    }
    if fs::try_exists(&live).await? {
        fs::remove_file(&backup).await
    } else {
        fs::rename(&backup, &live).await
    }
}

/// Removes `path`, ignoring a missing file.
///
/// # Errors
/// Returns any other I/O error.
pub async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
