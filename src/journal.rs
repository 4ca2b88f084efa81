//! Durable progress log
//!
//! Every state change is appended to an append-only JSON-lines stream before
//! the mutating call returns. Streams are periodically folded into snapshot
//! files so startup and status queries do not replay an ever-growing log.
//!
//! ## Layout
//!
//! ```text
//! logs_dir/
//! ├── LOCK                  # present while a writer runs
//! └── index/
//!     ├── apps.json         # snapshot: { last_seq, compacted_at, data }
//!     ├── apps.jsonl        # records appended since that snapshot
//!     ├── variants.json(l)
//!     ├── images.json(l)
//!     ├── runs.json(l)
//!     └── errors.json(l)
//! ```
//!
//! ## Records
//!
//! Each line is one self-contained [`LogRecord`]: a sequence number that is
//! global across streams and strictly increasing, a timestamp, the event and
//! a checksum over sequence number plus canonical event JSON. A line that
//! does not parse or whose checksum does not match (a torn tail after a
//! crash, for instance) is skipped with a warning.
//!
//! ## Compaction
//!
//! [`StreamWriter::compact`] writes the full state of a stream to its
//! snapshot (temp file + rename), stamps it with the current sequence
//! number, then truncates the stream. If the process dies between the two
//! steps the leftover records carry sequence numbers at or below the stamp
//! and are ignored on replay.

use crate::error::{Result, WalkError};
use crate::types::{ErrorEntry, ProgressRecord, RunEntry, Scope};
use crate::utils::{atomic_write, hash_data, host_name};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Snapshot format version
const SNAPSHOT_VERSION: u32 = 1;

/// Number of hex characters kept from the SHA-256 checksum
const CHECKSUM_LEN: usize = 16;

/// Logical event streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    /// App progress records
    Apps,
    /// Variant progress records
    Variants,
    /// Image progress records
    Images,
    /// Run history
    Runs,
    /// Error history
    Errors,
}

impl Stream {
    /// All streams in load order
    pub const ALL: [Stream; 5] = [
        Stream::Apps,
        Stream::Variants,
        Stream::Images,
        Stream::Runs,
        Stream::Errors,
    ];

    /// File stem of the stream
    pub fn name(self) -> &'static str {
        match self {
            Stream::Apps => "apps",
            Stream::Variants => "variants",
            Stream::Images => "images",
            Stream::Runs => "runs",
            Stream::Errors => "errors",
        }
    }

    /// Stream holding records of a scope
    pub fn for_scope(scope: Scope) -> Self {
        match scope {
            Scope::App => Stream::Apps,
            Scope::Variant => Stream::Variants,
            Scope::Image => Stream::Images,
        }
    }

    fn index(self) -> usize {
        match self {
            Stream::Apps => 0,
            Stream::Variants => 1,
            Stream::Images => 2,
            Stream::Runs => 3,
            Stream::Errors => 4,
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A state change carried by one log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalEvent {
    /// New value of a progress record
    Progress {
        /// Fully qualified key
        key: String,
        /// Record after the mutation
        record: ProgressRecord,
    },
    /// Run history entry
    Run(RunEntry),
    /// Error history entry
    Error(ErrorEntry),
}

/// One line of an append stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Global sequence number
    pub seq: u64,
    /// Append time
    pub ts: DateTime<Utc>,
    /// Truncated SHA-256 of `seq` and the canonical event JSON
    pub checksum: String,
    /// The event, kept as raw JSON until the checksum is verified
    pub event: serde_json::Value,
}

impl LogRecord {
    fn checksum_of(seq: u64, event: &serde_json::Value) -> String {
        let mut digest = hash_data(format!("{}:{}", seq, event).as_bytes());
        digest.truncate(CHECKSUM_LEN);
        digest
    }

    fn new(seq: u64, event: &JournalEvent) -> Result<Self> {
        let event = serde_json::to_value(event)?;
        Ok(Self {
            seq,
            ts: Utc::now(),
            checksum: Self::checksum_of(seq, &event),
            event,
        })
    }

    fn verify(&self) -> bool {
        Self::checksum_of(self.seq, &self.event) == self.checksum
    }
}

/// Compacted state of one stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot<T> {
    /// Format version
    pub version: u32,
    /// Highest sequence number folded into `data`
    pub last_seq: u64,
    /// When the snapshot was written
    pub compacted_at: DateTime<Utc>,
    /// Stream state
    pub data: T,
}

/// Outcome of replaying one append stream
#[derive(Debug, Default)]
pub struct Replay {
    /// Verified events above the snapshot's sequence number, in file order
    pub events: Vec<JournalEvent>,
    /// Lines skipped because they were torn or corrupt
    pub skipped_lines: usize,
}

/// Append-only event streams plus their snapshots
pub struct DurableLog {
    index_dir: PathBuf,
    seq: AtomicU64,
    writers: [Mutex<File>; 5],
    sync_writes: bool,
}

impl fmt::Debug for DurableLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableLog")
            .field("index_dir", &self.index_dir)
            .field("seq", &self.seq.load(Ordering::SeqCst))
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl DurableLog {
    /// Open (creating if needed) the streams under `logs_dir/index`
    ///
    /// The sequence counter starts at zero; [`load_snapshot`](Self::load_snapshot)
    /// and [`replay`](Self::replay) raise it past everything already on disk,
    /// so every stream must be loaded before the first append.
    pub fn open(logs_dir: &Path, sync_writes: bool) -> Result<Self> {
        let index_dir = index_dir(logs_dir);
        fs::create_dir_all(&index_dir)?;

        let open = |stream: Stream| -> Result<Mutex<File>> {
            let path = log_path(&index_dir, stream);
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)?;
            if ends_torn(&mut file)? {
                warn!("Terminating torn tail of {:?}", path);
                file.write_all(b"\n")?;
                file.sync_data()?;
            }
            Ok(Mutex::new(file))
        };

        let writers = [
            open(Stream::Apps)?,
            open(Stream::Variants)?,
            open(Stream::Images)?,
            open(Stream::Runs)?,
            open(Stream::Errors)?,
        ];

        debug!("Opened durable log at {:?}", index_dir);
        Ok(Self {
            index_dir,
            seq: AtomicU64::new(0),
            writers,
            sync_writes,
        })
    }

    /// Directory holding snapshots and streams
    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    /// Highest sequence number handed out or observed
    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    fn observe_seq(&self, seq: u64) {
        self.seq.fetch_max(seq, Ordering::SeqCst);
    }

    /// Load the snapshot of a stream, if one exists
    pub fn load_snapshot<T: DeserializeOwned>(&self, stream: Stream) -> Result<Option<Snapshot<T>>> {
        let snapshot = read_snapshot::<T>(&self.index_dir, stream)?;
        if let Some(s) = &snapshot {
            self.observe_seq(s.last_seq);
        }
        Ok(snapshot)
    }

    /// Replay the append stream, keeping events above `after_seq`
    pub fn replay(&self, stream: Stream, after_seq: u64) -> Result<Replay> {
        let path = log_path(&self.index_dir, stream);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(e.into()),
        };

        let mut replay = Replay::default();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let record = match serde_json::from_str::<LogRecord>(&line) {
                Ok(r) if r.verify() => r,
                Ok(_) => {
                    warn!("Skipping {} line {}: checksum mismatch", stream, line_no + 1);
                    replay.skipped_lines += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Skipping {} line {}: {}", stream, line_no + 1, e);
                    replay.skipped_lines += 1;
                    continue;
                }
            };

            self.observe_seq(record.seq);
            if record.seq <= after_seq {
                continue;
            }
            match serde_json::from_value::<JournalEvent>(record.event) {
                Ok(event) => replay.events.push(event),
                Err(e) => {
                    warn!("Skipping {} line {}: unknown event: {}", stream, line_no + 1, e);
                    replay.skipped_lines += 1;
                }
            }
        }

        debug!(
            "Replayed {} events from {} ({} skipped)",
            replay.events.len(),
            stream,
            replay.skipped_lines
        );
        Ok(replay)
    }

    /// Lock one stream for appending or compaction
    ///
    /// Holding the writer while updating in-memory state keeps appends and
    /// compaction of that stream from interleaving.
    pub fn writer(&self, stream: Stream) -> StreamWriter<'_> {
        StreamWriter {
            log: self,
            stream,
            file: self.writers[stream.index()].lock(),
        }
    }
}

/// Exclusive access to one stream
pub struct StreamWriter<'a> {
    log: &'a DurableLog,
    stream: Stream,
    file: MutexGuard<'a, File>,
}

impl StreamWriter<'_> {
    /// Append one event and flush it
    ///
    /// Returns the sequence number assigned to the record.
    pub fn append(&mut self, event: &JournalEvent) -> Result<u64> {
        let seq = self.log.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = LogRecord::new(seq, event)?;

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.flush()?;
        if self.log.sync_writes {
            self.file.sync_data()?;
        }

        trace!("Appended seq {} to {}", seq, self.stream);
        Ok(seq)
    }

    /// Replace the snapshot with `data` and truncate the stream
    pub fn compact<T: Serialize>(&mut self, data: &T) -> Result<u64> {
        let last_seq = self.log.current_seq();
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            last_seq,
            compacted_at: Utc::now(),
            data,
        };

        let json = serde_json::to_vec_pretty(&snapshot)?;
        atomic_write(&snapshot_path(&self.log.index_dir, self.stream), &json)?;

        self.file.set_len(0)?;
        self.file.sync_all()?;

        debug!("Compacted {} at seq {}", self.stream, last_seq);
        Ok(last_seq)
    }
}

/// `logs_dir/index`
pub fn index_dir(logs_dir: &Path) -> PathBuf {
    logs_dir.join("index")
}

fn snapshot_path(index_dir: &Path, stream: Stream) -> PathBuf {
    index_dir.join(format!("{}.json", stream.name()))
}

/// Whether the stream ends in a partial line left by a crash mid-append
fn ends_torn(file: &mut File) -> Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn log_path(index_dir: &Path, stream: Stream) -> PathBuf {
    index_dir.join(format!("{}.jsonl", stream.name()))
}

/// Read a snapshot without opening the streams
///
/// Used by read-only tooling; never touches the append logs.
pub fn read_snapshot<T: DeserializeOwned>(index_dir: &Path, stream: Stream) -> Result<Option<Snapshot<T>>> {
    let path = snapshot_path(index_dir, stream);
    let bytes = match fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let snapshot: Snapshot<T> = serde_json::from_slice(&bytes)
        .map_err(|e| WalkError::journal(format!("corrupt snapshot {:?}: {}", path, e)))?;
    if snapshot.version > SNAPSHOT_VERSION {
        return Err(WalkError::journal(format!(
            "snapshot {:?} has unsupported version {}",
            path, snapshot.version
        )));
    }
    Ok(Some(snapshot))
}

/// Advisory single-writer lock on a logs directory
///
/// The `LOCK` file is created with create-new semantics and removed when the
/// guard is dropped.
#[derive(Debug)]
pub struct LogLock {
    path: PathBuf,
    released: bool,
}

impl LogLock {
    /// Acquire the lock, optionally removing a stale one first
    ///
    /// # Errors
    ///
    /// - [`WalkError::LogDirLocked`] if another writer holds the directory
    /// - [`WalkError::Io`] if the lock file cannot be created
    pub fn acquire(logs_dir: &Path, force: bool) -> Result<Self> {
        fs::create_dir_all(logs_dir)?;
        let path = logs_dir.join("LOCK");

        if force && path.exists() {
            warn!("Removing existing lock {:?}", path);
            fs::remove_file(&path)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown holder".to_string());
                return Err(WalkError::LogDirLocked { path, holder });
            }
            Err(e) => return Err(e.into()),
        };

        writeln!(
            file,
            "pid={} host={} started={}",
            std::process::id(),
            host_name(),
            Utc::now().to_rfc3339()
        )?;
        file.sync_all()?;

        debug!("Acquired log lock {:?}", path);
        Ok(Self {
            path,
            released: false,
        })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lock file now
    pub fn release(mut self) -> Result<()> {
        self.remove()
    }

    fn remove(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Released log lock {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LogLock {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!("Failed to release log lock {:?}: {}", self.path, e);
        }
    }
}
