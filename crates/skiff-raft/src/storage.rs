//! Durable storage: file-backed log, metadata, and snapshots.
//!
//! # Layouts (little-endian)
//!
//! Log entries, appended to `<name>.log`:
//! ```text
//! +----------+---------+--------+--------------+
//! | index(8) | term(8) | len(4) | payload(len) |
//! +----------+---------+--------+--------------+
//! ```
//!
//! Metadata, `<name>.meta`, atomically replaced on every vote/term change:
//! ```text
//! +---------+------------------+----------------+--------+
//! | term(8) | voted_for_len(4) | voted_for(len) | crc(4) |
//! +---------+------------------+----------------+--------+
//! ```
//!
//! Snapshots, `<name>.snapshot`:
//! ```text
//! +------------------+-----------------+--------+-----------+
//! | last_index(8)    | last_term(8)    | len(4) | blob(len) |
//! +------------------+-----------------+--------+-----------+
//! ```
//!
//! Metadata and snapshots are written to a temp file, synced, and renamed
//! into place; the directory is synced after the rename.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::error::LogError;
use crate::log::{Log, LogEntry, Snapshot};
use crate::member::Uri;
use crate::{LogIndex, Term};

const ENTRY_HEADER_SIZE: usize = 8 + 8 + 4;
const SNAPSHOT_HEADER_SIZE: usize = 8 + 8 + 4;

/// Durable store for a resource's persistent metadata (current term and
/// vote).
#[derive(Debug)]
pub struct MetaStore {
    path: PathBuf,
    current_term: Term,
    voted_for: Option<Uri>,
}

impl MetaStore {
    /// Opens the metadata store, loading existing state if present.
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self, LogError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.meta", name));

        let mut store = Self {
            path,
            current_term: 0,
            voted_for: None,
        };
        if store.path.exists() {
            store.load()?;
        }
        Ok(store)
    }

    /// The persisted term.
    pub fn current_term(&self) -> Term {
        self.current_term
    }

    /// The persisted vote, if any.
    pub fn voted_for(&self) -> Option<&Uri> {
        self.voted_for.as_ref()
    }

    /// Persists the term and vote. Durable before returning.
    pub fn save(&mut self, term: Term, voted_for: Option<&str>) -> Result<(), LogError> {
        let uri = voted_for.unwrap_or("");
        let mut buf = BytesMut::with_capacity(8 + 4 + uri.len() + 4);
        buf.put_u64_le(term);
        buf.put_u32_le(uri.len() as u32);
        buf.put_slice(uri.as_bytes());
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);

        write_atomic(&self.path, &buf)?;

        self.current_term = term;
        self.voted_for = voted_for.map(|s| s.to_string());
        Ok(())
    }

    fn load(&mut self) -> Result<(), LogError> {
        let data = fs::read(&self.path)?;
        if data.len() < 8 + 4 + 4 {
            return Err(LogError::Corrupted("metadata file too short".into()));
        }

        let body = &data[..data.len() - 4];
        let stored_crc = u32::from_le_bytes(data[data.len() - 4..].try_into().unwrap());
        if crc32fast::hash(body) != stored_crc {
            return Err(LogError::Corrupted("metadata checksum mismatch".into()));
        }

        let mut cursor = body;
        let term = cursor.get_u64_le();
        let len = cursor.get_u32_le() as usize;
        if cursor.remaining() != len {
            return Err(LogError::Corrupted("metadata length mismatch".into()));
        }
        let uri = std::str::from_utf8(cursor)
            .map_err(|_| LogError::Corrupted("metadata vote is not utf-8".into()))?;

        self.current_term = term;
        self.voted_for = if uri.is_empty() {
            None
        } else {
            Some(uri.to_string())
        };
        Ok(())
    }
}

/// File-backed log.
///
/// Entries live in an append-only file and are cached in memory; the file is
/// replayed on open and rewritten (via atomic rename) on truncation and
/// compaction.
#[derive(Debug)]
pub struct FileLog {
    dir: PathBuf,
    name: String,
    entries: VecDeque<LogEntry>,
    offset: LogIndex,
    snapshot: Option<Snapshot>,
    file: Option<File>,
    sync_writes: bool,
}

impl FileLog {
    /// Creates a file log in the given directory. Nothing is read until
    /// [`Log::open`].
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            entries: VecDeque::new(),
            offset: 0,
            snapshot: None,
            file: None,
            sync_writes: true,
        }
    }

    /// Disables fsync on append. Only suitable for tests.
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.name))
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(format!("{}.snapshot", self.name))
    }

    fn physical(&self, index: LogIndex) -> Option<usize> {
        if index <= self.offset {
            return None;
        }
        Some((index - self.offset - 1) as usize)
    }

    fn file_mut(&mut self) -> Result<&mut File, LogError> {
        self.file.as_mut().ok_or(LogError::Closed)
    }

    fn write_entry(file: &mut File, entry: &LogEntry) -> Result<(), LogError> {
        let mut buf = BytesMut::with_capacity(ENTRY_HEADER_SIZE + entry.payload.len());
        buf.put_u64_le(entry.index);
        buf.put_u64_le(entry.term);
        buf.put_u32_le(entry.payload.len() as u32);
        buf.put_slice(&entry.payload);
        file.write_all(&buf)?;
        Ok(())
    }

    fn read_entry(file: &mut File) -> Result<Option<LogEntry>, LogError> {
        let mut header = [0u8; ENTRY_HEADER_SIZE];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let mut cursor = &header[..];
        let index = cursor.get_u64_le();
        let term = cursor.get_u64_le();
        let len = cursor.get_u32_le() as usize;

        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;

        Ok(Some(LogEntry::new(index, term, Bytes::from(payload))))
    }

    fn replay(&mut self) -> Result<(), LogError> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(());
        }
        let mut file = File::open(&path)?;
        while let Some(entry) = Self::read_entry(&mut file)? {
            if entry.index > self.offset {
                self.entries.push_back(entry);
            }
        }
        Ok(())
    }

    fn load_snapshot(&mut self) -> Result<(), LogError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(());
        }
        let data = fs::read(&path)?;
        if data.len() < SNAPSHOT_HEADER_SIZE {
            return Err(LogError::Corrupted("snapshot file too short".into()));
        }
        let mut cursor = &data[..];
        let last_included_index = cursor.get_u64_le();
        let last_included_term = cursor.get_u64_le();
        let len = cursor.get_u32_le() as usize;
        if cursor.remaining() < len {
            return Err(LogError::Corrupted("snapshot blob truncated".into()));
        }
        let blob = Bytes::copy_from_slice(&cursor[..len]);

        self.offset = last_included_index;
        self.snapshot = Some(Snapshot::new(last_included_index, last_included_term, blob));
        Ok(())
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), LogError> {
        let mut buf = BytesMut::with_capacity(SNAPSHOT_HEADER_SIZE + snapshot.data.len());
        buf.put_u64_le(snapshot.last_included_index);
        buf.put_u64_le(snapshot.last_included_term);
        buf.put_u32_le(snapshot.data.len() as u32);
        buf.put_slice(&snapshot.data);
        write_atomic(&self.snapshot_path(), &buf)
    }

    fn rewrite(&mut self) -> Result<(), LogError> {
        let path = self.log_path();
        let tmp = path.with_extension("log.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            for entry in &self.entries {
                Self::write_entry(&mut file, entry)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        self.file = Some(OpenOptions::new().append(true).open(&path)?);
        Ok(())
    }
}

impl Log for FileLog {
    fn open(&mut self) -> Result<(), LogError> {
        fs::create_dir_all(&self.dir)?;
        self.load_snapshot()?;
        self.replay()?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        self.file = Some(file);
        debug!(
            name = %self.name,
            first = self.first_index(),
            last = self.last_index(),
            "log opened"
        );
        Ok(())
    }

    fn close(&mut self) -> Result<(), LogError> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn append(&mut self, term: Term, payload: Bytes) -> Result<LogIndex, LogError> {
        let index = self.last_index() + 1;
        self.append_entry(LogEntry::new(index, term, payload))?;
        Ok(index)
    }

    fn append_entry(&mut self, entry: LogEntry) -> Result<(), LogError> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(LogError::Corrupted(format!(
                "log gap: expected index {}, got {}",
                expected, entry.index
            )));
        }
        let sync = self.sync_writes;
        let file = self.file_mut()?;
        Self::write_entry(file, &entry)?;
        if sync {
            file.sync_all()?;
        }
        self.entries.push_back(entry);
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Option<LogEntry> {
        self.entries.get(self.physical(index)?).cloned()
    }

    fn entries(&self, start: LogIndex, end: LogIndex) -> Result<Vec<LogEntry>, LogError> {
        if start >= end {
            return Ok(Vec::new());
        }
        if start < self.first_index() && self.offset > 0 {
            return Err(LogError::Compacted(self.first_index()));
        }
        let mut result = Vec::with_capacity((end - start) as usize);
        for index in start..end {
            match self.get(index) {
                Some(entry) => result.push(entry),
                None => break,
            }
        }
        Ok(result)
    }

    fn truncate(&mut self, from_index: LogIndex) -> Result<(), LogError> {
        if self.file.is_none() {
            return Err(LogError::Closed);
        }
        if from_index <= self.offset && self.offset > 0 {
            return Err(LogError::Compacted(self.first_index()));
        }
        if let Some(physical) = self.physical(from_index) {
            if physical < self.entries.len() {
                self.entries.truncate(physical);
                self.rewrite()?;
            }
        }
        Ok(())
    }

    fn first_index(&self) -> LogIndex {
        self.offset + 1
    }

    fn last_index(&self) -> LogIndex {
        self.entries.back().map(|e| e.index).unwrap_or(self.offset)
    }

    fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .or_else(|| self.snapshot.as_ref().map(|s| s.last_included_term))
            .unwrap_or(0)
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.offset {
            if let Some(snapshot) = &self.snapshot {
                if snapshot.last_included_index == index {
                    return Some(snapshot.last_included_term);
                }
            }
            return None;
        }
        self.entries.get(self.physical(index)?).map(|e| e.term)
    }

    fn compact(&mut self, through_index: LogIndex, snapshot: &Snapshot) -> Result<(), LogError> {
        if self.file.is_none() {
            return Err(LogError::Closed);
        }
        if through_index <= self.offset {
            return Ok(());
        }

        self.save_snapshot(snapshot)?;

        if through_index >= self.last_index() {
            self.entries.clear();
        } else {
            let keep = self.physical(through_index + 1).unwrap_or(0);
            self.entries.drain(..keep.min(self.entries.len()));
        }
        self.offset = through_index;
        self.snapshot = Some(snapshot.clone());
        self.rewrite()?;

        debug!(
            name = %self.name,
            through = through_index,
            "log compacted"
        );
        Ok(())
    }

    fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot.clone()
    }
}

/// Writes `data` to `path` via a temp file, fsync, and atomic rename, then
/// syncs the parent directory.
fn write_atomic(path: &Path, data: &[u8]) -> Result<(), LogError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
