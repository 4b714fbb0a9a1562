//! The replicated log.
//!
//! An append-only ordered sequence of entries with truncation from a given
//! index and compaction through a snapshot. Indices start at 1 and are
//! dense; appends always land at `last_index() + 1`.
//!
//! # Invariants
//!
//! 1. Indices are monotonically increasing without gaps
//! 2. Two entries with identical `(index, term)` carry identical payloads
//! 3. Truncation is only invoked by followers resolving conflicts above the
//!    commit index
//!
//! # Compaction
//!
//! Compacting through index `i` replaces the prefix `..=i` with a snapshot;
//! afterwards `first_index()` is `i + 1`. The logical index of an entry never
//! changes; implementations map logical indices onto their physical storage
//! with an offset (`logical = physical + offset`).

use std::collections::VecDeque;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::LogError;
use crate::{LogIndex, Term};

/// A single record in the replicated log. Immutable once durable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log, starting at 1.
    pub index: LogIndex,
    /// The leader's term when the entry was created.
    pub term: Term,
    /// Opaque command payload.
    pub payload: Bytes,
}

impl LogEntry {
    /// Creates a new entry.
    pub fn new(index: LogIndex, term: Term, payload: Bytes) -> Self {
        Self {
            index,
            term,
            payload,
        }
    }
}

/// Opaque state-machine snapshot covering the log through `(index, term)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The last log index included in the snapshot.
    pub last_included_index: LogIndex,
    /// The term of the last included entry.
    pub last_included_term: Term,
    /// Serialized state machine contents.
    pub data: Bytes,
}

impl Snapshot {
    /// Creates a new snapshot.
    pub fn new(last_included_index: LogIndex, last_included_term: Term, data: Bytes) -> Self {
        Self {
            last_included_index,
            last_included_term,
            data,
        }
    }
}

/// Storage backend for a resource's log.
///
/// The log is owned by its resource's execution context and is never touched
/// from any other; implementations take `&mut self` and need no internal
/// locking.
pub trait Log: Send {
    /// Opens the log, replaying any durable state.
    fn open(&mut self) -> Result<(), LogError>;

    /// Closes the log, flushing pending writes.
    fn close(&mut self) -> Result<(), LogError>;

    /// Appends a new entry at `last_index() + 1`, returning its index.
    fn append(&mut self, term: Term, payload: Bytes) -> Result<LogIndex, LogError>;

    /// Appends an entry replicated from the leader. The entry's index must
    /// be exactly `last_index() + 1`.
    fn append_entry(&mut self, entry: LogEntry) -> Result<(), LogError>;

    /// Returns the entry at the given index, if present and not compacted.
    fn get(&self, index: LogIndex) -> Option<LogEntry>;

    /// True if the log holds an entry at the given index.
    fn contains_entry(&self, index: LogIndex) -> bool {
        self.get(index).is_some()
    }

    /// Returns entries in `[start, end)`.
    fn entries(&self, start: LogIndex, end: LogIndex) -> Result<Vec<LogEntry>, LogError>;

    /// Removes entries `from_index..=last_index()`.
    fn truncate(&mut self, from_index: LogIndex) -> Result<(), LogError>;

    /// Index of the first available entry. `snapshot_index + 1` after
    /// compaction, 1 otherwise.
    fn first_index(&self) -> LogIndex;

    /// Index of the last entry, or the snapshot index when empty.
    fn last_index(&self) -> LogIndex;

    /// Term of the last entry, or the snapshot term when empty.
    fn last_term(&self) -> Term;

    /// Term of the entry at the given index. Index 0 has term 0; the
    /// snapshot boundary answers the snapshot term.
    fn term_at(&self, index: LogIndex) -> Option<Term>;

    /// Replaces the prefix `..=through_index` with the given snapshot. When
    /// `through_index` is beyond `last_index()` (a snapshot install on a
    /// lagging node), the whole log is discarded.
    fn compact(&mut self, through_index: LogIndex, snapshot: &Snapshot) -> Result<(), LogError>;

    /// The current snapshot, if any.
    fn snapshot(&self) -> Option<Snapshot>;
}

/// Compares a candidate's log position against a local one.
///
/// A candidate is at least as up-to-date when its `(last_term, last_index)`
/// is lexicographically greater than or equal to the local pair.
pub fn is_up_to_date(
    candidate_last_index: LogIndex,
    candidate_last_term: Term,
    local_last_index: LogIndex,
    local_last_term: Term,
) -> bool {
    if candidate_last_term != local_last_term {
        candidate_last_term > local_last_term
    } else {
        candidate_last_index >= local_last_index
    }
}

/// In-memory log.
///
/// A `VecDeque` of entries plus an offset tracking the compaction point.
#[derive(Debug, Default)]
pub struct MemoryLog {
    entries: VecDeque<LogEntry>,
    offset: LogIndex,
    snapshot: Option<Snapshot>,
    open: bool,
}

impl MemoryLog {
    /// Creates a new empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn physical(&self, index: LogIndex) -> Option<usize> {
        if index <= self.offset {
            return None;
        }
        Some((index - self.offset - 1) as usize)
    }

    fn check_open(&self) -> Result<(), LogError> {
        if self.open {
            Ok(())
        } else {
            Err(LogError::Closed)
        }
    }
}

impl Log for MemoryLog {
    fn open(&mut self) -> Result<(), LogError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), LogError> {
        self.open = false;
        Ok(())
    }

    fn append(&mut self, term: Term, payload: Bytes) -> Result<LogIndex, LogError> {
        self.check_open()?;
        let index = self.last_index() + 1;
        self.entries.push_back(LogEntry::new(index, term, payload));
        Ok(index)
    }

    fn append_entry(&mut self, entry: LogEntry) -> Result<(), LogError> {
        self.check_open()?;
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(LogError::Corrupted(format!(
                "log gap: expected index {}, got {}",
                expected, entry.index
            )));
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
        self.check_open()?;
        if from_index <= self.offset && self.offset > 0 {
            return Err(LogError::Compacted(self.first_index()));
        }
        if let Some(physical) = self.physical(from_index) {
            if physical < self.entries.len() {
                self.entries.truncate(physical);
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
        self.check_open()?;
        if through_index <= self.offset {
            // Already compacted past this point.
            return Ok(());
        }
        if through_index >= self.last_index() {
            self.entries.clear();
        } else {
            let keep = self.physical(through_index + 1).unwrap_or(0);
            self.entries.drain(..keep.min(self.entries.len()));
        }
        self.offset = through_index;
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn snapshot(&self) -> Option<Snapshot> {
        self.snapshot.clone()
    }
}
