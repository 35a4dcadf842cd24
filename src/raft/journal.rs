// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The replicated journal of one member.
//!
//! Entries are indexed from 1 without gaps. Reads go through an in-memory view
//! guarded by a read-write lock, writes are additionally framed into the segment
//! file when the journal is persistent. The journal has a single writer (the
//! replication actor of the member) and any number of concurrent readers.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::{AppError, AppResult};

use super::segment::SegmentFile;
use super::{ApplicationEntry, IndexedEntry, RaftEntry};

#[derive(Debug)]
pub struct RaftJournal {
    entries: RwLock<Vec<Arc<IndexedEntry>>>,
    commit_index: AtomicU64,
    segment: Option<Mutex<SegmentFile>>,
    flush_on_write: bool,
}

impl RaftJournal {
    pub const FIRST_INDEX: u64 = 1;

    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            commit_index: AtomicU64::new(0),
            segment: None,
            flush_on_write: false,
        }
    }

    /// Opens the journal backed by the segment at `path`, loading what survived the
    /// last run. The commit index starts at 0, the caller restores it from the meta
    /// store.
    pub fn open<P: AsRef<Path>>(path: P, flush_on_write: bool) -> AppResult<Self> {
        let (segment, loaded) = SegmentFile::open(path)?;
        if let Some(first) = loaded.first() {
            if first.index() != Self::FIRST_INDEX {
                return Err(AppError::CorruptEntry(format!(
                    "segment {} starts at index {}",
                    segment.path().display(),
                    first.index()
                )));
            }
        }
        debug!(
            "journal {} recovered {} entries",
            segment.path().display(),
            loaded.len()
        );
        Ok(Self {
            entries: RwLock::new(loaded.into_iter().map(Arc::new).collect()),
            commit_index: AtomicU64::new(0),
            segment: Some(Mutex::new(segment)),
            flush_on_write,
        })
    }

    pub fn first_index(&self) -> u64 {
        Self::FIRST_INDEX
    }

    /// Index of the last entry, 0 while the journal is empty.
    pub fn last_index(&self) -> u64 {
        self.entries.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn entry(&self, index: u64) -> Option<Arc<IndexedEntry>> {
        if index < Self::FIRST_INDEX {
            return None;
        }
        self.entries
            .read()
            .get((index - Self::FIRST_INDEX) as usize)
            .cloned()
    }

    pub fn last_entry(&self) -> Option<Arc<IndexedEntry>> {
        self.entries.read().last().cloned()
    }

    /// Appends `entry` under the next free index.
    pub fn append(&self, term: u64, entry: RaftEntry) -> AppResult<Arc<IndexedEntry>> {
        let index = self.last_index() + 1;
        let indexed = Arc::new(IndexedEntry::new(index, term, entry));
        self.append_indexed(Arc::clone(&indexed))?;
        Ok(indexed)
    }

    /// Appends an entry that already carries its index, as followers do with entries
    /// shipped by the leader.
    pub fn append_indexed(&self, indexed: Arc<IndexedEntry>) -> AppResult<()> {
        let expected = self.last_index() + 1;
        if indexed.index() != expected {
            return Err(AppError::IllegalStateError(format!(
                "expected to append index {} but got {}",
                expected,
                indexed.index()
            )));
        }
        if let Some(segment) = &self.segment {
            let mut segment = segment.lock();
            segment.append(&indexed.encode())?;
            if self.flush_on_write {
                segment.flush()?;
            }
        }
        trace!("journal appended index {} term {}", indexed.index(), indexed.term());
        self.entries.write().push(indexed);
        Ok(())
    }

    pub fn flush(&self) -> AppResult<()> {
        if let Some(segment) = &self.segment {
            segment.lock().flush()?;
        }
        Ok(())
    }

    /// Drops every entry after `index`. Committed entries can never be dropped.
    pub fn truncate_after(&self, index: u64) -> AppResult<()> {
        if index < self.commit_index() {
            return Err(AppError::IllegalStateError(format!(
                "cannot truncate after {} below commit index {}",
                index,
                self.commit_index()
            )));
        }
        let keep = index.saturating_sub(Self::FIRST_INDEX - 1) as usize;
        if let Some(segment) = &self.segment {
            segment.lock().truncate(keep)?;
        }
        let mut entries = self.entries.write();
        if keep < entries.len() {
            debug!("journal truncated {} entries after index {}", entries.len() - keep, index);
            entries.truncate(keep);
        }
        Ok(())
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::Acquire)
    }

    /// Moves the commit index forward, capped at the last index. Returns the commit
    /// index in effect afterwards; it never moves backwards.
    pub fn set_commit_index(&self, index: u64) -> u64 {
        let capped = index.min(self.last_index());
        let previous = self.commit_index.fetch_max(capped, Ordering::AcqRel);
        previous.max(capped)
    }

    /// Index of the first application entry whose highest position is at least
    /// `position`, or the index after the last entry when no entry reaches it.
    ///
    /// Application positions grow with the index, so this is a binary search. A probe
    /// landing on an initial or configuration entry looks back to the closest
    /// application entry before it.
    pub fn first_index_reaching(&self, position: i64) -> u64 {
        let entries = self.entries.read();
        let before = |slot: usize| {
            entries[..=slot]
                .iter()
                .rev()
                .find_map(|entry| entry.application_entry())
                .map_or(true, |entry| entry.highest_position < position)
        };
        let (mut low, mut high) = (0, entries.len());
        while low < high {
            let mid = low + (high - low) / 2;
            if before(mid) {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low as u64 + Self::FIRST_INDEX
    }

    /// The last application entry at or below `index`, found by walking backwards.
    pub fn last_application_entry(&self, index: u64) -> Option<ApplicationEntry> {
        let entries = self.entries.read();
        let upper = (index as usize).min(entries.len());
        entries[..upper]
            .iter()
            .rev()
            .find_map(|entry| entry.application_entry().cloned())
    }
}
