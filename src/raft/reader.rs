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

use std::sync::Arc;

use super::{IndexedEntry, RaftJournal};

/// Which part of the journal a reader may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Only entries at or below the commit index.
    Committed,
    /// Everything written locally, including entries a later leader may truncate.
    Uncommitted,
}

/// Cursor over a member's journal. Each reader keeps its own position; readers do not
/// affect each other or the writer.
#[derive(Debug)]
pub struct RaftLogReader {
    journal: Arc<RaftJournal>,
    mode: ReadMode,
    next_index: u64,
}

impl RaftLogReader {
    pub fn new(journal: Arc<RaftJournal>, mode: ReadMode) -> Self {
        let next_index = journal.first_index();
        Self {
            journal,
            mode,
            next_index,
        }
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// Highest index this reader may currently return.
    fn upper_bound(&self) -> u64 {
        match self.mode {
            ReadMode::Committed => self.journal.commit_index(),
            ReadMode::Uncommitted => self.journal.last_index(),
        }
    }

    /// Index of the entry `next()` returns.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Moves the cursor so the next entry read is `index`, or the first entry when
    /// `index` lies before it. Returns the index the cursor points at.
    pub fn seek(&mut self, index: u64) -> u64 {
        self.next_index = index.max(self.journal.first_index());
        self.next_index
    }

    /// Moves the cursor onto the first application entry reaching `position`.
    pub fn seek_to_position(&mut self, position: i64) -> u64 {
        let index = self.journal.first_index_reaching(position);
        self.seek(index)
    }

    pub fn seek_to_first(&mut self) -> u64 {
        self.next_index = self.journal.first_index();
        self.next_index
    }

    /// Positions the cursor on the last readable entry, or on the first index while
    /// nothing is readable.
    pub fn seek_to_last(&mut self) -> u64 {
        self.next_index = self.upper_bound().max(self.journal.first_index());
        self.next_index
    }

    pub fn has_next(&self) -> bool {
        self.next_index <= self.upper_bound()
    }

    /// Returns the entry under the cursor and advances, or `None` once the readable
    /// end is reached. A later call may succeed again after more entries arrive.
    pub fn next_entry(&mut self) -> Option<Arc<IndexedEntry>> {
        if !self.has_next() {
            return None;
        }
        let entry = self.journal.entry(self.next_index)?;
        self.next_index += 1;
        Some(entry)
    }
}

impl Iterator for RaftLogReader {
    type Item = Arc<IndexedEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry()
    }
}
