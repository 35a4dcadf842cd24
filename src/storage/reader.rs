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

use crate::raft::{IndexedEntry, RaftLogReader};

use super::{LogBlock, LogStorageReader};

/// Presents the application entries of a raft reader as [`LogBlock`]s. Initial and
/// configuration entries are skipped.
#[derive(Debug)]
pub struct RaftLogStorageReader {
    reader: Option<RaftLogReader>,
    peeked: Option<LogBlock>,
}

fn to_block(indexed: &IndexedEntry) -> Option<LogBlock> {
    indexed.application_entry().map(|entry| LogBlock {
        index: indexed.index(),
        lowest_position: entry.lowest_position,
        highest_position: entry.highest_position,
        data: entry.data.clone(),
    })
}

impl RaftLogStorageReader {
    pub fn new(reader: RaftLogReader) -> Self {
        Self {
            reader: Some(reader),
            peeked: None,
        }
    }

    fn fill_peeked(&mut self) {
        let Some(reader) = self.reader.as_mut() else {
            return;
        };
        while self.peeked.is_none() {
            match reader.next_entry() {
                Some(indexed) => self.peeked = to_block(&indexed),
                None => break,
            }
        }
    }
}

impl Iterator for RaftLogStorageReader {
    type Item = LogBlock;

    fn next(&mut self) -> Option<LogBlock> {
        self.fill_peeked();
        self.peeked.take()
    }
}

impl LogStorageReader for RaftLogStorageReader {
    fn seek(&mut self, position: i64) {
        self.peeked = None;
        if let Some(reader) = self.reader.as_mut() {
            reader.seek_to_position(position);
        }
    }

    fn seek_to_first(&mut self) {
        self.peeked = None;
        if let Some(reader) = self.reader.as_mut() {
            reader.seek_to_first();
        }
    }

    fn seek_to_last(&mut self) {
        self.peeked = None;
        let Some(reader) = self.reader.as_mut() else {
            return;
        };
        let first = reader.seek_to_first();
        let last = reader.seek_to_last();
        for index in (first..=last).rev() {
            reader.seek(index);
            if let Some(block) = reader.next_entry().as_deref().and_then(to_block) {
                self.peeked = Some(block);
                return;
            }
        }
        reader.seek_to_first();
    }

    fn has_next(&mut self) -> bool {
        self.fill_peeked();
        self.peeked.is_some()
    }

    fn close(&mut self) {
        self.reader = None;
        self.peeked = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use rstest::{fixture, rstest};

    use super::*;
    use crate::raft::{ApplicationEntry, RaftEntry, RaftJournal, ReadMode};
    use crate::AppResult;

    /// Journal laid out as
    /// `1: initial, 2: [1,3], 3: initial, 4: [4,4], 5: [5,9]` with index 4 committed.
    #[fixture]
    fn journal() -> Arc<RaftJournal> {
        let journal = Arc::new(RaftJournal::in_memory());
        let entries = [
            RaftEntry::Initial,
            RaftEntry::Application(ApplicationEntry::new(1, 3, Bytes::from_static(b"a"))),
            RaftEntry::Initial,
            RaftEntry::Application(ApplicationEntry::new(4, 4, Bytes::from_static(b"b"))),
            RaftEntry::Application(ApplicationEntry::new(5, 9, Bytes::from_static(b"c"))),
        ];
        for entry in entries {
            journal.append(1, entry).unwrap();
        }
        journal.set_commit_index(4);
        journal
    }

    fn positions(reader: &mut RaftLogStorageReader) -> Vec<(i64, i64)> {
        reader
            .map(|b| (b.lowest_position, b.highest_position))
            .collect()
    }

    #[rstest]
    fn test_reader_skips_non_application_entries(journal: Arc<RaftJournal>) {
        let mut committed =
            RaftLogStorageReader::new(RaftLogReader::new(journal.clone(), ReadMode::Committed));
        assert_eq!(positions(&mut committed), vec![(1, 3), (4, 4)]);

        let mut uncommitted =
            RaftLogStorageReader::new(RaftLogReader::new(journal, ReadMode::Uncommitted));
        assert_eq!(positions(&mut uncommitted), vec![(1, 3), (4, 4), (5, 9)]);
    }

    #[rstest]
    #[case::inside_first_block(2, Some(2))]
    #[case::before_everything(-5, Some(2))]
    #[case::exact_single_block(4, Some(4))]
    #[case::uncommitted_only(6, None)]
    fn test_seek_position(
        journal: Arc<RaftJournal>,
        #[case] position: i64,
        #[case] expected_index: Option<u64>,
    ) {
        let mut reader =
            RaftLogStorageReader::new(RaftLogReader::new(journal, ReadMode::Committed));
        reader.seek(position);
        assert_eq!(reader.next().map(|b| b.index), expected_index);
    }

    #[rstest]
    fn test_seek_beyond_commit_waits_for_that_block(journal: Arc<RaftJournal>) {
        let mut reader =
            RaftLogStorageReader::new(RaftLogReader::new(journal.clone(), ReadMode::Committed));
        reader.seek(6);
        assert!(!reader.has_next());
        journal.set_commit_index(5);
        assert_eq!(reader.next().map(|b| b.index), Some(5));

        reader.seek(10);
        assert!(!reader.has_next());
    }

    #[rstest]
    fn test_seek_to_last_and_resume(journal: Arc<RaftJournal>) -> AppResult<()> {
        let mut reader =
            RaftLogStorageReader::new(RaftLogReader::new(journal.clone(), ReadMode::Committed));
        reader.seek_to_last();
        assert_eq!(reader.next().map(|b| b.index), Some(4));
        assert!(!reader.has_next());

        journal.set_commit_index(5);
        assert!(reader.has_next());
        assert_eq!(reader.next().map(|b| b.highest_position), Some(9));

        reader.seek_to_first();
        assert_eq!(reader.next().map(|b| b.index), Some(2));
        Ok(())
    }

    #[test]
    fn test_seek_to_last_without_blocks() -> AppResult<()> {
        let journal = Arc::new(RaftJournal::in_memory());
        journal.append(1, RaftEntry::Initial)?;
        journal.set_commit_index(1);
        let mut reader =
            RaftLogStorageReader::new(RaftLogReader::new(journal.clone(), ReadMode::Committed));
        reader.seek_to_last();
        assert!(!reader.has_next());

        journal.append(
            1,
            RaftEntry::Application(ApplicationEntry::new(1, 1, Bytes::new())),
        )?;
        journal.set_commit_index(2);
        assert_eq!(reader.next().map(|b| b.index), Some(2));
        Ok(())
    }

    #[rstest]
    fn test_closed_reader_is_exhausted(journal: Arc<RaftJournal>) {
        let mut reader =
            RaftLogStorageReader::new(RaftLogReader::new(journal, ReadMode::Uncommitted));
        assert!(reader.has_next());
        reader.close();
        assert!(!reader.has_next());
        reader.seek_to_first();
        assert!(reader.next().is_none());
    }
}
