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

//! Log storage seen by stream processors.
//!
//! A [`LogStorage`] accepts position-ranged blocks, hands out committed and
//! uncommitted readers, and fans commit and write signals out to registered
//! listeners. [`RaftLogStorage`] is the implementation on top of a replicated
//! partition.

mod append_adapter;
mod raft_storage;
mod reader;
mod record;
mod tailer;

pub use raft_storage::RaftLogStorage;
pub use reader::RaftLogStorageReader;
pub use record::{encode_batch, LoggedRecord, RecordIter};
pub use tailer::LogTailer;

use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::{AppError, AppResult};

/// One application entry as stored in the log: the positions it covers and its
/// record batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBlock {
    pub index: u64,
    pub lowest_position: i64,
    pub highest_position: i64,
    pub data: Bytes,
}

impl LogBlock {
    pub fn records(&self) -> RecordIter {
        RecordIter::new(self.data.clone())
    }
}

/// Outcome callbacks of a single append.
///
/// `highest_position` is `-1` when the entry at `index` is not an application entry.
pub trait AppendListener: Send + Sync {
    fn on_write(&self, index: u64, highest_position: i64);

    fn on_commit(&self, index: u64, highest_position: i64);

    fn on_write_error(&self, error: AppError) {
        warn!("append failed before it was written: {}", error);
    }

    fn on_commit_error(&self, index: u64, error: AppError) {
        warn!("entry {} will not be committed: {}", index, error);
    }
}

/// Signalled whenever new entries became committed. Carries no payload; listeners
/// read the new data through a committed reader.
pub trait CommitListener: Send + Sync {
    fn on_commit(&self);
}

/// Signalled once per entry written to the local journal through this storage.
pub trait WriteListener: Send + Sync {
    fn on_write(&self, index: u64, highest_position: i64);
}

pub trait LogStorage: Send + Sync {
    /// Reader that only sees committed blocks.
    fn new_reader(&self) -> Box<dyn LogStorageReader>;

    /// Reader that also sees blocks written locally but not yet committed. Used
    /// during recovery, never for regular consumption.
    fn new_uncommitted_reader(&self) -> Box<dyn LogStorageReader>;

    /// Hands a block covering `[lowest_position, highest_position]` to the leader.
    ///
    /// # Errors
    ///
    /// Returns an error when the request is refused before reaching the replication
    /// layer (storage closed, inverted bounds, replication actor unreachable). Any later
    /// outcome is delivered to `listener`.
    fn append(
        &self,
        lowest_position: i64,
        highest_position: i64,
        payload: Bytes,
        listener: Arc<dyn AppendListener>,
    ) -> AppResult<()>;

    fn add_commit_listener(&self, listener: Arc<dyn CommitListener>);

    fn remove_commit_listener(&self, listener: &Arc<dyn CommitListener>);

    fn add_write_listener(&self, listener: Arc<dyn WriteListener>);

    fn remove_write_listener(&self, listener: &Arc<dyn WriteListener>);
}

/// Cursor over the blocks of a [`LogStorage`]. Iteration yields blocks in position
/// order; an exhausted reader yields more once new blocks become visible.
pub trait LogStorageReader: Iterator<Item = LogBlock> + Send {
    /// Positions the reader on the block containing `position`, or on the first block
    /// after it. Seeking past the end leaves the reader exhausted.
    fn seek(&mut self, position: i64);

    fn seek_to_first(&mut self);

    /// Positions the reader on the last visible block.
    fn seek_to_last(&mut self);

    fn has_next(&mut self) -> bool;

    /// Releases the underlying journal reader. A closed reader stays exhausted.
    fn close(&mut self);
}
