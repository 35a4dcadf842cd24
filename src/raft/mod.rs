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

//! Replication layer underneath the log storage.
//!
//! This module provides:
//! - The entry model and its checksummed framing
//! - A durable journal (segment file + meta store) per member
//! - A leader actor that validates, writes, replicates and commits entries
//! - In-process followers acknowledging what they stored
//! - Raft level readers, append listeners and commit listeners

mod entry;
mod follower;
mod journal;
mod meta_store;
mod partition;
mod reader;
mod segment;
mod server;

pub use entry::{ApplicationEntry, ConfigurationEntry, IndexedEntry, MemberId, RaftEntry};
pub use journal::RaftJournal;
pub use meta_store::{MetaStore, RaftMeta};
pub use partition::RaftPartition;
pub use reader::{RaftLogReader, ReadMode};
pub use segment::SegmentFile;

use bytes::Bytes;
use std::sync::Arc;

use crate::{AppError, AppResult};

/// Role of the local member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
    Inactive,
}

impl Role {
    fn from_u8(value: u8) -> Role {
        match value {
            0 => Role::Leader,
            1 => Role::Follower,
            _ => Role::Inactive,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Role::Leader => 0,
            Role::Follower => 1,
            Role::Inactive => 2,
        }
    }
}

/// Callbacks for one append, invoked on the replication actor.
///
/// `on_write` fires once the entry is in the local journal, `on_commit` once a quorum
/// stored it. A rejected append only ever sees `on_write_error`.
pub trait RaftAppendListener: Send + Sync {
    fn on_write(&self, indexed: &IndexedEntry);

    fn on_write_error(&self, error: AppError);

    fn on_commit(&self, index: u64, highest_position: i64);

    fn on_commit_error(&self, index: u64, error: AppError);
}

/// Notified with the new commit index every time it advances.
pub trait RaftCommitListener: Send + Sync {
    fn on_commit(&self, index: u64);
}

/// Accepts application entries on the leader.
pub trait LogAppender: Send + Sync {
    /// Queues the entry for the replication actor and returns immediately.
    ///
    /// # Errors
    ///
    /// Fails synchronously when the request cannot be handed to the actor at all
    /// (actor gone, command channel full). Everything decided by the actor is reported
    /// through `listener`.
    fn append_entry(
        &self,
        lowest_position: i64,
        highest_position: i64,
        data: Bytes,
        listener: Arc<dyn RaftAppendListener>,
    ) -> AppResult<()>;
}

/// Opens independent readers over the local journal.
pub trait RaftLogReaderFactory: Send + Sync {
    fn open_reader(&self, mode: ReadMode) -> RaftLogReader;
}

/// Registry of raft commit listeners.
pub trait CommitNotifier: Send + Sync {
    fn add_commit_listener(&self, listener: Arc<dyn RaftCommitListener>);

    fn remove_commit_listener(&self, listener: &Arc<dyn RaftCommitListener>);
}
