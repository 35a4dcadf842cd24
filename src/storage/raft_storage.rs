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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::raft::{
    CommitNotifier, LogAppender, RaftCommitListener, RaftLogReaderFactory, RaftPartition,
    ReadMode,
};
use crate::utils::ListenerSet;
use crate::{AppError, AppResult};

use super::append_adapter::{AppendListenerAdapter, CommitBroadcast};
use super::{
    AppendListener, CommitListener, LogStorage, LogStorageReader, RaftLogStorageReader,
    WriteListener,
};

/// [`LogStorage`] backed by the replication layer.
///
/// The three raft collaborators are injected separately so tests can drive appends
/// and commits by hand.
pub struct RaftLogStorage {
    reader_factory: Arc<dyn RaftLogReaderFactory>,
    appender: Arc<dyn LogAppender>,
    commit_notifier: Arc<dyn CommitNotifier>,
    commit_broadcast: Arc<dyn RaftCommitListener>,
    commit_listeners: Arc<ListenerSet<dyn CommitListener>>,
    write_listeners: Arc<ListenerSet<dyn WriteListener>>,
    closed: AtomicBool,
}

impl RaftLogStorage {
    pub fn new(
        reader_factory: Arc<dyn RaftLogReaderFactory>,
        appender: Arc<dyn LogAppender>,
        commit_notifier: Arc<dyn CommitNotifier>,
    ) -> Self {
        let commit_listeners: Arc<ListenerSet<dyn CommitListener>> =
            Arc::new(ListenerSet::new());
        let commit_broadcast: Arc<dyn RaftCommitListener> =
            Arc::new(CommitBroadcast::new(Arc::clone(&commit_listeners)));
        commit_notifier.add_commit_listener(Arc::clone(&commit_broadcast));
        Self {
            reader_factory,
            appender,
            commit_notifier,
            commit_broadcast,
            commit_listeners,
            write_listeners: Arc::new(ListenerSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn of_partition(partition: Arc<RaftPartition>) -> Self {
        debug!(
            "opening log storage on partition {}",
            partition.partition_id()
        );
        Self::new(partition.clone(), partition.clone(), partition)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Detaches from the raft commit notifications and drops all listeners. Appends
    /// fail afterwards; readers opened earlier keep working.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.commit_notifier
            .remove_commit_listener(&self.commit_broadcast);
        self.commit_listeners.clear();
        self.write_listeners.clear();
    }
}

impl LogStorage for RaftLogStorage {
    fn new_reader(&self) -> Box<dyn LogStorageReader> {
        Box::new(RaftLogStorageReader::new(
            self.reader_factory.open_reader(ReadMode::Committed),
        ))
    }

    fn new_uncommitted_reader(&self) -> Box<dyn LogStorageReader> {
        Box::new(RaftLogStorageReader::new(
            self.reader_factory.open_reader(ReadMode::Uncommitted),
        ))
    }

    fn append(
        &self,
        lowest_position: i64,
        highest_position: i64,
        payload: Bytes,
        listener: Arc<dyn AppendListener>,
    ) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::Closed("log storage is closed".to_string()));
        }
        if lowest_position > highest_position {
            return Err(AppError::InvalidValue(format!(
                "lowest position {} is above highest position {}",
                lowest_position, highest_position
            )));
        }
        let adapter = AppendListenerAdapter::new(listener, Arc::clone(&self.write_listeners));
        self.appender.append_entry(
            lowest_position,
            highest_position,
            payload,
            Arc::new(adapter),
        )
    }

    fn add_commit_listener(&self, listener: Arc<dyn CommitListener>) {
        self.commit_listeners.add(listener);
    }

    fn remove_commit_listener(&self, listener: &Arc<dyn CommitListener>) {
        self.commit_listeners.remove(listener);
    }

    fn add_write_listener(&self, listener: Arc<dyn WriteListener>) {
        self.write_listeners.add(listener);
    }

    fn remove_write_listener(&self, listener: &Arc<dyn WriteListener>) {
        self.write_listeners.remove(listener);
    }
}
