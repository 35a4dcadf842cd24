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

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{AppResult, Shutdown};

use super::server::RaftCommand;
use super::{IndexedEntry, MemberId, RaftJournal};

/// In-process replica. Stores what the leader ships and acknowledges its last index
/// after every entry.
pub(super) struct Follower {
    partition_id: u32,
    member: MemberId,
    journal: Arc<RaftJournal>,
    entry_rx: async_channel::Receiver<Arc<IndexedEntry>>,
    leader_tx: mpsc::Sender<RaftCommand>,
    shutdown: Shutdown,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl Follower {
    pub(super) fn new(
        partition_id: u32,
        member: MemberId,
        entry_rx: async_channel::Receiver<Arc<IndexedEntry>>,
        leader_tx: mpsc::Sender<RaftCommand>,
        shutdown: Shutdown,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            partition_id,
            member,
            journal: Arc::new(RaftJournal::in_memory()),
            entry_rx,
            leader_tx,
            shutdown,
            _shutdown_complete_tx: shutdown_complete_tx,
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            tokio::select! {
                Ok(entry) = self.entry_rx.recv() => {
                    if let Err(e) = self.store(entry) {
                        warn!(
                            "partition {} follower {} failed to store entry: {}",
                            self.partition_id, self.member, e
                        );
                        continue;
                    }
                    let (last_index, last_term) = self
                        .journal
                        .last_entry()
                        .map_or((0, 0), |last| (last.index(), last.term()));
                    let ack = RaftCommand::Ack {
                        member: self.member,
                        last_index,
                        last_term,
                    };
                    if self.leader_tx.send(ack).await.is_err() {
                        break;
                    }
                }
                _ = self.shutdown.recv() => break,
                else => break,
            }
        }
        debug!(
            "partition {} follower {} stopped at index {}",
            self.partition_id,
            self.member,
            self.journal.last_index()
        );
    }

    /// Appends `entry` unless it is already stored. An entry of another term at the
    /// same index replaces the local suffix. Entries beyond a gap are ignored, the
    /// leader resends from the match index when the follower reconnects.
    fn store(&self, entry: Arc<IndexedEntry>) -> AppResult<()> {
        let index = entry.index();
        let last = self.journal.last_index();
        if index <= last {
            match self.journal.entry(index) {
                Some(existing) if existing.term() == entry.term() => return Ok(()),
                _ => self.journal.truncate_after(index - 1)?,
            }
        } else if index > last + 1 {
            return Ok(());
        }
        self.journal.append_indexed(entry)
    }
}
