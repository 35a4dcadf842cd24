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

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::info;

use crate::service::RaftConfig;
use crate::{AppError, AppResult, Shutdown};

use super::follower::Follower;
use super::server::{FollowerState, RaftCommand, RaftContext, RaftServer};
use super::{
    ApplicationEntry, CommitNotifier, LogAppender, MemberId, MetaStore, RaftAppendListener,
    RaftCommitListener, RaftJournal, RaftLogReader, RaftLogReaderFactory, ReadMode, Role,
};

/// Handle to the replication group of one partition.
///
/// The local member (id 0) starts as leader of a group of `replication_factor`
/// in-process members. Every mutation is a message to the replication actor;
/// the handle itself only reads shared state.
pub struct RaftPartition {
    context: Arc<RaftContext>,
    command_tx: mpsc::Sender<RaftCommand>,
    members: Vec<MemberId>,
}

impl fmt::Debug for RaftPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RaftPartition")
            .field("partition_id", &self.context.partition_id)
            .field("role", &self.context.role())
            .field("term", &self.context.term())
            .field("commit_index", &self.context.journal.commit_index())
            .field("last_index", &self.context.journal.last_index())
            .finish()
    }
}

impl RaftPartition {
    pub const LOCAL_MEMBER: MemberId = 0;

    /// Opens the journal (persistent when `dir` is given), restores term and commit
    /// index, spawns the followers and the replication actor and waits until the
    /// local member is leader.
    pub async fn start(
        partition_id: u32,
        dir: Option<&Path>,
        config: &RaftConfig,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<Arc<RaftPartition>> {
        if config.replication_factor == 0 {
            return Err(AppError::InvalidValue(
                "replication factor must be at least 1".to_string(),
            ));
        }

        let (journal, meta_store, meta) = match dir {
            Some(dir) => {
                let journal =
                    RaftJournal::open(dir.join(&config.segment_file_name), config.flush_on_write)?;
                let meta_store = MetaStore::new(dir.join(&config.meta_file_name));
                let meta = meta_store.load().await?;
                journal.set_commit_index(meta.commit_index);
                (journal, Some(meta_store), meta)
            }
            None => (RaftJournal::in_memory(), None, Default::default()),
        };
        let journal = Arc::new(journal);
        let context = Arc::new(RaftContext::new(partition_id, journal, meta.term));

        let (command_tx, command_rx) = mpsc::channel(config.command_channel_capacity);
        let members: Vec<MemberId> = (0..config.replication_factor as MemberId).collect();
        let mut followers = BTreeMap::new();
        for &member in members.iter().filter(|&&m| m != Self::LOCAL_MEMBER) {
            let (entry_tx, entry_rx) = async_channel::unbounded();
            let follower = Follower::new(
                partition_id,
                member,
                entry_rx,
                command_tx.clone(),
                Shutdown::new(notify_shutdown.subscribe()),
                shutdown_complete_tx.clone(),
            );
            tokio::spawn(follower.run());
            followers.insert(
                member,
                FollowerState {
                    tx: entry_tx,
                    match_index: 0,
                    connected: true,
                },
            );
        }

        let server = RaftServer::new(
            Arc::clone(&context),
            meta_store,
            members.clone(),
            followers,
            config.quorum(),
            command_rx,
            Shutdown::new(notify_shutdown.subscribe()),
            shutdown_complete_tx,
        );
        tokio::spawn(server.run());

        let partition = Arc::new(RaftPartition {
            context,
            command_tx,
            members,
        });
        partition.become_leader().await?;
        info!(
            "raft partition {} started with {} members, commit index {}",
            partition_id,
            partition.members.len(),
            partition.commit_index()
        );
        Ok(partition)
    }

    pub fn partition_id(&self) -> u32 {
        self.context.partition_id
    }

    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    pub fn role(&self) -> Role {
        self.context.role()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn term(&self) -> u64 {
        self.context.term()
    }

    pub fn commit_index(&self) -> u64 {
        self.context.journal.commit_index()
    }

    pub fn last_index(&self) -> u64 {
        self.context.journal.last_index()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> RaftCommand,
    ) -> AppResult<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(command(tx))
            .await
            .map_err(|e| AppError::ChannelSendError(e.to_string()))?;
        rx.await
            .map_err(|e| AppError::ChannelRecvError(e.to_string()))
    }

    /// Gives up leadership; uncommitted entries are dropped.
    pub async fn step_down(&self) -> AppResult<()> {
        self.request(|reply| RaftCommand::StepDown { reply }).await
    }

    /// Starts a new term with the local member as leader.
    pub async fn become_leader(&self) -> AppResult<()> {
        self.request(|reply| RaftCommand::BecomeLeader { reply })
            .await?
    }

    /// Stops shipping entries to `member` and ignores its acknowledgements.
    pub async fn disconnect_follower(&self, member: MemberId) -> AppResult<bool> {
        self.request(|reply| RaftCommand::Disconnect { member, reply })
            .await
    }

    /// Resumes replication to `member`, starting after its last acknowledged index.
    pub async fn reconnect_follower(&self, member: MemberId) -> AppResult<bool> {
        self.request(|reply| RaftCommand::Reconnect { member, reply })
            .await
    }
}

impl LogAppender for RaftPartition {
    fn append_entry(
        &self,
        lowest_position: i64,
        highest_position: i64,
        data: Bytes,
        listener: Arc<dyn RaftAppendListener>,
    ) -> AppResult<()> {
        if self.role() == Role::Inactive {
            return Err(AppError::Closed(format!(
                "partition {} is closed",
                self.partition_id()
            )));
        }
        let command = RaftCommand::Append {
            entry: ApplicationEntry::new(lowest_position, highest_position, data),
            listener,
        };
        self.command_tx.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => AppError::ChannelSendError(format!(
                "partition {} replication queue is full",
                self.partition_id()
            )),
            TrySendError::Closed(_) => AppError::Closed(format!(
                "partition {} replication actor stopped",
                self.partition_id()
            )),
        })
    }
}

impl RaftLogReaderFactory for RaftPartition {
    fn open_reader(&self, mode: ReadMode) -> RaftLogReader {
        RaftLogReader::new(Arc::clone(&self.context.journal), mode)
    }
}

impl CommitNotifier for RaftPartition {
    fn add_commit_listener(&self, listener: Arc<dyn RaftCommitListener>) {
        self.context.commit_listeners.add(listener);
    }

    fn remove_commit_listener(&self, listener: &Arc<dyn RaftCommitListener>) {
        self.context.commit_listeners.remove(listener);
    }
}
