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

//! The replication actor of the local member.
//!
//! All journal writes, commit index updates and listener callbacks of a partition
//! happen on this one task, so they are totally ordered: `on_write` callbacks in
//! index order, `on_commit` callbacks in index order and never before the
//! `on_write` of the same entry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::utils::ListenerSet;
use crate::{AppError, AppResult, Shutdown};

use super::{
    ApplicationEntry, ConfigurationEntry, IndexedEntry, MemberId, MetaStore, RaftCommitListener,
    RaftAppendListener, RaftEntry, RaftJournal, RaftMeta, Role,
};

/// State shared between the actor and the partition handle.
pub(super) struct RaftContext {
    pub(super) partition_id: u32,
    pub(super) journal: Arc<RaftJournal>,
    pub(super) commit_listeners: ListenerSet<dyn RaftCommitListener>,
    role: AtomicU8,
    term: AtomicU64,
}

impl RaftContext {
    pub(super) fn new(partition_id: u32, journal: Arc<RaftJournal>, term: u64) -> Self {
        Self {
            partition_id,
            journal,
            commit_listeners: ListenerSet::new(),
            role: AtomicU8::new(Role::Follower.as_u8()),
            term: AtomicU64::new(term),
        }
    }

    pub(super) fn role(&self) -> Role {
        Role::from_u8(self.role.load(Ordering::Acquire))
    }

    pub(super) fn set_role(&self, role: Role) {
        self.role.store(role.as_u8(), Ordering::Release);
    }

    pub(super) fn term(&self) -> u64 {
        self.term.load(Ordering::Acquire)
    }

    fn set_term(&self, term: u64) {
        self.term.store(term, Ordering::Release);
    }
}

pub(super) enum RaftCommand {
    Append {
        entry: ApplicationEntry,
        listener: Arc<dyn RaftAppendListener>,
    },
    /// `last_term` is the term of the follower's entry at `last_index`.
    Ack {
        member: MemberId,
        last_index: u64,
        last_term: u64,
    },
    StepDown {
        reply: oneshot::Sender<()>,
    },
    BecomeLeader {
        reply: oneshot::Sender<AppResult<()>>,
    },
    Disconnect {
        member: MemberId,
        reply: oneshot::Sender<bool>,
    },
    Reconnect {
        member: MemberId,
        reply: oneshot::Sender<bool>,
    },
}

pub(super) struct FollowerState {
    pub(super) tx: async_channel::Sender<Arc<IndexedEntry>>,
    pub(super) match_index: u64,
    pub(super) connected: bool,
}

/// Kept per uncommitted append. Holds the highest position instead of the entry so
/// large payloads are not pinned in memory until commit.
struct PendingAppend {
    highest_position: i64,
    listener: Arc<dyn RaftAppendListener>,
}

pub(super) struct RaftServer {
    context: Arc<RaftContext>,
    meta_store: Option<MetaStore>,
    members: Vec<MemberId>,
    followers: BTreeMap<MemberId, FollowerState>,
    pending: BTreeMap<u64, PendingAppend>,
    last_highest_position: Option<i64>,
    quorum: usize,
    command_rx: mpsc::Receiver<RaftCommand>,
    shutdown: Shutdown,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl RaftServer {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        context: Arc<RaftContext>,
        meta_store: Option<MetaStore>,
        members: Vec<MemberId>,
        followers: BTreeMap<MemberId, FollowerState>,
        quorum: usize,
        command_rx: mpsc::Receiver<RaftCommand>,
        shutdown: Shutdown,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            context,
            meta_store,
            members,
            followers,
            pending: BTreeMap::new(),
            last_highest_position: None,
            quorum,
            command_rx,
            shutdown,
            _shutdown_complete_tx: shutdown_complete_tx,
        }
    }

    pub(super) async fn run(mut self) {
        debug!("raft server of partition {} started", self.context.partition_id);
        loop {
            tokio::select! {
                Some(command) = self.command_rx.recv() => self.handle(command).await,
                _ = self.shutdown.recv() => break,
                else => break,
            }
        }
        self.close();
    }

    async fn handle(&mut self, command: RaftCommand) {
        match command {
            RaftCommand::Append { entry, listener } => self.append(entry, listener).await,
            RaftCommand::Ack {
                member,
                last_index,
                last_term,
            } => self.on_ack(member, last_index, last_term).await,
            RaftCommand::StepDown { reply } => {
                self.step_down();
                let _ = reply.send(());
            }
            RaftCommand::BecomeLeader { reply } => {
                let result = self.become_leader().await;
                let _ = reply.send(result);
            }
            RaftCommand::Disconnect { member, reply } => {
                let known = match self.followers.get_mut(&member) {
                    Some(follower) => {
                        follower.connected = false;
                        true
                    }
                    None => false,
                };
                debug!(
                    "partition {} disconnected follower {}",
                    self.context.partition_id, member
                );
                let _ = reply.send(known);
            }
            RaftCommand::Reconnect { member, reply } => {
                let known = match self.followers.get_mut(&member) {
                    Some(follower) => {
                        follower.connected = true;
                        true
                    }
                    None => false,
                };
                if known {
                    debug!(
                        "partition {} reconnected follower {}",
                        self.context.partition_id, member
                    );
                    self.send_missing_entries(member);
                }
                let _ = reply.send(known);
            }
        }
    }

    fn validate(&self, entry: &ApplicationEntry) -> AppResult<()> {
        if entry.lowest_position > entry.highest_position {
            return Err(AppError::UnexpectedPosition(format!(
                "lowest position {} is greater than highest position {}",
                entry.lowest_position, entry.highest_position
            )));
        }
        if let Some(last_highest) = self.last_highest_position {
            if entry.lowest_position != last_highest + 1 {
                return Err(AppError::UnexpectedPosition(format!(
                    "expected the next entry to start at position {} but it starts at {}",
                    last_highest + 1,
                    entry.lowest_position
                )));
            }
        }
        Ok(())
    }

    async fn append(&mut self, entry: ApplicationEntry, listener: Arc<dyn RaftAppendListener>) {
        if self.context.role() != Role::Leader {
            listener.on_write_error(AppError::NotLeader(format!(
                "partition {} is not leader and cannot be used as appender",
                self.context.partition_id
            )));
            return;
        }

        if let Err(e) = self.validate(&entry) {
            warn!(
                "partition {} rejected entry [{}, {}]: {}",
                self.context.partition_id, entry.lowest_position, entry.highest_position, e
            );
            listener.on_write_error(e);
            self.step_down();
            return;
        }

        let term = self.context.term();
        let indexed = match self
            .context
            .journal
            .append(term, RaftEntry::Application(entry))
        {
            Ok(indexed) => indexed,
            Err(e) => {
                error!(
                    "partition {} failed to write entry: {}",
                    self.context.partition_id, e
                );
                listener.on_write_error(e);
                return;
            }
        };

        self.last_highest_position = Some(indexed.highest_position());
        listener.on_write(&indexed);
        self.replicate(indexed, Some(listener)).await;
    }

    async fn replicate(
        &mut self,
        indexed: Arc<IndexedEntry>,
        listener: Option<Arc<dyn RaftAppendListener>>,
    ) {
        if let Some(listener) = listener {
            self.pending.insert(
                indexed.index(),
                PendingAppend {
                    highest_position: indexed.highest_position(),
                    listener,
                },
            );
        }
        for (member, follower) in self.followers.iter() {
            if follower.connected && follower.tx.try_send(Arc::clone(&indexed)).is_err() {
                warn!(
                    "partition {} follower {} is gone",
                    self.context.partition_id, member
                );
            }
        }
        self.try_commit().await;
    }

    fn send_missing_entries(&self, member: MemberId) {
        let Some(follower) = self.followers.get(&member) else {
            return;
        };
        let journal = &self.context.journal;
        for index in follower.match_index + 1..=journal.last_index() {
            let Some(entry) = journal.entry(index) else {
                break;
            };
            if follower.tx.try_send(entry).is_err() {
                break;
            }
        }
    }

    async fn on_ack(&mut self, member: MemberId, last_index: u64, last_term: u64) {
        let journal = &self.context.journal;
        match journal.entry(last_index) {
            Some(entry) if entry.term() == last_term => {}
            _ => {
                trace!(
                    "partition {} ignored ack of follower {} for index {} in term {}",
                    self.context.partition_id,
                    member,
                    last_index,
                    last_term
                );
                return;
            }
        }
        let last = journal.last_index();
        match self.followers.get_mut(&member) {
            Some(follower) if follower.connected => {
                follower.match_index = last_index.min(last);
                trace!(
                    "partition {} follower {} acknowledged {}",
                    self.context.partition_id,
                    member,
                    last_index
                );
            }
            _ => return,
        }
        self.try_commit().await;
    }

    /// Commits up to the highest index stored by a quorum, counting the leader itself.
    async fn try_commit(&mut self) {
        if self.context.role() != Role::Leader {
            return;
        }
        let journal = Arc::clone(&self.context.journal);
        let mut match_indexes: Vec<u64> = self.followers.values().map(|f| f.match_index).collect();
        match_indexes.push(journal.last_index());
        match_indexes.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = match_indexes[self.quorum - 1];
        if candidate <= journal.commit_index() {
            return;
        }

        let term = self.context.term();
        // entries of older terms are only committed along with one of the current term
        match journal.entry(candidate) {
            Some(entry) if entry.term() == term => {}
            _ => return,
        }

        // the leader counts itself in the quorum, so it must have persisted
        if let Err(e) = journal.flush() {
            warn!(
                "partition {} failed to flush before committing {}: {}, stepping down",
                self.context.partition_id, candidate, e
            );
            self.step_down();
            return;
        }

        let commit_index = journal.set_commit_index(candidate);
        if let Some(meta_store) = &self.meta_store {
            if let Err(e) = meta_store.store(RaftMeta { term, commit_index }).await {
                warn!(
                    "partition {} failed to store commit index {}: {}",
                    self.context.partition_id, commit_index, e
                );
            }
        }
        trace!(
            "partition {} committed up to {}",
            self.context.partition_id,
            commit_index
        );

        let still_pending = self.pending.split_off(&(commit_index + 1));
        let committed = std::mem::replace(&mut self.pending, still_pending);
        for (index, pending) in committed {
            pending.listener.on_commit(index, pending.highest_position);
        }
        self.context
            .commit_listeners
            .for_each(|listener| listener.on_commit(commit_index));
    }

    /// Leaves leadership. Uncommitted entries are dropped from the journal and their
    /// appenders learn that the commit failed.
    fn step_down(&mut self) {
        if self.context.role() != Role::Leader {
            return;
        }
        self.context.set_role(Role::Follower);

        let journal = &self.context.journal;
        let commit_index = journal.commit_index();
        for (index, pending) in std::mem::take(&mut self.pending) {
            pending.listener.on_commit_error(
                index,
                AppError::NotLeader(format!(
                    "partition {} stepped down before index {} was committed",
                    self.context.partition_id, index
                )),
            );
        }
        if let Err(e) = journal.truncate_after(commit_index) {
            error!(
                "partition {} failed to drop uncommitted entries: {}",
                self.context.partition_id, e
            );
        }
        for follower in self.followers.values_mut() {
            follower.match_index = follower.match_index.min(commit_index);
        }
        self.last_highest_position = journal
            .last_application_entry(journal.last_index())
            .map(|entry| entry.highest_position);
        info!(
            "partition {} stepped down to follower in term {}",
            self.context.partition_id,
            self.context.term()
        );
    }

    async fn become_leader(&mut self) -> AppResult<()> {
        match self.context.role() {
            Role::Leader => return Ok(()),
            Role::Inactive => {
                return Err(AppError::Closed(format!(
                    "partition {} is closed",
                    self.context.partition_id
                )))
            }
            Role::Follower => {}
        }

        let journal = Arc::clone(&self.context.journal);
        let term = self.context.term() + 1;
        if let Some(meta_store) = &self.meta_store {
            meta_store
                .store(RaftMeta {
                    term,
                    commit_index: journal.commit_index(),
                })
                .await?;
        }
        self.context.set_term(term);
        self.context.set_role(Role::Leader);
        self.last_highest_position = journal
            .last_application_entry(journal.last_index())
            .map(|entry| entry.highest_position);

        let members: Vec<MemberId> = self.followers.keys().copied().collect();
        for member in members {
            self.send_missing_entries(member);
        }

        if journal.is_empty() {
            let configuration = journal.append(
                term,
                RaftEntry::Configuration(ConfigurationEntry {
                    members: self.members.clone(),
                }),
            )?;
            self.replicate(configuration, None).await;
        }
        let initial = journal.append(term, RaftEntry::Initial)?;
        info!(
            "partition {} became leader in term {} at index {}",
            self.context.partition_id,
            term,
            initial.index()
        );
        self.replicate(initial, None).await;
        Ok(())
    }

    fn close(&mut self) {
        self.context.set_role(Role::Inactive);
        for (index, pending) in std::mem::take(&mut self.pending) {
            pending.listener.on_commit_error(
                index,
                AppError::Closed(format!(
                    "partition {} closed before index {} was committed",
                    self.context.partition_id, index
                )),
            );
        }
        for follower in self.followers.values() {
            follower.tx.close();
        }
        if let Err(e) = self.context.journal.flush() {
            error!(
                "partition {} failed to flush journal on close: {}",
                self.context.partition_id, e
            );
        }
        debug!("raft server of partition {} closed", self.context.partition_id);
    }
}
