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

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::storage::{encode_batch, AppendListener, LogStorage};
use crate::{AppError, AppResult};

use super::{Rollback, TaskResult};

/// Marks the writer for a position resync and rolls back the batch's task when an
/// append is rejected after it left the caller.
struct BatchListener {
    rejected: Arc<AtomicBool>,
    rollbacks: Mutex<Vec<Rollback>>,
}

impl BatchListener {
    fn roll_back(&self) {
        let rollbacks = std::mem::take(&mut *self.rollbacks.lock());
        if !rollbacks.is_empty() {
            trace!("rolling back {} task effects", rollbacks.len());
        }
        for rollback in rollbacks {
            rollback();
        }
    }
}

impl AppendListener for BatchListener {
    fn on_write(&self, index: u64, highest_position: i64) {
        trace!("batch up to {} written at index {}", highest_position, index);
    }

    fn on_commit(&self, index: u64, highest_position: i64) {
        trace!("batch up to {} committed at index {}", highest_position, index);
        self.rollbacks.lock().clear();
    }

    fn on_write_error(&self, error: AppError) {
        warn!("batch rejected by the log: {}", error);
        self.rejected.store(true, Ordering::Release);
        self.roll_back();
    }

    fn on_commit_error(&self, index: u64, error: AppError) {
        warn!("batch at index {} was not committed: {}", index, error);
        self.rejected.store(true, Ordering::Release);
        self.roll_back();
    }
}

/// Turns task results into log appends, assigning consecutive positions.
pub struct LogStreamWriter {
    storage: Arc<dyn LogStorage>,
    next_position: i64,
    rejected: Arc<AtomicBool>,
}

impl LogStreamWriter {
    /// Continues after the last position already in the log.
    pub fn new(storage: Arc<dyn LogStorage>) -> Self {
        let next_position = Self::last_written_position(storage.as_ref()) + 1;
        Self {
            storage,
            next_position,
            rejected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Highest position written locally, committed or not; 0 for an empty log.
    pub fn last_written_position(storage: &dyn LogStorage) -> i64 {
        let mut reader = storage.new_uncommitted_reader();
        reader.seek_to_last();
        let last = reader.next().map_or(0, |block| block.highest_position);
        reader.close();
        last
    }

    pub fn next_position(&self) -> i64 {
        self.next_position
    }

    /// Appends the records of `result` as one block. Returns the covered position
    /// range, or `None` for an empty result. The result's rollbacks run if the log
    /// rejects the block.
    pub fn try_write(&mut self, result: TaskResult) -> AppResult<Option<(i64, i64)>> {
        let (records, rollbacks) = result.into_parts();
        if records.is_empty() {
            return Ok(None);
        }
        if self.rejected.swap(false, Ordering::AcqRel) {
            let resynced = Self::last_written_position(self.storage.as_ref()) + 1;
            warn!(
                "resyncing next position from {} to {} after a rejected batch",
                self.next_position, resynced
            );
            self.next_position = resynced;
        }

        let lowest = self.next_position;
        let highest = lowest + records.len() as i64 - 1;
        let batch = encode_batch(lowest, &records);
        let listener = Arc::new(BatchListener {
            rejected: Arc::clone(&self.rejected),
            rollbacks: Mutex::new(rollbacks),
        });
        if let Err(e) = self.storage.append(lowest, highest, batch, listener.clone()) {
            listener.roll_back();
            return Err(e);
        }
        self.next_position = highest + 1;
        Ok(Some((lowest, highest)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::sync::{broadcast, mpsc};

    use super::*;
    use crate::processing::TaskResultBuilder;
    use crate::raft::RaftPartition;
    use crate::service::RaftConfig;
    use crate::storage::RaftLogStorage;

    async fn single_member(
    ) -> AppResult<(Arc<RaftPartition>, Arc<RaftLogStorage>, broadcast::Sender<()>)> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);
        let config = RaftConfig {
            replication_factor: 1,
            ..RaftConfig::default()
        };
        let partition =
            RaftPartition::start(1, None, &config, notify_shutdown.clone(), shutdown_complete_tx)
                .await?;
        let storage = Arc::new(RaftLogStorage::of_partition(partition.clone()));
        Ok((partition, storage, notify_shutdown))
    }

    fn counted_result(rolled_back: &Arc<AtomicUsize>) -> TaskResult {
        let mut builder = TaskResultBuilder::new(1024);
        builder.append_record(7, Bytes::from_static(b"value"));
        let rolled_back = Arc::clone(rolled_back);
        builder.on_rejected(move || {
            rolled_back.fetch_add(1, Ordering::SeqCst);
        });
        builder.build()
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_rejected_batch_rolls_back_and_resyncs() -> AppResult<()> {
        let (partition, storage, _shutdown) = single_member().await?;
        let mut writer = LogStreamWriter::new(storage.clone());
        let rolled_back = Arc::new(AtomicUsize::new(0));

        assert_eq!(writer.try_write(counted_result(&rolled_back))?, Some((1, 1)));
        wait_until(|| partition.commit_index() == partition.last_index()).await;

        partition.step_down().await?;
        assert_eq!(writer.try_write(counted_result(&rolled_back))?, Some((2, 2)));
        wait_until(|| rolled_back.load(Ordering::SeqCst) == 1).await;

        partition.become_leader().await?;
        assert_eq!(writer.try_write(counted_result(&rolled_back))?, Some((2, 2)));
        wait_until(|| storage.new_reader().count() == 2).await;
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_synchronous_rejection_rolls_back() -> AppResult<()> {
        let (_partition, storage, _shutdown) = single_member().await?;
        let mut writer = LogStreamWriter::new(storage.clone());
        let rolled_back = Arc::new(AtomicUsize::new(0));

        storage.close();
        assert!(writer.try_write(counted_result(&rolled_back)).is_err());
        assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
        assert_eq!(writer.try_write(TaskResult::default())?, None);
        Ok(())
    }
}
