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

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::Shutdown;

use super::{CommitListener, LogBlock, LogStorage};

struct WakeOnCommit(Arc<Notify>);

impl CommitListener for WakeOnCommit {
    fn on_commit(&self) {
        // notify_one keeps a permit when the tailer is busy reading
        self.0.notify_one();
    }
}

/// Follows the committed end of a [`LogStorage`] and hands every block at or after
/// `from_position` to a handler, waking up on commit signals.
pub struct LogTailer;

impl LogTailer {
    pub fn spawn<F>(
        storage: Arc<dyn LogStorage>,
        from_position: i64,
        mut handler: F,
        mut shutdown: Shutdown,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> JoinHandle<()>
    where
        F: FnMut(LogBlock) + Send + 'static,
    {
        tokio::spawn(async move {
            let _shutdown_complete_tx = shutdown_complete_tx;
            let notify = Arc::new(Notify::new());
            let listener: Arc<dyn CommitListener> = Arc::new(WakeOnCommit(Arc::clone(&notify)));
            storage.add_commit_listener(Arc::clone(&listener));

            let mut reader = storage.new_reader();
            reader.seek(from_position);
            let mut delivered = 0usize;
            while !shutdown.is_shutdown() {
                while let Some(block) = reader.next() {
                    if block.highest_position < from_position {
                        continue;
                    }
                    trace!(
                        "tailer read block {} [{}, {}]",
                        block.index,
                        block.lowest_position,
                        block.highest_position
                    );
                    delivered += 1;
                    handler(block);
                }
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = shutdown.recv() => {}
                }
            }

            storage.remove_commit_listener(&listener);
            reader.close();
            debug!("log tailer stopped after {} blocks", delivered);
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::sync::broadcast;

    use super::*;
    use crate::raft::RaftPartition;
    use crate::service::RaftConfig;
    use crate::storage::{AppendListener, RaftLogStorage};
    use crate::AppResult;

    struct Quiet;

    impl AppendListener for Quiet {
        fn on_write(&self, _index: u64, _highest_position: i64) {}
        fn on_commit(&self, _index: u64, _highest_position: i64) {}
    }

    #[tokio::test]
    async fn test_tailer_follows_commits() -> AppResult<()> {
        let config = RaftConfig {
            replication_factor: 1,
            ..RaftConfig::default()
        };
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);
        let partition = RaftPartition::start(
            1,
            None,
            &config,
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        )
        .await?;
        let storage: Arc<dyn LogStorage> = Arc::new(RaftLogStorage::of_partition(partition));

        storage.append(1, 2, Bytes::from_static(b"skipped"), Arc::new(Quiet))?;
        storage.append(3, 3, Bytes::from_static(b"first"), Arc::new(Quiet))?;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handle = LogTailer::spawn(
            Arc::clone(&storage),
            3,
            move |block| sink.lock().push(block.highest_position),
            Shutdown::new(notify_shutdown.subscribe()),
            shutdown_complete_tx,
        );

        storage.append(4, 6, Bytes::from_static(b"second"), Arc::new(Quiet))?;
        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("tailer delivered both blocks");
        assert_eq!(*seen.lock(), vec![3, 6]);

        drop(storage);
        notify_shutdown.send(()).unwrap();
        handle.await.unwrap();
        assert!(shutdown_complete_rx.recv().await.is_none());
        Ok(())
    }
}
