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

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Runtime;
use tokio::sync::{broadcast, mpsc};
use tokio::{signal, time};
use tracing::{debug, error, info, trace, warn};

use crate::processing::{
    ActorClock, DueDateChecker, StreamProcessor, StreamProcessorLifecycleAware, SystemActorClock,
    TaskResultBuilder,
};
use crate::raft::RaftPartition;
use crate::storage::{LogBlock, LogStorage, LogTailer, RaftLogStorage};
use crate::{global_config, AppResult, BrokerConfig, Shutdown};

use super::timers::TimerStore;

/// Everything running for one partition.
pub struct PartitionServices {
    pub raft: Arc<RaftPartition>,
    pub storage: Arc<RaftLogStorage>,
    pub processor: StreamProcessor,
    pub timers: Arc<TimerStore>,
    pub timer_checker: DueDateChecker,
}

#[derive(Default)]
pub struct Broker {
    partitions: DashMap<u32, Arc<PartitionServices>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn partition(&self, partition_id: u32) -> Option<Arc<PartitionServices>> {
        self.partitions
            .get(&partition_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Starts every partition on `rt`, runs the demo timer workload until Ctrl-C and
    /// waits for all tasks to wind down.
    pub fn start(&mut self, rt: &Runtime) -> AppResult<()> {
        let config = global_config();
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

        let clock: Arc<dyn ActorClock> = Arc::new(SystemActorClock);
        for partition_id in 1..=config.general.partition_count {
            let services = rt.block_on(Self::start_partition(
                partition_id,
                config,
                Arc::clone(&clock),
                notify_shutdown.clone(),
                shutdown_complete_tx.clone(),
            ))?;
            self.partitions.insert(partition_id, Arc::new(services));
        }
        info!(
            "broker {} started {} partitions",
            config.general.node_id,
            self.partitions.len()
        );

        rt.block_on(self.run_timer_workload(config, Arc::clone(&clock)));

        // ctrl-c received, send shutdown signal
        if notify_shutdown.send(()).is_err() {
            warn!("no task was listening for shutdown");
        }
        for entry in self.partitions.iter() {
            entry.value().storage.close();
        }
        self.partitions.clear();
        drop(shutdown_complete_tx);
        trace!("waiting for shutdown complete...");
        rt.block_on(shutdown_complete_rx.recv());
        info!("broker shutdown complete");
        Ok(())
    }

    async fn start_partition(
        partition_id: u32,
        config: &BrokerConfig,
        clock: Arc<dyn ActorClock>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<PartitionServices> {
        let dir = PathBuf::from(&config.general.data_dir).join(format!("partition-{}", partition_id));
        let raft = RaftPartition::start(
            partition_id,
            Some(&dir),
            &config.raft,
            notify_shutdown.clone(),
            shutdown_complete_tx.clone(),
        )
        .await?;
        let storage = Arc::new(RaftLogStorage::of_partition(Arc::clone(&raft)));

        let timers = Arc::new(TimerStore::new());
        let recovered = timers.recover(storage.as_ref());
        debug!(
            "partition {} recovered {} pending timers from the log",
            partition_id, recovered
        );
        let timer_checker = {
            let timers = Arc::clone(&timers);
            let clock = Arc::clone(&clock);
            DueDateChecker::new(
                "timers",
                config.processing.timer_resolution(),
                Arc::clone(&clock),
                move |builder: &mut TaskResultBuilder| timers.trigger_due(clock.now_millis(), builder),
            )
        };

        let lifecycle: Vec<Arc<dyn StreamProcessorLifecycleAware>> =
            vec![Arc::new(timer_checker.clone())];
        let processor = StreamProcessor::start(
            partition_id,
            storage.clone(),
            lifecycle,
            &config.processing,
            clock,
            Shutdown::new(notify_shutdown.subscribe()),
            shutdown_complete_tx.clone(),
        )
        .await?;

        let from_position = processor_start_position(storage.as_ref());
        LogTailer::spawn(
            storage.clone(),
            from_position,
            move |block| log_block(partition_id, &block),
            Shutdown::new(notify_shutdown.subscribe()),
            shutdown_complete_tx,
        );

        Ok(PartitionServices {
            raft,
            storage,
            processor,
            timers,
            timer_checker,
        })
    }

    /// Creates one timer per partition every `timers.interval_ms` until Ctrl-C.
    async fn run_timer_workload(&self, config: &BrokerConfig, clock: Arc<dyn ActorClock>) {
        let mut interval = time::interval(Duration::from_millis(config.timers.interval_ms.max(1)));
        let max_delay_ms = config.timers.max_delay_ms.max(1);
        let created = Arc::new(AtomicU64::new(0));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for entry in self.partitions.iter() {
                        let services = Arc::clone(entry.value());
                        let clock = Arc::clone(&clock);
                        let seq = created.fetch_add(1, Ordering::Relaxed);
                        let delay = (seq.wrapping_mul(7919) % max_delay_ms) as i64;
                        let checker = services.timer_checker.clone();
                        let timers = Arc::clone(&services.timers);
                        services.processor.schedule_service().run(Box::new(
                            move |builder: &mut TaskResultBuilder| {
                                let due_date = clock.now_millis() + delay;
                                match timers.create(due_date, builder) {
                                    Some(key) => {
                                        checker.schedule(due_date);
                                        debug!("created timer {} due in {}ms", key, delay);
                                    }
                                    None => warn!("timer due in {}ms does not fit a batch", delay),
                                }
                                builder.build()
                            },
                        ));
                    }
                }
                res = signal::ctrl_c() => {
                    if let Err(e) = res {
                        error!("failed to listen for ctrl-c: {}", e);
                    }
                    info!("get shutdown signal");
                    break;
                }
            }
        }
    }
}

fn processor_start_position(storage: &dyn LogStorage) -> i64 {
    let mut reader = storage.new_reader();
    reader.seek_to_last();
    reader.next().map_or(1, |block| block.highest_position + 1)
}

fn log_block(partition_id: u32, block: &LogBlock) {
    for record in block.records() {
        match record {
            Ok(record) => debug!(
                "partition {} committed position {} key {} {}",
                partition_id,
                record.position,
                record.key,
                String::from_utf8_lossy(&record.value)
            ),
            Err(e) => {
                error!(
                    "partition {} block {} holds a malformed record: {}",
                    partition_id, block.index, e
                );
                break;
            }
        }
    }
}
