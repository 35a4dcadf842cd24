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

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, trace, warn};

use crate::service::ProcessingConfig;
use crate::storage::LogStorage;
use crate::{AppError, AppResult, Shutdown};

use super::{
    ActorClock, LogStreamWriter, ProcessingContext, ProcessingScheduleService,
    StreamProcessorLifecycleAware, Task, TaskResultBuilder,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initial,
    Processing,
    Paused,
    Closed,
}

impl Phase {
    fn from_u8(value: u8) -> Phase {
        match value {
            0 => Phase::Initial,
            1 => Phase::Processing,
            2 => Phase::Paused,
            _ => Phase::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Phase::Initial => 0,
            Phase::Processing => 1,
            Phase::Paused => 2,
            Phase::Closed => 3,
        }
    }
}

enum ProcessorCommand {
    Run(Task),
    RunDelayed(Duration, Task),
    Pause(oneshot::Sender<()>),
    Resume(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// [`ProcessingScheduleService`] that queues tasks on the processor actor.
#[derive(Clone)]
struct ActorScheduleService {
    partition_id: u32,
    tx: mpsc::UnboundedSender<ProcessorCommand>,
}

impl ActorScheduleService {
    fn submit(&self, command: ProcessorCommand) {
        if self.tx.send(command).is_err() {
            debug!(
                "stream processor {} is gone, dropping scheduled task",
                self.partition_id
            );
        }
    }
}

impl ProcessingScheduleService for ActorScheduleService {
    fn run_delayed(&self, delay: Duration, task: Task) {
        self.submit(ProcessorCommand::RunDelayed(delay, task));
    }

    fn run(&self, task: Task) {
        self.submit(ProcessorCommand::Run(task));
    }
}

/// Handle to the single actor that runs all scheduled work of one partition and
/// writes the produced records to the partition's log.
pub struct StreamProcessor {
    partition_id: u32,
    phase: Arc<AtomicU8>,
    schedule_service: ActorScheduleService,
}

impl fmt::Debug for StreamProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamProcessor")
            .field("partition_id", &self.partition_id)
            .field("phase", &self.phase())
            .finish()
    }
}

struct StreamProcessorActor {
    partition_id: u32,
    phase: Arc<AtomicU8>,
    writer: LogStreamWriter,
    lifecycle: Vec<Arc<dyn StreamProcessorLifecycleAware>>,
    max_batch_size: usize,
    command_rx: mpsc::UnboundedReceiver<ProcessorCommand>,
    delay_queue: DelayQueue<Task>,
    shutdown: Shutdown,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl StreamProcessor {
    /// Recovers the last written position, notifies the lifecycle-aware components and
    /// starts processing.
    pub async fn start(
        partition_id: u32,
        storage: Arc<dyn LogStorage>,
        lifecycle: Vec<Arc<dyn StreamProcessorLifecycleAware>>,
        config: &ProcessingConfig,
        clock: Arc<dyn ActorClock>,
        shutdown: Shutdown,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<StreamProcessor> {
        let (tx, command_rx) = mpsc::unbounded_channel();
        let schedule_service = ActorScheduleService { partition_id, tx };
        let phase = Arc::new(AtomicU8::new(Phase::Initial.as_u8()));

        let writer = LogStreamWriter::new(storage);
        let context = ProcessingContext {
            partition_id,
            last_position: writer.next_position() - 1,
            schedule_service: Arc::new(schedule_service.clone()),
            clock,
        };
        let actor = StreamProcessorActor {
            partition_id,
            phase: Arc::clone(&phase),
            writer,
            lifecycle,
            max_batch_size: config.max_batch_size,
            command_rx,
            delay_queue: DelayQueue::new(),
            shutdown,
            _shutdown_complete_tx: shutdown_complete_tx,
        };

        let (recovered_tx, recovered_rx) = oneshot::channel();
        tokio::spawn(actor.run(context, recovered_tx));
        recovered_rx
            .await
            .map_err(|e| AppError::ChannelRecvError(e.to_string()))?;

        Ok(StreamProcessor {
            partition_id,
            phase,
            schedule_service,
        })
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn schedule_service(&self) -> Arc<dyn ProcessingScheduleService> {
        Arc::new(self.schedule_service.clone())
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<()>) -> ProcessorCommand,
    ) -> AppResult<()> {
        let (tx, rx) = oneshot::channel();
        self.schedule_service
            .tx
            .send(command(tx))
            .map_err(|e| AppError::ChannelSendError(e.to_string()))?;
        rx.await
            .map_err(|e| AppError::ChannelRecvError(e.to_string()))
    }

    pub async fn pause(&self) -> AppResult<()> {
        self.request(ProcessorCommand::Pause).await
    }

    pub async fn resume(&self) -> AppResult<()> {
        self.request(ProcessorCommand::Resume).await
    }

    pub async fn close(&self) -> AppResult<()> {
        self.request(ProcessorCommand::Close).await
    }
}

impl StreamProcessorActor {
    fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase.as_u8(), Ordering::Release);
    }

    async fn run(mut self, context: ProcessingContext, recovered_tx: oneshot::Sender<()>) {
        for component in &self.lifecycle {
            component.on_recovered(&context);
        }
        self.set_phase(Phase::Processing);
        info!(
            "stream processor {} recovered at position {}",
            self.partition_id, context.last_position
        );
        let _ = recovered_tx.send(());

        loop {
            tokio::select! {
                Some(command) = self.command_rx.recv() => {
                    if !self.handle(command) {
                        break;
                    }
                }
                Some(expired) = self.delay_queue.next() => {
                    self.execute(expired.into_inner());
                }
                _ = self.shutdown.recv() => break,
                else => break,
            }
        }
        self.close();
    }

    /// Returns `false` once the processor is closed.
    fn handle(&mut self, command: ProcessorCommand) -> bool {
        match command {
            ProcessorCommand::Run(task) => self.execute(task),
            ProcessorCommand::RunDelayed(delay, task) => {
                let key = self.delay_queue.insert(task, delay);
                trace!(
                    "stream processor {} delays task {:?} by {}ms",
                    self.partition_id,
                    key,
                    delay.as_millis()
                );
            }
            ProcessorCommand::Pause(reply) => {
                if self.phase() == Phase::Processing {
                    self.set_phase(Phase::Paused);
                    self.lifecycle.iter().for_each(|c| c.on_paused());
                    debug!("stream processor {} paused", self.partition_id);
                }
                let _ = reply.send(());
            }
            ProcessorCommand::Resume(reply) => {
                if self.phase() == Phase::Paused {
                    self.set_phase(Phase::Processing);
                    self.lifecycle.iter().for_each(|c| c.on_resumed());
                    debug!("stream processor {} resumed", self.partition_id);
                }
                let _ = reply.send(());
            }
            ProcessorCommand::Close(reply) => {
                self.close();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn execute(&mut self, task: Task) {
        let mut builder = TaskResultBuilder::new(self.max_batch_size);
        let result = task(&mut builder);
        let records = result.records().len();
        match self.writer.try_write(result) {
            Ok(Some((lowest, highest))) => trace!(
                "stream processor {} wrote positions [{}, {}]",
                self.partition_id,
                lowest,
                highest
            ),
            Ok(None) => {}
            Err(e) if e.is_retryable() => warn!(
                "stream processor {} dropped a batch of {} records: {}",
                self.partition_id, records, e
            ),
            Err(e) => error!(
                "stream processor {} failed to write a batch: {}",
                self.partition_id, e
            ),
        }
    }

    fn close(&mut self) {
        if self.phase() == Phase::Closed {
            return;
        }
        self.set_phase(Phase::Closed);
        self.lifecycle.iter().for_each(|c| c.on_close());
        self.delay_queue.clear();
        info!("stream processor {} closed", self.partition_id);
    }
}
