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
use std::time::Duration;

use bytes::Bytes;

use crate::storage::LoggedRecord;

/// Unit of work executed on the stream processor actor. The records collected in the
/// builder are written to the log as one batch after the task returns.
pub type Task = Box<dyn FnOnce(&mut TaskResultBuilder) -> TaskResult + Send>;

/// Cooperative scheduler of a stream processor. Tasks never run concurrently with each
/// other.
pub trait ProcessingScheduleService: Send + Sync {
    /// Runs `task` once `delay` has elapsed.
    fn run_delayed(&self, delay: Duration, task: Task);

    /// Runs `task` as soon as the actor gets to it.
    fn run(&self, task: Task);
}

/// Undoes the in-memory effect of a task whose records never reached the log.
pub type Rollback = Box<dyn FnOnce() + Send>;

/// Collects the records a task wants to write.
pub struct TaskResultBuilder {
    records: Vec<(i64, Bytes)>,
    rollbacks: Vec<Rollback>,
    batch_size: usize,
    max_batch_size: usize,
}

impl fmt::Debug for TaskResultBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskResultBuilder")
            .field("records", &self.records.len())
            .field("rollbacks", &self.rollbacks.len())
            .field("batch_size", &self.batch_size)
            .field("max_batch_size", &self.max_batch_size)
            .finish()
    }
}

impl TaskResultBuilder {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            records: Vec::new(),
            rollbacks: Vec::new(),
            batch_size: 0,
            max_batch_size,
        }
    }

    /// Adds a record to the batch. Returns `false`, leaving the batch untouched, when
    /// the record would push the batch past the maximum size.
    pub fn append_record(&mut self, key: i64, value: Bytes) -> bool {
        let size = LoggedRecord::framed_size(value.len());
        if self.batch_size + size > self.max_batch_size {
            return false;
        }
        self.batch_size += size;
        self.records.push((key, value));
        true
    }

    /// Registers `rollback` to run when the batch built next is rejected by the log,
    /// before or after it was written locally.
    pub fn on_rejected(&mut self, rollback: impl FnOnce() + Send + 'static) {
        self.rollbacks.push(Box::new(rollback));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn build(&mut self) -> TaskResult {
        self.batch_size = 0;
        TaskResult {
            records: std::mem::take(&mut self.records),
            rollbacks: std::mem::take(&mut self.rollbacks),
        }
    }
}

#[derive(Default)]
pub struct TaskResult {
    records: Vec<(i64, Bytes)>,
    rollbacks: Vec<Rollback>,
}

impl fmt::Debug for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskResult")
            .field("records", &self.records)
            .field("rollbacks", &self.rollbacks.len())
            .finish()
    }
}

impl TaskResult {
    pub fn records(&self) -> &[(i64, Bytes)] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<(i64, Bytes)>, Vec<Rollback>) {
        (self.records, self.rollbacks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_respects_max_batch_size() {
        let record_size = LoggedRecord::framed_size(4);
        let mut builder = TaskResultBuilder::new(record_size * 2);
        assert!(builder.append_record(1, Bytes::from_static(b"aaaa")));
        assert!(builder.append_record(2, Bytes::from_static(b"bbbb")));
        assert!(!builder.append_record(3, Bytes::from_static(b"c")));
        assert_eq!(builder.len(), 2);

        let result = builder.build();
        assert_eq!(result.records()[1].0, 2);
        assert!(builder.is_empty());
        assert!(builder.append_record(3, Bytes::from_static(b"cccc")));
    }

    #[test]
    fn test_rollbacks_travel_with_the_built_result() {
        let mut builder = TaskResultBuilder::new(1024);
        builder.append_record(1, Bytes::from_static(b"a"));
        builder.on_rejected(|| {});
        let (records, rollbacks) = builder.build().into_parts();
        assert_eq!(records.len(), 1);
        assert_eq!(rollbacks.len(), 1);
        let (_, rollbacks) = builder.build().into_parts();
        assert!(rollbacks.is_empty());
    }
}
