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

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::processing::{TaskResultBuilder, NO_DUE_DATE};
use crate::storage::LogStorage;

pub const TIMER_CREATED: &[u8] = b"TIMER_CREATED";
pub const TIMER_TRIGGERED: &[u8] = b"TIMER_TRIGGERED";

/// What a timer record in the log says happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerIntent {
    Created,
    Triggered,
}

impl TimerIntent {
    fn tag(self) -> &'static [u8] {
        match self {
            TimerIntent::Created => TIMER_CREATED,
            TimerIntent::Triggered => TIMER_TRIGGERED,
        }
    }

    /// Record value: the intent tag followed by the big endian due date.
    pub fn encode(self, due_date: i64) -> Bytes {
        let tag = self.tag();
        let mut buf = BytesMut::with_capacity(tag.len() + 8);
        buf.put_slice(tag);
        buf.put_i64(due_date);
        buf.freeze()
    }

    pub fn decode(value: &[u8]) -> Option<(TimerIntent, i64)> {
        [TimerIntent::Created, TimerIntent::Triggered]
            .into_iter()
            .find_map(|intent| {
                let due_date = value.strip_prefix(intent.tag())?;
                let due_date: [u8; 8] = due_date.try_into().ok()?;
                Some((intent, i64::from_be_bytes(due_date)))
            })
    }
}

type PendingTimers = Arc<Mutex<BTreeSet<(i64, u64)>>>;

/// Timers of the demo workload, ordered by due date.
///
/// Creating and triggering change the store right away; both register a rollback so
/// the change is undone when the log refuses the records describing it.
#[derive(Debug, Default)]
pub struct TimerStore {
    next_key: AtomicU64,
    pending: PendingTimers,
}

impl TimerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the pending timers from the timer records already in the log and
    /// returns how many are pending.
    pub fn recover(&self, storage: &dyn LogStorage) -> usize {
        let mut reader = storage.new_uncommitted_reader();
        let mut pending = self.pending.lock();
        pending.clear();
        let mut last_key = 0;
        while let Some(block) = reader.next() {
            for record in block.records() {
                let record = match record {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("skipping the rest of block {}: {}", block.index, e);
                        break;
                    }
                };
                let Some((intent, due_date)) = TimerIntent::decode(&record.value) else {
                    continue;
                };
                let key = record.key as u64;
                last_key = last_key.max(key);
                match intent {
                    TimerIntent::Created => pending.insert((due_date, key)),
                    TimerIntent::Triggered => pending.remove(&(due_date, key)),
                };
            }
        }
        reader.close();
        self.next_key.fetch_max(last_key, Ordering::Relaxed);
        pending.len()
    }

    /// Adds a timer and the record announcing it. Returns the timer key, or `None`
    /// when the record does not fit the batch.
    pub fn create(&self, due_date: i64, builder: &mut TaskResultBuilder) -> Option<u64> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed) + 1;
        if !builder.append_record(key as i64, TimerIntent::Created.encode(due_date)) {
            return None;
        }
        self.pending.lock().insert((due_date, key));
        let pending = Arc::clone(&self.pending);
        builder.on_rejected(move || {
            pending.lock().remove(&(due_date, key));
        });
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Writes a trigger record for every timer due at `now` and returns the due date of
    /// the earliest remaining timer. Timers that no longer fit the batch stay pending
    /// and are reported as due at `now`.
    pub fn trigger_due(&self, now: i64, builder: &mut TaskResultBuilder) -> i64 {
        let mut pending = self.pending.lock();
        let mut triggered = Vec::new();
        let mut next_due_date = NO_DUE_DATE;
        while let Some(&(due_date, key)) = pending.first() {
            if due_date > now {
                next_due_date = due_date;
                break;
            }
            if !builder.append_record(key as i64, TimerIntent::Triggered.encode(due_date)) {
                next_due_date = now;
                break;
            }
            trace!("timer {} due at {} triggered at {}", key, due_date, now);
            pending.pop_first();
            triggered.push((due_date, key));
        }
        if !triggered.is_empty() {
            let pending = Arc::clone(&self.pending);
            builder.on_rejected(move || {
                let mut pending = pending.lock();
                for timer in triggered {
                    trace!("timer {} is pending again", timer.1);
                    pending.insert(timer);
                }
            });
        }
        next_due_date
    }
}
