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

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;

/// Source of "now" in epoch milliseconds for everything driven by a stream processor.
pub trait ActorClock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemActorClock;

impl ActorClock for SystemActorClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

const NOT_PINNED: i64 = i64::MIN;

/// Clock for tests: either pinned to a fixed instant or running with an offset from
/// the system clock.
#[derive(Debug)]
pub struct ControlledActorClock {
    pinned: AtomicI64,
    offset: AtomicI64,
}

impl Default for ControlledActorClock {
    fn default() -> Self {
        Self {
            pinned: AtomicI64::new(NOT_PINNED),
            offset: AtomicI64::new(0),
        }
    }
}

impl ControlledActorClock {
    pub fn pinned_at(millis: i64) -> Self {
        let clock = Self::default();
        clock.pin_at(millis);
        clock
    }

    pub fn pin_at(&self, millis: i64) {
        self.pinned.store(millis, Ordering::Release);
    }

    /// Moves time forward; a pinned clock stays pinned at the new instant.
    pub fn add_time(&self, duration: Duration) {
        let millis = duration.as_millis() as i64;
        let pinned = self.pinned.load(Ordering::Acquire);
        if pinned == NOT_PINNED {
            self.offset.fetch_add(millis, Ordering::AcqRel);
        } else {
            self.pinned.store(pinned + millis, Ordering::Release);
        }
    }

    pub fn reset(&self) {
        self.pinned.store(NOT_PINNED, Ordering::Release);
        self.offset.store(0, Ordering::Release);
    }
}

impl ActorClock for ControlledActorClock {
    fn now_millis(&self) -> i64 {
        match self.pinned.load(Ordering::Acquire) {
            NOT_PINNED => SystemActorClock.now_millis() + self.offset.load(Ordering::Acquire),
            pinned => pinned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controlled_clock() {
        let clock = ControlledActorClock::pinned_at(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.add_time(Duration::from_millis(250));
        assert_eq!(clock.now_millis(), 1_250);

        clock.reset();
        let before = SystemActorClock.now_millis();
        clock.add_time(Duration::from_secs(60));
        assert!(clock.now_millis() >= before + 60_000);
    }
}
