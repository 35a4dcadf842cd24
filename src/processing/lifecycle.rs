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

use super::{ActorClock, ProcessingScheduleService};

/// What a recovered stream processor hands to its lifecycle-aware components.
#[derive(Clone)]
pub struct ProcessingContext {
    pub partition_id: u32,
    /// Highest position found in the log during recovery, 0 for an empty log.
    pub last_position: i64,
    pub schedule_service: Arc<dyn ProcessingScheduleService>,
    pub clock: Arc<dyn ActorClock>,
}

/// Hooks invoked on the stream processor actor as it changes phase.
pub trait StreamProcessorLifecycleAware: Send + Sync {
    fn on_recovered(&self, _context: &ProcessingContext) {}

    fn on_paused(&self) {}

    fn on_resumed(&self) {}

    fn on_close(&self) {}
}
