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

//! Cooperative processing on top of a partition's log: one actor per partition runs
//! scheduled tasks strictly one after another and appends what they produce.

mod clock;
mod due_date_checker;
mod lifecycle;
mod log_stream_writer;
mod schedule_service;
mod stream_processor;

pub use clock::{ActorClock, ControlledActorClock, SystemActorClock};
pub use due_date_checker::{DueDateChecker, NextDueDateSupplier, NO_DUE_DATE};
pub use lifecycle::{ProcessingContext, StreamProcessorLifecycleAware};
pub use log_stream_writer::LogStreamWriter;
pub use schedule_service::{
    ProcessingScheduleService, Rollback, Task, TaskResult, TaskResultBuilder,
};
pub use stream_processor::{Phase, StreamProcessor};
