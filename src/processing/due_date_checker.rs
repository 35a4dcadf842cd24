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

//! Recurring wake-up for entities with due dates (timers, retry backoffs, ...).
//!
//! A single probe is outstanding for all entities of one kind. The probe calls the
//! supplied function, which triggers everything currently due and returns the next
//! known due date; the checker then sleeps until that date, but never for less than
//! the timer resolution. Probes are hints, not a queue: a superseded probe still fires
//! and finds nothing due, so probes are never cancelled.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{
    ActorClock, ProcessingContext, ProcessingScheduleService, StreamProcessorLifecycleAware,
    TaskResultBuilder,
};

/// Sentinel for "no due date known".
pub const NO_DUE_DATE: i64 = -1;

/// Triggers all due entities and returns the next due date, or a value `<= 0` when
/// nothing is pending.
pub type NextDueDateSupplier = dyn Fn(&mut TaskResultBuilder) -> i64 + Send + Sync;

struct CheckerState {
    name: String,
    timer_resolution: Duration,
    next_due_date_supplier: Box<NextDueDateSupplier>,
    clock: Arc<dyn ActorClock>,
    schedule_service: RwLock<Option<Arc<dyn ProcessingScheduleService>>>,
    next_due_date: AtomicI64,
    checker_running: AtomicBool,
    should_reschedule: AtomicBool,
}

#[derive(Clone)]
pub struct DueDateChecker {
    state: Arc<CheckerState>,
}

impl fmt::Debug for DueDateChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DueDateChecker")
            .field("name", &self.state.name)
            .field("next_due_date", &self.next_due_date())
            .field("checker_running", &self.is_checker_running())
            .field("should_reschedule", &self.should_reschedule())
            .finish()
    }
}

impl DueDateChecker {
    pub fn new<F>(
        name: &str,
        timer_resolution: Duration,
        clock: Arc<dyn ActorClock>,
        next_due_date_supplier: F,
    ) -> Self
    where
        F: Fn(&mut TaskResultBuilder) -> i64 + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(CheckerState {
                name: name.to_string(),
                timer_resolution,
                next_due_date_supplier: Box::new(next_due_date_supplier),
                clock,
                schedule_service: RwLock::new(None),
                next_due_date: AtomicI64::new(NO_DUE_DATE),
                checker_running: AtomicBool::new(false),
                should_reschedule: AtomicBool::new(false),
            }),
        }
    }

    pub fn next_due_date(&self) -> i64 {
        self.state.next_due_date.load(Ordering::Acquire)
    }

    pub fn is_checker_running(&self) -> bool {
        self.state.checker_running.load(Ordering::Acquire)
    }

    pub fn should_reschedule(&self) -> bool {
        self.state.should_reschedule.load(Ordering::Acquire)
    }

    /// Registers a new due date. Schedules a probe when none is outstanding, or when
    /// `due_date` is earlier than the outstanding one by more than the resolution.
    pub fn schedule(&self, due_date: i64) {
        self.state.schedule(due_date);
    }

    /// `max(due_date - now, timer_resolution)`.
    pub fn calculate_delay_for_next_run(&self, due_date: i64) -> Duration {
        self.state.calculate_delay_for_next_run(due_date)
    }
}

impl CheckerState {
    fn schedule(self: &Arc<Self>, due_date: i64) {
        if !self.should_reschedule.load(Ordering::Acquire) {
            trace!("{} checker paused, ignoring due date {}", self.name, due_date);
            return;
        }
        let resolution = self.timer_resolution.as_millis() as i64;
        let running = self.checker_running.load(Ordering::Acquire);
        let next_due_date = self.next_due_date.load(Ordering::Acquire);
        if !running || next_due_date.saturating_sub(due_date) > resolution {
            self.schedule_probe(self.calculate_delay_for_next_run(due_date), due_date);
        }
    }

    fn calculate_delay_for_next_run(&self, due_date: i64) -> Duration {
        let remaining = due_date.saturating_sub(self.clock.now_millis());
        if remaining <= 0 {
            return self.timer_resolution;
        }
        Duration::from_millis(remaining as u64).max(self.timer_resolution)
    }

    fn schedule_probe(self: &Arc<Self>, delay: Duration, due_date: i64) {
        let Some(service) = self.schedule_service.read().clone() else {
            debug!("{} checker has no schedule service yet", self.name);
            return;
        };
        self.next_due_date.store(due_date, Ordering::Release);
        self.checker_running.store(true, Ordering::Release);
        trace!(
            "{} checker probes in {}ms for due date {}",
            self.name,
            delay.as_millis(),
            due_date
        );
        let state = Arc::clone(self);
        service.run_delayed(
            delay,
            Box::new(move |builder: &mut TaskResultBuilder| {
                state.trigger_entities(builder);
                builder.build()
            }),
        );
    }

    fn trigger_entities(self: &Arc<Self>, builder: &mut TaskResultBuilder) {
        if !self.should_reschedule.load(Ordering::Acquire) {
            self.checker_running.store(false, Ordering::Release);
            return;
        }
        let next_due_date = (self.next_due_date_supplier)(builder);
        if !builder.is_empty() {
            // entities triggered by a rejected batch are due again right away
            let state = Arc::clone(self);
            builder.on_rejected(move || {
                debug!("{} checker output was rejected, probing again", state.name);
                state.schedule(state.clock.now_millis());
            });
        }
        if next_due_date > 0 {
            self.schedule_probe(self.calculate_delay_for_next_run(next_due_date), next_due_date);
        } else {
            self.next_due_date.store(next_due_date, Ordering::Release);
            self.checker_running.store(false, Ordering::Release);
        }
    }
}

impl StreamProcessorLifecycleAware for DueDateChecker {
    fn on_recovered(&self, context: &ProcessingContext) {
        *self.state.schedule_service.write() = Some(Arc::clone(&context.schedule_service));
        self.state.should_reschedule.store(true, Ordering::Release);
        // catch up on everything that became due while not running
        self.state.schedule_probe(Duration::ZERO, NO_DUE_DATE);
    }

    fn on_paused(&self) {
        self.state.should_reschedule.store(false, Ordering::Release);
        self.state.next_due_date.store(NO_DUE_DATE, Ordering::Release);
    }

    fn on_resumed(&self) {
        self.state.should_reschedule.store(true, Ordering::Release);
        if !self.is_checker_running() {
            self.state.schedule_probe(Duration::ZERO, NO_DUE_DATE);
        }
    }

    fn on_close(&self) {
        self.state.should_reschedule.store(false, Ordering::Release);
        self.state.schedule_service.write().take();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use bytes::Bytes;
    use parking_lot::Mutex;
    use rstest::{fixture, rstest};

    use super::*;
    use crate::processing::{ControlledActorClock, Task};

    const RESOLUTION: Duration = Duration::from_millis(50);
    const NOW: i64 = 10_000;

    /// Keeps scheduled tasks until the test runs them.
    #[derive(Default)]
    struct ManualScheduler {
        tasks: Mutex<VecDeque<(Duration, Task)>>,
    }

    impl ManualScheduler {
        fn delays(&self) -> Vec<Duration> {
            self.tasks.lock().iter().map(|(delay, _)| *delay).collect()
        }

        /// Runs the oldest task and returns the records it produced.
        fn run_next(&self) -> Option<Vec<(i64, Bytes)>> {
            self.run_next_rejected(false)
        }

        /// Runs the oldest task; with `rejected` its batch is treated as refused by
        /// the log.
        fn run_next_rejected(&self, rejected: bool) -> Option<Vec<(i64, Bytes)>> {
            let (_, task) = self.tasks.lock().pop_front()?;
            let mut builder = TaskResultBuilder::new(1024);
            let (records, rollbacks) = task(&mut builder).into_parts();
            if rejected {
                rollbacks.into_iter().for_each(|rollback| rollback());
            }
            Some(records)
        }
    }

    impl ProcessingScheduleService for ManualScheduler {
        fn run_delayed(&self, delay: Duration, task: Task) {
            self.tasks.lock().push_back((delay, task));
        }

        fn run(&self, task: Task) {
            self.run_delayed(Duration::ZERO, task);
        }
    }

    struct Harness {
        checker: DueDateChecker,
        scheduler: Arc<ManualScheduler>,
        clock: Arc<ControlledActorClock>,
        calls: Arc<AtomicUsize>,
        /// Due dates returned by consecutive supplier calls, then `-1`.
        due_dates: Arc<Mutex<VecDeque<i64>>>,
    }

    impl Harness {
        fn recover(&self) {
            self.checker.on_recovered(&ProcessingContext {
                partition_id: 1,
                last_position: 0,
                schedule_service: self.scheduler.clone(),
                clock: self.clock.clone(),
            });
        }
    }

    #[fixture]
    fn harness() -> Harness {
        let scheduler = Arc::new(ManualScheduler::default());
        let clock = Arc::new(ControlledActorClock::pinned_at(NOW));
        let calls = Arc::new(AtomicUsize::new(0));
        let due_dates = Arc::new(Mutex::new(VecDeque::new()));
        let checker = {
            let calls = calls.clone();
            let due_dates = due_dates.clone();
            DueDateChecker::new("timers", RESOLUTION, clock.clone(), move |builder| {
                let call = calls.fetch_add(1, Ordering::SeqCst) as i64;
                builder.append_record(call, Bytes::from_static(b"triggered"));
                due_dates.lock().pop_front().unwrap_or(NO_DUE_DATE)
            })
        };
        Harness {
            checker,
            scheduler,
            clock,
            calls,
            due_dates,
        }
    }

    #[rstest]
    #[case::in_the_past(NOW - 5_000, RESOLUTION)]
    #[case::now(NOW, RESOLUTION)]
    #[case::below_resolution(NOW + 20, RESOLUTION)]
    #[case::future(NOW + 700, Duration::from_millis(700))]
    fn test_delay_has_resolution_floor(
        harness: Harness,
        #[case] due_date: i64,
        #[case] expected: Duration,
    ) {
        assert_eq!(harness.checker.calculate_delay_for_next_run(due_date), expected);
    }

    #[rstest]
    fn test_schedule_before_recovery_is_ignored(harness: Harness) {
        harness.checker.schedule(NOW + 100);
        assert!(harness.scheduler.delays().is_empty());
        assert_eq!(harness.checker.next_due_date(), NO_DUE_DATE);
    }

    #[rstest]
    fn test_recovery_probes_immediately(harness: Harness) {
        harness.due_dates.lock().push_back(NOW - 1_000);
        harness.recover();
        assert_eq!(harness.scheduler.delays(), vec![Duration::ZERO]);
        assert!(harness.checker.is_checker_running());

        let records = harness.scheduler.run_next().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(harness.calls.load(Ordering::SeqCst), 1);
        // overdue entity reported again: next probe after exactly one resolution
        assert_eq!(harness.scheduler.delays(), vec![RESOLUTION]);
        assert_eq!(harness.checker.next_due_date(), NOW - 1_000);
    }

    #[rstest]
    fn test_nearby_due_date_does_not_reschedule(harness: Harness) {
        harness.recover();
        harness.scheduler.run_next();
        assert!(!harness.checker.is_checker_running());

        harness.checker.schedule(NOW + 1_000);
        harness.checker.schedule(NOW + 1_005);
        assert_eq!(harness.scheduler.delays(), vec![Duration::from_millis(1_000)]);
        assert_eq!(harness.checker.next_due_date(), NOW + 1_000);
    }

    #[rstest]
    fn test_much_earlier_due_date_adds_probe(harness: Harness) {
        harness.recover();
        harness.scheduler.run_next();
        harness.checker.schedule(NOW + 1_000);
        harness.checker.schedule(NOW + 900);
        assert_eq!(
            harness.scheduler.delays(),
            vec![Duration::from_millis(1_000), Duration::from_millis(900)]
        );
        assert_eq!(harness.checker.next_due_date(), NOW + 900);
    }

    #[rstest]
    fn test_paused_probe_goes_idle_without_calling_supplier(harness: Harness) {
        harness.recover();
        harness.scheduler.run_next();
        harness.checker.schedule(NOW + 1_000);
        let calls = harness.calls.load(Ordering::SeqCst);

        harness.checker.on_paused();
        assert_eq!(harness.checker.next_due_date(), NO_DUE_DATE);
        let records = harness.scheduler.run_next().unwrap();
        assert!(records.is_empty());
        assert_eq!(harness.calls.load(Ordering::SeqCst), calls);
        assert!(!harness.checker.is_checker_running());
        assert!(harness.scheduler.delays().is_empty());
    }

    #[rstest]
    fn test_schedule_while_paused_is_ignored(harness: Harness) {
        harness.recover();
        harness.scheduler.run_next();
        harness.checker.on_paused();
        harness.checker.schedule(NOW + 1_000);
        assert!(harness.scheduler.delays().is_empty());
        assert_eq!(harness.checker.next_due_date(), NO_DUE_DATE);
    }

    #[rstest]
    fn test_resume_probes_only_when_idle(harness: Harness) {
        harness.recover();
        harness.checker.on_paused();
        // the recovery probe is still outstanding
        harness.checker.on_resumed();
        assert_eq!(harness.scheduler.delays(), vec![Duration::ZERO]);

        harness.scheduler.run_next();
        assert!(!harness.checker.is_checker_running());
        harness.checker.on_paused();
        harness.clock.add_time(Duration::from_secs(3_600));
        harness.checker.on_resumed();
        assert_eq!(harness.scheduler.delays(), vec![Duration::ZERO]);
        harness.scheduler.run_next();
        assert_eq!(harness.calls.load(Ordering::SeqCst), 2);
    }

    #[rstest]
    fn test_close_stops_rescheduling(harness: Harness) {
        harness.due_dates.lock().push_back(NOW + 100);
        harness.recover();
        harness.checker.on_close();
        harness.scheduler.run_next();
        assert_eq!(harness.calls.load(Ordering::SeqCst), 0);
        harness.checker.schedule(NOW + 10);
        assert!(harness.scheduler.delays().is_empty());
    }

    #[rstest]
    fn test_extreme_due_date_does_not_overflow(harness: Harness) {
        harness.recover();
        harness.scheduler.run_next();
        harness.checker.schedule(NOW + 1_000);
        harness.checker.schedule(i64::MIN);
        assert_eq!(
            harness.scheduler.delays(),
            vec![Duration::from_millis(1_000), RESOLUTION]
        );
        assert_eq!(harness.checker.next_due_date(), i64::MIN);
    }

    #[rstest]
    fn test_rejected_output_schedules_another_check(harness: Harness) {
        harness.recover();
        let records = harness.scheduler.run_next_rejected(true).unwrap();
        assert_eq!(records.len(), 1);
        // nothing else pending, yet the rejected entities are probed again
        assert!(harness.checker.is_checker_running());
        assert_eq!(harness.scheduler.delays(), vec![RESOLUTION]);

        harness.scheduler.run_next();
        assert_eq!(harness.calls.load(Ordering::SeqCst), 2);
        assert!(!harness.checker.is_checker_running());
    }
}
