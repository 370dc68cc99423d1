use chrono::{DateTime, FixedOffset};
use log::{info, warn};

use crate::{
    hal::{ActuatorError, Clock, FeedActuator, ScheduleStore},
    horizon::{EventHorizon, Occurrence},
    schedule::Schedule,
};

/// Derived meta-state: mirrors whether the hardware alarm register currently
/// holds a pending wake time. Recomputed after every horizon mutation, never
/// stored independently of the occurrence set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmState {
    Armed(DateTime<FixedOffset>),
    Idle,
}

/// Owns the event horizon and the single hardware alarm register, dispatches
/// due feedings, and re-arms the next wake. Collaborators are injected so the
/// whole state machine runs against fakes in tests.
///
/// Ordering discipline on fire is load-bearing: clear the hardware flag,
/// drain every due event, then reprogram exactly once.
pub struct AlarmScheduler<C: Clock, A: FeedActuator> {
    clock: C,
    actuator: A,
    horizon: EventHorizon,
    state: ArmState,
}

impl<C: Clock, A: FeedActuator> AlarmScheduler<C, A> {
    pub fn new(clock: C, actuator: A) -> Self {
        Self {
            clock,
            actuator,
            horizon: EventHorizon::new(),
            state: ArmState::Idle,
        }
    }

    pub fn state(&self) -> ArmState {
        self.state
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn actuator_mut(&mut self) -> &mut A {
        &mut self.actuator
    }

    pub fn horizon(&self) -> &EventHorizon {
        &self.horizon
    }

    /// Rebuild the horizon from a fresh schedule snapshot and re-arm. Called
    /// once at boot and after every schedule mutation; components that write
    /// the schedule store are responsible for invoking this afterward.
    pub fn on_config_changed(&mut self, schedules: &[Schedule]) {
        let now = self.clock.now();
        self.horizon.generate(schedules, now);
        self.reprogram_alarm();
    }

    /// Reload the schedule snapshot from the store and rebuild. A store
    /// failure keeps the last-known-good horizon and armed alarm; it will be
    /// retried on the next config change.
    pub fn resync_from_store<S: ScheduleStore>(&mut self, store: &S) {
        match store.load_all() {
            Ok(schedules) => self.on_config_changed(&schedules),
            Err(err) => warn!("schedule store unavailable, keeping current horizon: {err}"),
        }
    }

    /// Main-loop entry point. The ISR only latches the fired flag; all
    /// horizon and register work happens here, synchronously.
    pub fn poll(&mut self) {
        if self.clock.alarm_fired() {
            self.on_alarm_fired();
            return;
        }

        // A failed set_alarm leaves us Idle with future work pending; retry
        // on the next natural trigger instead of giving up.
        if self.state == ArmState::Idle && self.horizon.next_future(self.clock.now()).is_some() {
            self.reprogram_alarm();
        }
    }

    /// Handle a fired hardware alarm: acknowledge the flag, dispatch every
    /// occurrence that is due by now (late wakes and near-simultaneous
    /// schedules included), then arm the next future event.
    pub fn on_alarm_fired(&mut self) {
        self.clock.clear_alarm_flag();

        let now = self.clock.now();
        while let Some(index) = self.horizon.next_due(now) {
            if let Some(event) = self.horizon.get(index).copied() {
                self.dispatch(&event);
            }
            // Consumed either way; a missed cycle beats an unbounded retry.
            self.horizon.invalidate(index);
        }

        self.reprogram_alarm();
    }

    /// Select the nearest future occurrence and program the hardware alarm
    /// for it, or clear the alarm when nothing is pending.
    pub fn reprogram_alarm(&mut self) {
        let now = self.clock.now();

        let Some(next) = self.horizon.next_future(now) else {
            if let Err(err) = self.clock.clear_alarm() {
                warn!("failed to clear rtc alarm: {err}");
            }
            self.state = ArmState::Idle;
            return;
        };

        let at = next.timestamp;
        let schedule_id = next.schedule_id;
        match self.clock.set_alarm(at) {
            Ok(()) => {
                info!("alarm armed for schedule {schedule_id} at {at}");
                self.state = ArmState::Armed(at);
            }
            Err(err) => {
                warn!("failed to program rtc alarm for {at}: {err}");
                self.state = ArmState::Idle;
            }
        }
    }

    fn dispatch(&mut self, event: &Occurrence) {
        if self.actuator.is_feeding() {
            warn!(
                "actuator busy, skipping feeding for schedule {}",
                event.schedule_id
            );
            return;
        }

        match self.actuator.feed(event.portion_units) {
            Ok(()) => info!(
                "dispatched feeding: schedule {} x{} portions",
                event.schedule_id, event.portion_units
            ),
            Err(ActuatorError::Busy) => warn!(
                "actuator rejected feeding for schedule {}: busy",
                event.schedule_id
            ),
            Err(err) => warn!(
                "feeding failed for schedule {}: {err}",
                event.schedule_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{ClockError, StoreError};
    use crate::schedule::{Schedule, MASK_DAILY};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn at(day: u32, hour: u32, minute: u32, second: u32) -> DateTime<FixedOffset> {
        FixedOffset::west_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, second)
            .unwrap()
    }

    fn schedule(id: u8, hour: u8, minute: u8, portions: u8) -> Schedule {
        Schedule {
            id,
            enabled: true,
            hour,
            minute,
            weekday_mask: MASK_DAILY,
            portion_units: portions,
        }
    }

    #[derive(Debug, Default)]
    struct FakeClockState {
        now: Option<DateTime<FixedOffset>>,
        alarm: Option<DateTime<FixedOffset>>,
        fired: bool,
        fail_set_alarm: bool,
        set_alarm_calls: usize,
        clear_alarm_calls: usize,
    }

    #[derive(Clone, Default)]
    struct FakeClock(Rc<RefCell<FakeClockState>>);

    impl FakeClock {
        fn new(now: DateTime<FixedOffset>) -> Self {
            let clock = Self::default();
            clock.0.borrow_mut().now = Some(now);
            clock
        }

        fn advance_to(&self, now: DateTime<FixedOffset>) {
            let mut state = self.0.borrow_mut();
            state.now = Some(now);
            if let Some(alarm) = state.alarm {
                if alarm <= now {
                    state.fired = true;
                }
            }
        }

        fn fire(&self) {
            self.0.borrow_mut().fired = true;
        }

        fn armed_at(&self) -> Option<DateTime<FixedOffset>> {
            self.0.borrow().alarm
        }

        fn set_alarm_calls(&self) -> usize {
            self.0.borrow().set_alarm_calls
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<FixedOffset> {
            self.0.borrow().now.expect("fake clock time not set")
        }

        fn set_alarm(&mut self, alarm: DateTime<FixedOffset>) -> Result<(), ClockError> {
            let mut state = self.0.borrow_mut();
            state.set_alarm_calls += 1;
            if state.fail_set_alarm {
                return Err(ClockError::Bus("i2c write failed".into()));
            }
            state.alarm = Some(alarm);
            Ok(())
        }

        fn clear_alarm(&mut self) -> Result<(), ClockError> {
            let mut state = self.0.borrow_mut();
            state.clear_alarm_calls += 1;
            state.alarm = None;
            Ok(())
        }

        fn alarm_fired(&self) -> bool {
            self.0.borrow().fired
        }

        fn clear_alarm_flag(&mut self) {
            self.0.borrow_mut().fired = false;
        }
    }

    #[derive(Clone, Default)]
    struct RecordingActuator {
        feeds: Rc<RefCell<Vec<u8>>>,
        busy: Rc<RefCell<bool>>,
    }

    impl RecordingActuator {
        fn feeds(&self) -> Vec<u8> {
            self.feeds.borrow().clone()
        }
    }

    impl FeedActuator for RecordingActuator {
        fn feed(&mut self, portion_units: u8) -> Result<(), ActuatorError> {
            if *self.busy.borrow() {
                return Err(ActuatorError::Busy);
            }
            self.feeds.borrow_mut().push(portion_units);
            Ok(())
        }

        fn is_feeding(&self) -> bool {
            *self.busy.borrow()
        }
    }

    fn scheduler(
        now: DateTime<FixedOffset>,
    ) -> (AlarmScheduler<FakeClock, RecordingActuator>, FakeClock, RecordingActuator) {
        let clock = FakeClock::new(now);
        let actuator = RecordingActuator::default();
        (
            AlarmScheduler::new(clock.clone(), actuator.clone()),
            clock,
            actuator,
        )
    }

    #[test]
    fn boot_scenario_arms_earliest_event() {
        // Monday Jan 5, 07:59:50; one daily schedule at 08:00.
        let now = at(5, 7, 59, 50);
        let (mut sched, clock, _) = scheduler(now);

        sched.on_config_changed(&[schedule(1, 8, 0, 1)]);

        assert_eq!(sched.horizon().valid_count(), 7);
        assert_eq!(clock.armed_at(), Some(at(5, 8, 0, 0)));
        assert_eq!(sched.state(), ArmState::Armed(at(5, 8, 0, 0)));
    }

    #[test]
    fn drain_dispatches_every_due_event_with_one_reprogram() {
        let now = at(5, 7, 0, 0);
        let (mut sched, clock, actuator) = scheduler(now);
        sched.on_config_changed(&[
            schedule(1, 7, 10, 1),
            schedule(2, 7, 20, 2),
            schedule(3, 7, 30, 3),
        ]);
        let arms_before = clock.set_alarm_calls();

        // Device woke late: all three of today's events are in the past.
        clock.advance_to(at(5, 7, 45, 0));
        sched.poll();

        assert_eq!(actuator.feeds(), vec![1, 2, 3]);
        assert!(!clock.alarm_fired());
        // Single reprogram after the drain, targeting tomorrow's earliest.
        assert_eq!(clock.set_alarm_calls(), arms_before + 1);
        assert_eq!(clock.armed_at(), Some(at(6, 7, 10, 0)));
    }

    #[test]
    fn rearm_after_drain_targets_next_future_event() {
        let now = at(5, 7, 0, 0);
        let (mut sched, clock, _) = scheduler(now);
        sched.on_config_changed(&[schedule(1, 7, 5, 1), schedule(2, 7, 6, 1), schedule(3, 9, 0, 1)]);

        clock.advance_to(at(5, 7, 6, 10));
        sched.poll();

        assert_eq!(sched.state(), ArmState::Armed(at(5, 9, 0, 0)));
        assert_eq!(clock.armed_at(), Some(at(5, 9, 0, 0)));
    }

    #[test]
    fn disabling_everything_goes_idle_and_clears_the_alarm() {
        let now = at(5, 7, 0, 0);
        let (mut sched, clock, _) = scheduler(now);
        sched.on_config_changed(&[schedule(1, 8, 0, 1)]);
        assert!(matches!(sched.state(), ArmState::Armed(_)));

        let mut disabled = schedule(1, 8, 0, 1);
        disabled.enabled = false;
        sched.on_config_changed(&[disabled]);

        assert_eq!(sched.state(), ArmState::Idle);
        assert_eq!(clock.armed_at(), None);
    }

    #[test]
    fn busy_actuator_consumes_the_event_without_retry() {
        let now = at(5, 7, 59, 0);
        let (mut sched, clock, actuator) = scheduler(now);
        sched.on_config_changed(&[schedule(1, 8, 0, 2)]);

        *actuator.busy.borrow_mut() = true;
        clock.advance_to(at(5, 8, 0, 5));
        sched.poll();

        assert_eq!(actuator.feeds(), Vec::<u8>::new());
        // The occurrence is gone; the next armed alarm is tomorrow's.
        assert_eq!(clock.armed_at(), Some(at(6, 8, 0, 0)));
    }

    #[test]
    fn set_alarm_failure_leaves_idle_and_poll_retries() {
        let now = at(5, 7, 0, 0);
        let (mut sched, clock, _) = scheduler(now);

        clock.0.borrow_mut().fail_set_alarm = true;
        sched.on_config_changed(&[schedule(1, 8, 0, 1)]);
        assert_eq!(sched.state(), ArmState::Idle);
        assert_eq!(clock.armed_at(), None);

        // Transient fault clears; the periodic poll re-arms without waiting
        // for another config change.
        clock.0.borrow_mut().fail_set_alarm = false;
        sched.poll();
        assert_eq!(sched.state(), ArmState::Armed(at(5, 8, 0, 0)));
    }

    #[test]
    fn spurious_fire_with_nothing_due_just_rearms() {
        let now = at(5, 7, 0, 0);
        let (mut sched, clock, actuator) = scheduler(now);
        sched.on_config_changed(&[schedule(1, 8, 0, 1)]);

        clock.fire();
        sched.poll();

        assert_eq!(actuator.feeds(), Vec::<u8>::new());
        assert!(!clock.alarm_fired());
        assert_eq!(sched.state(), ArmState::Armed(at(5, 8, 0, 0)));
    }

    struct MemoryStore {
        schedules: Vec<Schedule>,
        fail: bool,
    }

    impl ScheduleStore for MemoryStore {
        fn load_all(&self) -> Result<Vec<Schedule>, StoreError> {
            if self.fail {
                return Err(StoreError::Backend("nvs read failed".into()));
            }
            Ok(self.schedules.clone())
        }

        fn save(&mut self, index: usize, schedule: &Schedule) -> Result<(), StoreError> {
            let slot = self
                .schedules
                .get_mut(index)
                .ok_or(StoreError::IndexOutOfRange(index))?;
            *slot = *schedule;
            Ok(())
        }
    }

    #[test]
    fn store_failure_keeps_last_known_good_horizon() {
        let now = at(5, 7, 0, 0);
        let (mut sched, clock, _) = scheduler(now);
        let mut store = MemoryStore {
            schedules: vec![schedule(1, 8, 0, 1)],
            fail: false,
        };

        sched.resync_from_store(&store);
        assert_eq!(sched.state(), ArmState::Armed(at(5, 8, 0, 0)));

        store.fail = true;
        sched.resync_from_store(&store);

        // Horizon and armed alarm survive the transient store fault.
        assert_eq!(sched.state(), ArmState::Armed(at(5, 8, 0, 0)));
        assert_eq!(clock.armed_at(), Some(at(5, 8, 0, 0)));
        assert_eq!(sched.horizon().valid_count(), 7);
    }

    #[test]
    fn catch_up_after_long_sleep_dispatches_per_day_events_once() {
        let now = at(5, 7, 0, 0);
        let (mut sched, clock, actuator) = scheduler(now);
        sched.on_config_changed(&[schedule(1, 8, 0, 1)]);

        // Device slept through two whole days.
        clock.advance_to(at(7, 12, 0, 0));
        sched.poll();

        // Mon/Tue/Wed 08:00 are all due; each fires exactly once.
        assert_eq!(actuator.feeds(), vec![1, 1, 1]);
        assert_eq!(clock.armed_at(), Some(at(8, 8, 0, 0)));
    }

    #[test]
    fn rebuild_shortly_after_a_feed_does_not_resurrect_it() {
        let now = at(5, 7, 59, 0);
        let (mut sched, clock, actuator) = scheduler(now);
        let schedules = [schedule(1, 8, 0, 1)];
        sched.on_config_changed(&schedules);

        clock.advance_to(at(5, 8, 0, 5));
        sched.poll();
        assert_eq!(actuator.feeds(), vec![1]);

        // Config edit lands 30 seconds after the feeding just dispatched.
        clock.advance_to(at(5, 8, 0, 30));
        sched.on_config_changed(&schedules);

        assert_eq!(sched.horizon().next_due(at(5, 8, 0, 30)), None);
        assert_eq!(sched.state(), ArmState::Armed(at(6, 8, 0, 0)));

        sched.poll();
        assert_eq!(actuator.feeds(), vec![1]);
    }
}
