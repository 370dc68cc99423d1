use chrono::{DateTime, Duration, FixedOffset};
use log::debug;

use crate::schedule::Schedule;

/// Days of future occurrences materialized per rebuild.
pub const HORIZON_DAYS: i64 = 7;

/// Fixed slot budget; must cover the worst case of every schedule firing
/// every day inside the horizon (7 x 6 = 42).
pub const EVENT_CAPACITY: usize = 50;

/// One concrete future firing of one schedule. Owned exclusively by the
/// horizon; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub timestamp: DateTime<FixedOffset>,
    pub schedule_id: u8,
    pub portion_units: u8,
    pub valid: bool,
}

/// Bounded set of upcoming occurrences, fully rebuilt on every configuration
/// or time change. Pure bookkeeping: nothing here touches the alarm register.
#[derive(Debug, Default)]
pub struct EventHorizon {
    events: Vec<Occurrence>,
}

impl EventHorizon {
    pub fn new() -> Self {
        Self {
            events: Vec::with_capacity(EVENT_CAPACITY),
        }
    }

    /// Discard the previous set and materialize every strictly future
    /// occurrence of every enabled schedule within [`HORIZON_DAYS`] of `now`,
    /// capped at [`EVENT_CAPACITY`]. Occurrences copy `portion_units` at
    /// generation time, so a later schedule edit cannot retroactively change
    /// a queued event without a rebuild.
    pub fn generate(&mut self, schedules: &[Schedule], now: DateTime<FixedOffset>) {
        self.events.clear();
        let end = now + Duration::days(HORIZON_DAYS);

        for schedule in schedules.iter().filter(|s| s.enabled) {
            let mut from = now;
            while self.events.len() < EVENT_CAPACITY {
                let Some(timestamp) = schedule.next_occurrence(from) else {
                    break;
                };
                if timestamp > end {
                    break;
                }

                // The grace window can hand back an instant just behind
                // `now`; a rebuild must not resurrect it, it was already
                // handled (or missed) before the rebuild.
                if timestamp > now {
                    self.events.push(Occurrence {
                        timestamp,
                        schedule_id: schedule.id,
                        portion_units: schedule.portion_units,
                        valid: true,
                    });
                }

                // One firing per schedule per calendar day.
                from = timestamp + Duration::days(1);
            }
        }

        debug!("horizon rebuilt: {} events", self.events.len());
    }

    /// Earliest valid occurrence strictly after `now`; ties broken by lowest
    /// schedule id for determinism.
    pub fn next_future(&self, now: DateTime<FixedOffset>) -> Option<&Occurrence> {
        self.events
            .iter()
            .filter(|e| e.valid && e.timestamp > now)
            .min_by_key(|e| (e.timestamp, e.schedule_id))
    }

    /// Earliest valid occurrence at or before `now`, if any.
    pub fn next_due(&self, now: DateTime<FixedOffset>) -> Option<usize> {
        self.events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.valid && e.timestamp <= now)
            .min_by_key(|(_, e)| (e.timestamp, e.schedule_id))
            .map(|(index, _)| index)
    }

    pub fn get(&self, index: usize) -> Option<&Occurrence> {
        self.events.get(index)
    }

    /// Consume a slot once its feeding has been dispatched (or skipped).
    pub fn invalidate(&mut self, index: usize) {
        if let Some(event) = self.events.get_mut(index) {
            event.valid = false;
        }
    }

    pub fn valid_count(&self) -> usize {
        self.events.iter().filter(|e| e.valid).count()
    }

    pub fn iter_valid(&self) -> impl Iterator<Item = &Occurrence> {
        self.events.iter().filter(|e| e.valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{MASK_DAILY, MASK_WEEKEND};
    use chrono::{Datelike, TimeZone};
    use pretty_assertions::assert_eq;

    fn at(day: u32, hour: u32, minute: u32, second: u32) -> DateTime<FixedOffset> {
        FixedOffset::west_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, second)
            .unwrap()
    }

    fn schedule(id: u8, hour: u8, minute: u8, mask: u8) -> Schedule {
        Schedule {
            id,
            enabled: true,
            hour,
            minute,
            weekday_mask: mask,
            portion_units: 1,
        }
    }

    #[test]
    fn daily_schedule_fills_the_week() {
        let mut horizon = EventHorizon::new();
        // Monday Jan 5, just before 08:00.
        let now = at(5, 7, 59, 50);
        horizon.generate(&[schedule(1, 8, 0, MASK_DAILY)], now);

        assert_eq!(horizon.valid_count(), 7);
        let first = horizon.next_future(now).unwrap();
        assert_eq!(first.timestamp, at(5, 8, 0, 0));
    }

    #[test]
    fn occurrences_never_exceed_the_horizon() {
        let mut horizon = EventHorizon::new();
        let now = at(5, 7, 59, 50);
        horizon.generate(&[schedule(1, 8, 0, MASK_DAILY)], now);

        let end = now + Duration::days(HORIZON_DAYS);
        assert!(horizon.iter_valid().all(|e| e.timestamp <= end));
    }

    #[test]
    fn no_two_occurrences_share_a_day() {
        let mut horizon = EventHorizon::new();
        horizon.generate(&[schedule(3, 12, 0, MASK_DAILY)], at(5, 0, 0, 0));

        let mut days: Vec<_> = horizon
            .iter_valid()
            .map(|e| (e.schedule_id, e.timestamp.ordinal()))
            .collect();
        days.sort_unstable();
        days.dedup();
        assert_eq!(days.len(), horizon.valid_count());
    }

    #[test]
    fn disabled_schedules_contribute_nothing() {
        let mut disabled = schedule(2, 8, 0, MASK_DAILY);
        disabled.enabled = false;

        let mut horizon = EventHorizon::new();
        horizon.generate(&[disabled], at(5, 0, 0, 0));
        assert_eq!(horizon.valid_count(), 0);
        assert!(horizon.next_future(at(5, 0, 0, 0)).is_none());
    }

    #[test]
    fn rebuild_replaces_previous_events() {
        let mut horizon = EventHorizon::new();
        let now = at(5, 0, 0, 0);
        horizon.generate(&[schedule(1, 8, 0, MASK_DAILY)], now);
        assert_eq!(horizon.valid_count(), 7);

        horizon.generate(&[schedule(1, 8, 0, MASK_WEEKEND)], now);
        assert_eq!(horizon.valid_count(), 2);
        assert!(horizon
            .iter_valid()
            .all(|e| matches!(e.timestamp.weekday().num_days_from_sunday(), 0 | 6)));
    }

    #[test]
    fn due_ties_resolve_to_lowest_schedule_id() {
        let mut horizon = EventHorizon::new();
        horizon.generate(
            &[schedule(4, 8, 0, MASK_DAILY), schedule(2, 8, 0, MASK_DAILY)],
            at(5, 7, 0, 0),
        );

        let due = horizon.next_due(at(5, 8, 0, 30)).unwrap();
        assert_eq!(horizon.get(due).unwrap().schedule_id, 2);
    }

    #[test]
    fn rebuild_within_grace_skips_the_just_past_instant() {
        let mut horizon = EventHorizon::new();
        // 08:00 is 30 seconds gone; a rebuild now must not bring it back.
        let now = at(5, 8, 0, 30);
        horizon.generate(&[schedule(1, 8, 0, MASK_DAILY)], now);

        assert_eq!(horizon.next_due(now), None);
        assert_eq!(horizon.next_future(now).unwrap().timestamp, at(6, 8, 0, 0));
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let schedules: Vec<Schedule> = (1..=12)
            .map(|id| schedule(id, 8, 0, MASK_DAILY))
            .collect();

        let mut horizon = EventHorizon::new();
        horizon.generate(&schedules, at(5, 0, 0, 0));
        assert!(horizon.valid_count() <= EVENT_CAPACITY);
    }
}
