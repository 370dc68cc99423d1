use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};

/// Maximum schedule slots the store exposes.
pub const MAX_SCHEDULES: usize = 6;

/// Alarms that fire slightly after their target minute are still honored as
/// "due now" instead of being pushed out a whole day.
pub const GRACE_SECONDS: i64 = 60;

/// Weekday mask convention: bit 0 = Sunday .. bit 6 = Saturday, matching
/// `chrono::Weekday::num_days_from_sunday`.
pub const MASK_DAILY: u8 = 0b0111_1111;
pub const MASK_WEEKDAYS: u8 = 0b0011_1110;
pub const MASK_WEEKEND: u8 = 0b0100_0001;

/// A recurring feeding rule. Read-only to the scheduling core; edits happen
/// through the configuration surface and are followed by a horizon rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: u8,
    pub enabled: bool,
    pub hour: u8,
    pub minute: u8,
    #[serde(rename = "weekdayMask")]
    pub weekday_mask: u8,
    #[serde(rename = "portionUnits")]
    pub portion_units: u8,
}

impl Schedule {
    pub fn validate(&self) -> bool {
        self.id > 0 && self.hour < 24 && self.minute < 60 && self.portion_units > 0
    }

    pub fn is_active_on(&self, weekday_from_sunday: u32) -> bool {
        self.weekday_mask & (1 << (weekday_from_sunday % 7)) != 0
    }

    /// Next instant this schedule is due at or after `from`, honoring the
    /// grace window: a candidate up to [`GRACE_SECONDS`] in the past still
    /// counts as due. Returns `None` for disabled schedules, invalid fields,
    /// or an all-zero weekday mask.
    pub fn next_occurrence(&self, from: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        if !self.enabled || !self.validate() {
            return None;
        }

        let time = NaiveTime::from_hms_opt(self.hour as u32, self.minute as u32, 0)?;
        let naive = from.date_naive().and_time(time);
        let mut candidate = from.offset().from_local_datetime(&naive).single()?;

        if candidate + Duration::seconds(GRACE_SECONDS) < from {
            candidate += Duration::days(1);
        }

        for _ in 0..7 {
            if self.is_active_on(candidate.weekday().num_days_from_sunday()) {
                return Some(candidate);
            }
            candidate += Duration::days(1);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn schedule(hour: u8, minute: u8, mask: u8) -> Schedule {
        Schedule {
            id: 1,
            enabled: true,
            hour,
            minute,
            weekday_mask: mask,
            portion_units: 2,
        }
    }

    fn at(day: u32, hour: u32, minute: u32, second: u32) -> DateTime<FixedOffset> {
        // January 2026: the 5th is a Monday.
        FixedOffset::west_opt(8 * 3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, second)
            .unwrap()
    }

    #[test]
    fn candidate_within_grace_stays_today() {
        let daily = schedule(8, 0, MASK_DAILY);
        let next = daily.next_occurrence(at(5, 8, 0, 30)).unwrap();
        assert_eq!(next, at(5, 8, 0, 0));
    }

    #[test]
    fn candidate_past_grace_moves_to_tomorrow() {
        let daily = schedule(8, 0, MASK_DAILY);
        let next = daily.next_occurrence(at(5, 8, 2, 0)).unwrap();
        assert_eq!(next, at(6, 8, 0, 0));
    }

    #[test]
    fn walks_forward_to_masked_weekday() {
        // Tuesday only (bit 2); from Wednesday the hit is six days out.
        let tuesday_only = schedule(9, 30, 1 << 2);
        let next = tuesday_only.next_occurrence(at(7, 12, 0, 0)).unwrap();
        assert_eq!(next, at(13, 9, 30, 0));
    }

    #[test]
    fn empty_mask_yields_nothing() {
        assert_eq!(schedule(8, 0, 0).next_occurrence(at(5, 0, 0, 0)), None);
    }

    #[test]
    fn disabled_schedule_yields_nothing() {
        let mut daily = schedule(8, 0, MASK_DAILY);
        daily.enabled = false;
        assert_eq!(daily.next_occurrence(at(5, 0, 0, 0)), None);
    }

    #[test]
    fn zero_portions_is_rejected() {
        let mut daily = schedule(8, 0, MASK_DAILY);
        daily.portion_units = 0;
        assert!(!daily.validate());
        assert_eq!(daily.next_occurrence(at(5, 0, 0, 0)), None);
    }

    #[test]
    fn deterministic_for_identical_inputs() {
        let weekdays = schedule(6, 15, MASK_WEEKDAYS);
        let from = at(10, 3, 0, 0); // Saturday
        assert_eq!(weekdays.next_occurrence(from), weekdays.next_occurrence(from));
        assert_eq!(weekdays.next_occurrence(from).unwrap(), at(12, 6, 15, 0));
    }

    #[test]
    fn serde_uses_camel_case_names() {
        let daily = schedule(8, 0, MASK_DAILY);
        let json = serde_json::to_string(&daily).unwrap();
        assert!(json.contains("weekdayMask"));
        assert!(json.contains("portionUnits"));
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, daily);
    }
}
