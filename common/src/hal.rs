use chrono::{DateTime, FixedOffset};
use thiserror::Error;

use crate::schedule::Schedule;

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("rtc bus transaction failed: {0}")]
    Bus(String),
    #[error("rtc reported an invalid time")]
    InvalidTime,
    #[error("requested alarm instant is not representable")]
    UnrepresentableAlarm,
}

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("feed already in progress")]
    Busy,
    #[error("actuator hardware fault: {0}")]
    Hardware(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schedule index {0} out of range")]
    IndexOutOfRange(usize),
    #[error("storage backend failed: {0}")]
    Backend(String),
}

/// Wall-clock time source with a single pending hardware alarm register and a
/// latched fired flag. Models the DS3231 Alarm 1 contract: one alarm armed at
/// a time, a flag that is set on match (possibly from an ISR) and stays set
/// until explicitly cleared.
pub trait Clock {
    fn now(&self) -> DateTime<FixedOffset>;

    /// Program the hardware alarm for `at`, replacing any pending alarm.
    fn set_alarm(&mut self, at: DateTime<FixedOffset>) -> Result<(), ClockError>;

    /// Disable the alarm entirely.
    fn clear_alarm(&mut self) -> Result<(), ClockError>;

    /// Poll the latched alarm-fired flag. Reading does not clear it.
    fn alarm_fired(&self) -> bool;

    /// Acknowledge the fired flag. Must happen before draining due events so
    /// a trigger arriving mid-drain is not silently coalesced away.
    fn clear_alarm_flag(&mut self);
}

/// Physical dispenser. `feed` starts the servo/relay sequence; completion is
/// tracked by the implementation, not awaited here.
pub trait FeedActuator {
    fn feed(&mut self, portion_units: u8) -> Result<(), ActuatorError>;
    fn is_feeding(&self) -> bool;
}

/// Durable schedule slots, CRUD by index.
pub trait ScheduleStore {
    fn load_all(&self) -> Result<Vec<Schedule>, StoreError>;
    fn save(&mut self, index: usize, schedule: &Schedule) -> Result<(), StoreError>;
}
