pub mod alarm;
pub mod button;
pub mod config;
pub mod hal;
pub mod horizon;
pub mod schedule;
pub mod types;

pub use alarm::{AlarmScheduler, ArmState};
pub use button::DebouncedButton;
pub use config::{default_schedules, FeederConfig, NetworkConfig, RuntimeConfig};
pub use hal::{ActuatorError, Clock, ClockError, FeedActuator, ScheduleStore, StoreError};
pub use horizon::{EventHorizon, Occurrence, EVENT_CAPACITY, HORIZON_DAYS};
pub use schedule::{Schedule, GRACE_SECONDS, MASK_DAILY, MASK_WEEKDAYS, MASK_WEEKEND, MAX_SCHEDULES};
pub use types::{FeederStatus, ManualFeedRequest};
