use serde::{Deserialize, Serialize};

use crate::alarm::ArmState;

/// Status surface for the web UI.
#[derive(Debug, Clone, Serialize)]
pub struct FeederStatus {
    pub armed: bool,
    #[serde(rename = "nextAlarmEpoch")]
    pub next_alarm_epoch: Option<i64>,
    #[serde(rename = "nextScheduleId")]
    pub next_schedule_id: Option<u8>,
    #[serde(rename = "enabledSchedules")]
    pub enabled_schedules: usize,
    #[serde(rename = "pendingOccurrences")]
    pub pending_occurrences: usize,
    #[serde(rename = "isFeeding")]
    pub is_feeding: bool,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub timezone: String,
    #[serde(rename = "nowEpoch")]
    pub now_epoch: i64,
    #[serde(rename = "portionUnitGrams")]
    pub portion_unit_grams: u8,
}

impl FeederStatus {
    pub fn arm_state_fields(state: ArmState) -> (bool, Option<i64>) {
        match state {
            ArmState::Armed(at) => (true, Some(at.timestamp())),
            ArmState::Idle => (false, None),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ManualFeedRequest {
    pub portions: u8,
}
