use serde::{Deserialize, Serialize};

use crate::schedule::{Schedule, MASK_DAILY, MAX_SCHEDULES};

/// Scheduling-core tuning. Values come from persisted JSON and are clamped
/// by `sanitize` before use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeederConfig {
    pub horizon_days: u8,
    pub grace_secs: u32,
    pub max_schedules: u8,
    pub portion_unit_grams: u8,
    pub feed_hold_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            horizon_days: 7,
            grace_secs: 60,
            max_schedules: MAX_SCHEDULES as u8,
            portion_unit_grams: 12,
            feed_hold_ms: 2_500,
            poll_interval_ms: 1_000,
        }
    }
}

impl FeederConfig {
    pub fn sanitize(&mut self) {
        self.horizon_days = self.horizon_days.clamp(1, 14);
        self.grace_secs = self.grace_secs.clamp(5, 600);
        self.max_schedules = self.max_schedules.clamp(1, MAX_SCHEDULES as u8);
        if self.portion_unit_grams == 0 {
            self.portion_unit_grams = 12;
        }
        self.feed_hold_ms = self.feed_hold_ms.clamp(500, 30_000);
        self.poll_interval_ms = self.poll_interval_ms.clamp(100, 10_000);
    }
}

/// The feeder hosts its own access point; there is no broker or cloud leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub ap_ssid: String,
    pub ap_pass: String,
    pub hostname: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ap_ssid: "PetFeeder-AP".to_string(),
            ap_pass: "FeederSetup".to_string(),
            hostname: "petfeeder".to_string(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub feeder: FeederConfig,
    pub timezone: String,
    pub network: NetworkConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            feeder: FeederConfig::default(),
            timezone: "America/Los_Angeles".to_string(),
            network: NetworkConfig::default(),
        }
    }
}

/// Factory schedule set: one slot enabled at 08:00 daily, the rest parked
/// disabled so the UI always shows six editable rows.
pub fn default_schedules() -> Vec<Schedule> {
    (0..MAX_SCHEDULES as u8)
        .map(|index| Schedule {
            id: index + 1,
            enabled: index == 0,
            hour: 8,
            minute: 0,
            weekday_mask: MASK_DAILY,
            portion_units: 1,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sanitize_clamps_out_of_range_tuning() {
        let mut config = FeederConfig {
            horizon_days: 60,
            grace_secs: 0,
            max_schedules: 99,
            portion_unit_grams: 0,
            feed_hold_ms: 1,
            poll_interval_ms: 0,
        };
        config.sanitize();

        assert_eq!(config.horizon_days, 14);
        assert_eq!(config.grace_secs, 5);
        assert_eq!(config.max_schedules, MAX_SCHEDULES as u8);
        assert_eq!(config.portion_unit_grams, 12);
        assert_eq!(config.feed_hold_ms, 500);
        assert_eq!(config.poll_interval_ms, 100);
    }

    #[test]
    fn default_schedules_fill_every_slot_with_stable_ids() {
        let schedules = default_schedules();
        assert_eq!(schedules.len(), MAX_SCHEDULES);
        assert!(schedules.iter().all(|s| s.validate()));
        assert_eq!(schedules.iter().filter(|s| s.enabled).count(), 1);

        let ids: Vec<u8> = schedules.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    }
}
