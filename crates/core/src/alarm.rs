//! Per-tank alarm state machine.
//!
//! Pure logic: the engine reads and updates counters stored on the
//! [`TankRecord`] and returns at most one [`AlarmEvent`] per evaluation.
//! Thresholds are single-valued unless a clear hysteresis is configured.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::hashing::sha256_hex;
use crate::schema::{AlarmState, TankRecord};
use crate::store::TankRecordStore;
use crate::types::Epoch;

/// Default run of identical height readings that marks a sensor stuck.
pub const DEFAULT_STUCK_THRESHOLD: u32 = 10;

/// Default number of missed intervals (or invalid readings) before failure.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default expected report interval of a field client.
pub const DEFAULT_EXPECTED_INTERVAL_SECS: u64 = 1800;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which measurement the high/low thresholds compare against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdUnit {
    #[default]
    Percent,
    Inches,
}

/// High/low alarm thresholds for a tank.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmThresholds {
    pub high: f64,
    pub low: f64,
    #[serde(default)]
    pub unit: ThresholdUnit,
    /// Distance back inside the threshold required to clear High or Low.
    /// Absent means a single threshold for both directions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clear_hysteresis: Option<f64>,
}

impl Default for AlarmThresholds {
    fn default() -> Self {
        Self {
            high: 90.0,
            low: 10.0,
            unit: ThresholdUnit::Percent,
            clear_hysteresis: None,
        }
    }
}

impl AlarmThresholds {
    pub fn validate(&self) -> CoreResult<()> {
        if !self.high.is_finite() || !self.low.is_finite() {
            return Err(CoreError::Validation("thresholds must be finite".into()));
        }
        if self.low >= self.high {
            return Err(CoreError::Validation(format!(
                "low threshold {} must be below high threshold {}",
                self.low, self.high
            )));
        }
        if let Some(h) = self.clear_hysteresis {
            if !(h.is_finite() && h >= 0.0 && h < self.high - self.low) {
                return Err(CoreError::Validation(format!(
                    "clearHysteresis {h} must be within 0..{}",
                    self.high - self.low
                )));
            }
        }
        Ok(())
    }

    /// The measurement these thresholds apply to.
    pub fn value_of(&self, record: &TankRecord) -> f64 {
        match self.unit {
            ThresholdUnit::Percent => record.percent,
            ThresholdUnit::Inches => record.level_inches,
        }
    }
}

/// Debounce limits shared by every tank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlarmLimits {
    pub stuck_threshold: u32,
    /// Consecutive changing readings required to leave `Stuck`.
    pub stuck_recovery_readings: u32,
    pub failure_threshold: u32,
    pub expected_interval_secs: u64,
}

impl Default for AlarmLimits {
    fn default() -> Self {
        Self {
            stuck_threshold: DEFAULT_STUCK_THRESHOLD,
            stuck_recovery_readings: 2,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            expected_interval_secs: DEFAULT_EXPECTED_INTERVAL_SECS,
        }
    }
}

impl AlarmLimits {
    pub fn validate(&self) -> CoreResult<()> {
        if self.stuck_threshold < 2 {
            return Err(CoreError::Validation("stuckThreshold must be at least 2".into()));
        }
        if self.stuck_recovery_readings == 0 || self.failure_threshold == 0 {
            return Err(CoreError::Validation(
                "stuckRecoveryReadings and failureThreshold must be positive".into(),
            ));
        }
        if self.expected_interval_secs == 0 {
            return Err(CoreError::Validation("expectedIntervalSecs must be positive".into()));
        }
        Ok(())
    }
}

/// Resolved alarm settings for one tank.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TankAlarmSettings {
    pub thresholds: AlarmThresholds,
    /// Whether the sensor is expected to vary; fixed-level tanks opt out.
    pub stuck_detection: bool,
    pub expected_interval_secs: u64,
}

impl Default for TankAlarmSettings {
    fn default() -> Self {
        Self {
            thresholds: AlarmThresholds::default(),
            stuck_detection: true,
            expected_interval_secs: DEFAULT_EXPECTED_INTERVAL_SECS,
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One alarm state transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmEvent {
    pub client_id: String,
    pub tank_index: u8,
    pub from_state: AlarmState,
    pub to_state: AlarmState,
    pub epoch: Epoch,
    /// Measurement that triggered the transition.
    pub value: f64,
}

impl AlarmEvent {
    /// Stable key identifying this transition for downstream de-duplication.
    pub fn dedup_key(&self) -> String {
        sha256_hex(
            format!(
                "alarm|{}|{}|{}|{}|{}",
                self.client_id, self.tank_index, self.from_state, self.to_state, self.epoch
            )
            .as_bytes(),
        )
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Heights are compared at hundredth-of-an-inch resolution.
fn same_height(a: f64, b: f64) -> bool {
    (a * 100.0).round() == (b * 100.0).round()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlarmEngine {
    limits: AlarmLimits,
}

impl AlarmEngine {
    pub fn new(limits: AlarmLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &AlarmLimits {
        &self.limits
    }

    pub fn set_limits(&mut self, limits: AlarmLimits) {
        self.limits = limits;
    }

    /// Evaluate a freshly applied reading.
    ///
    /// `previous_height` is the height held before the update, `None` for a
    /// record created by this reading.
    pub fn evaluate_update(
        &self,
        record: &mut TankRecord,
        previous_height: Option<f64>,
        settings: &TankAlarmSettings,
    ) -> Option<AlarmEvent> {
        self.update_counters(record, previous_height);
        let target = self.target_state(record, settings);
        let value = settings.thresholds.value_of(record);
        let epoch = record.last_update_epoch;
        transition(record, target, value, epoch)
    }

    /// Move every record that has been silent past its failure window into
    /// `Failure`.
    pub fn sweep_overdue<F>(
        &self,
        store: &mut TankRecordStore,
        now: Epoch,
        mut expected_interval: F,
    ) -> Vec<AlarmEvent>
    where
        F: FnMut(&TankRecord) -> u64,
    {
        let mut events = Vec::new();
        for record in store.all_mut() {
            if record.alarm_state == AlarmState::Failure {
                continue;
            }
            let window = expected_interval(record)
                .saturating_mul(u64::from(self.limits.failure_threshold));
            let window = i64::try_from(window).unwrap_or(i64::MAX);
            if now.saturating_sub(record.last_update_epoch) <= window {
                continue;
            }
            tracing::warn!(
                client_id = %record.client_id,
                tank_index = record.tank_index,
                last_update_epoch = record.last_update_epoch,
                "No report within failure window"
            );
            let value = record.percent;
            if let Some(event) = transition(record, AlarmState::Failure, value, now) {
                events.push(event);
            }
        }
        events
    }

    fn update_counters(&self, record: &mut TankRecord, previous_height: Option<f64>) {
        if record.out_of_range {
            record.consecutive_invalid = record.consecutive_invalid.saturating_add(1);
        } else {
            record.consecutive_invalid = 0;
        }

        match previous_height {
            Some(prev) if same_height(prev, record.height_inches) => {
                record.consecutive_unchanged = record.consecutive_unchanged.saturating_add(1);
                record.consecutive_varying = 0;
            }
            Some(_) => {
                record.consecutive_unchanged = 1;
                record.consecutive_varying = record.consecutive_varying.saturating_add(1);
            }
            None => {
                record.consecutive_unchanged = 1;
                record.consecutive_varying = 0;
            }
        }
    }

    fn target_state(&self, record: &TankRecord, settings: &TankAlarmSettings) -> AlarmState {
        if record.consecutive_invalid >= self.limits.failure_threshold {
            return AlarmState::Failure;
        }
        if settings.stuck_detection {
            let stuck_run = record.consecutive_unchanged >= self.limits.stuck_threshold;
            let recovering = record.alarm_state == AlarmState::Stuck
                && record.consecutive_varying < self.limits.stuck_recovery_readings;
            if stuck_run || recovering {
                return AlarmState::Stuck;
            }
        }

        let thresholds = &settings.thresholds;
        let value = thresholds.value_of(record);
        let hysteresis = thresholds.clear_hysteresis.unwrap_or(0.0);
        if value > thresholds.high
            || (record.alarm_state == AlarmState::High && value > thresholds.high - hysteresis)
        {
            AlarmState::High
        } else if value < thresholds.low
            || (record.alarm_state == AlarmState::Low && value < thresholds.low + hysteresis)
        {
            AlarmState::Low
        } else {
            AlarmState::Normal
        }
    }
}

/// Apply `target` to the record, returning the event for a real transition.
///
/// Resolving an alarm is reported as a transition into `Cleared`; the record
/// itself settles to `Normal`.
fn transition(
    record: &mut TankRecord,
    target: AlarmState,
    value: f64,
    epoch: Epoch,
) -> Option<AlarmEvent> {
    let from = record.alarm_state;
    if from == target {
        return None;
    }
    let to = if target == AlarmState::Normal {
        AlarmState::Cleared
    } else {
        target
    };
    record.alarm_state = target;

    tracing::info!(
        client_id = %record.client_id,
        tank_index = record.tank_index,
        from = from.as_str(),
        to = to.as_str(),
        value,
        epoch,
        "Alarm state changed"
    );

    Some(AlarmEvent {
        client_id: record.client_id.clone(),
        tank_index: record.tank_index,
        from_state: from,
        to_state: to,
        epoch,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Reading;

    fn reading(height: f64, percent: f64, epoch: Epoch) -> Reading {
        Reading {
            height_inches: height,
            level_inches: height,
            percent,
            vin_voltage: 12.6,
            epoch,
        }
    }

    /// Apply a reading to `record` the way the ingest path does, then evaluate.
    fn feed(
        engine: &AlarmEngine,
        record: &mut Option<TankRecord>,
        r: Reading,
        settings: &TankAlarmSettings,
    ) -> Option<AlarmEvent> {
        let previous = record.as_ref().map(|rec| rec.height_inches);
        let rec = record.get_or_insert_with(|| TankRecord::new("C1", 0, &r));
        rec.apply_reading(&r);
        rec.out_of_range = !(0.0..=100.0).contains(&r.percent);
        engine.evaluate_update(rec, previous, settings)
    }

    #[test]
    fn stays_normal_inside_thresholds() {
        let engine = AlarmEngine::default();
        let settings = TankAlarmSettings::default();
        let mut record = None;
        for (i, pct) in [50.0, 10.0, 90.0, 42.5, 11.0, 89.9].into_iter().enumerate() {
            let event = feed(&engine, &mut record, reading(pct, pct, i as Epoch + 1), &settings);
            assert!(event.is_none(), "reading {pct} must not alarm");
        }
        assert_eq!(record.expect("created").alarm_state, AlarmState::Normal);
    }

    #[test]
    fn high_then_cleared_then_normal() {
        let engine = AlarmEngine::default();
        let settings = TankAlarmSettings::default();
        let mut record = None;

        assert!(feed(&engine, &mut record, reading(80.0, 80.0, 1), &settings).is_none());

        let event = feed(&engine, &mut record, reading(95.0, 95.0, 2), &settings).expect("high");
        assert_eq!(event.from_state, AlarmState::Normal);
        assert_eq!(event.to_state, AlarmState::High);

        assert!(
            feed(&engine, &mut record, reading(96.0, 96.0, 3), &settings).is_none(),
            "re-entering High emits nothing"
        );

        let event = feed(&engine, &mut record, reading(70.0, 70.0, 4), &settings).expect("clear");
        assert_eq!(event.from_state, AlarmState::High);
        assert_eq!(event.to_state, AlarmState::Cleared);
        assert_eq!(record.as_ref().expect("record").alarm_state, AlarmState::Normal);

        assert!(feed(&engine, &mut record, reading(71.0, 71.0, 5), &settings).is_none());
    }

    #[test]
    fn low_threshold_and_direct_high_to_low() {
        let engine = AlarmEngine::default();
        let settings = TankAlarmSettings::default();
        let mut record = None;
        feed(&engine, &mut record, reading(95.0, 95.0, 1), &settings);
        let event = feed(&engine, &mut record, reading(5.0, 5.0, 2), &settings).expect("low");
        assert_eq!(event.from_state, AlarmState::High);
        assert_eq!(event.to_state, AlarmState::Low);
    }

    #[test]
    fn stuck_boundary_at_tenth_identical_reading() {
        let engine = AlarmEngine::default();
        let settings = TankAlarmSettings::default();
        let mut record = None;

        for n in 1..=9 {
            let event = feed(&engine, &mut record, reading(40.0, 50.0, n), &settings);
            assert!(event.is_none(), "reading {n} must not trip stuck");
        }
        assert_eq!(record.as_ref().expect("record").consecutive_unchanged, 9);

        let event = feed(&engine, &mut record, reading(40.0, 50.0, 10), &settings)
            .expect("10th identical reading");
        assert_eq!(event.to_state, AlarmState::Stuck);

        // The 11th reading changes but does not by itself clear Stuck.
        assert!(feed(&engine, &mut record, reading(41.0, 51.0, 11), &settings).is_none());
        assert_eq!(record.as_ref().expect("record").alarm_state, AlarmState::Stuck);

        let event = feed(&engine, &mut record, reading(42.0, 52.0, 12), &settings)
            .expect("second varying reading clears");
        assert_eq!(event.from_state, AlarmState::Stuck);
        assert_eq!(event.to_state, AlarmState::Cleared);
    }

    #[test]
    fn a_single_change_resets_the_stuck_run() {
        let engine = AlarmEngine::default();
        let settings = TankAlarmSettings::default();
        let mut record = None;
        for n in 1..=9 {
            feed(&engine, &mut record, reading(40.0, 50.0, n), &settings);
        }
        feed(&engine, &mut record, reading(40.5, 50.0, 10), &settings);
        for n in 11..=18 {
            assert!(feed(&engine, &mut record, reading(40.5, 50.0, n), &settings).is_none());
        }
        assert_eq!(record.expect("record").alarm_state, AlarmState::Normal);
    }

    #[test]
    fn stuck_detection_can_be_disabled_per_tank() {
        let engine = AlarmEngine::default();
        let settings = TankAlarmSettings {
            stuck_detection: false,
            ..TankAlarmSettings::default()
        };
        let mut record = None;
        for n in 1..=20 {
            assert!(feed(&engine, &mut record, reading(40.0, 50.0, n), &settings).is_none());
        }
    }

    #[test]
    fn repeated_out_of_range_readings_become_failure() {
        let engine = AlarmEngine::default();
        let settings = TankAlarmSettings::default();
        let mut record = None;
        // Heights vary so the stuck run never builds up; a negative percent is out of range.
        for n in 1..=4 {
            let r = reading(n as f64, -5.0, n);
            let event = feed(&engine, &mut record, r, &settings);
            if n == 1 {
                assert_eq!(event.expect("low").to_state, AlarmState::Low);
            } else {
                assert!(event.is_none());
            }
        }
        let event = feed(&engine, &mut record, reading(5.0, -5.0, 5), &settings).expect("failure");
        assert_eq!(event.from_state, AlarmState::Low);
        assert_eq!(event.to_state, AlarmState::Failure);

        let event = feed(&engine, &mut record, reading(6.0, 50.0, 6), &settings).expect("valid");
        assert_eq!(event.to_state, AlarmState::Cleared);
    }

    #[test]
    fn hysteresis_holds_alarm_until_value_moves_back_far_enough() {
        let engine = AlarmEngine::default();
        let settings = TankAlarmSettings {
            thresholds: AlarmThresholds {
                clear_hysteresis: Some(5.0),
                ..AlarmThresholds::default()
            },
            ..TankAlarmSettings::default()
        };
        let mut record = None;
        feed(&engine, &mut record, reading(95.0, 95.0, 1), &settings);
        assert!(feed(&engine, &mut record, reading(87.0, 87.0, 2), &settings).is_none());
        let event = feed(&engine, &mut record, reading(84.0, 84.0, 3), &settings).expect("clear");
        assert_eq!(event.to_state, AlarmState::Cleared);
    }

    #[test]
    fn inch_thresholds_use_level() {
        let engine = AlarmEngine::default();
        let settings = TankAlarmSettings {
            thresholds: AlarmThresholds {
                high: 60.0,
                low: 6.0,
                unit: ThresholdUnit::Inches,
                clear_hysteresis: None,
            },
            ..TankAlarmSettings::default()
        };
        let mut record = None;
        let event = feed(&engine, &mut record, reading(65.0, 50.0, 1), &settings).expect("high");
        assert_eq!(event.to_state, AlarmState::High);
        assert_eq!(event.value, 65.0);
    }

    #[test]
    fn sweep_marks_silent_tanks_failed_once() {
        let engine = AlarmEngine::default();
        let mut store = TankRecordStore::default();
        store.upsert("C1", 0, &reading(40.0, 50.0, 1_000)).expect("c1");
        store.upsert("C2", 0, &reading(40.0, 50.0, 9_000)).expect("c2");

        // 5 intervals of 1800 s = 9000 s window.
        let now = 1_000 + 9_001;
        let events = engine.sweep_overdue(&mut store, now, |_| 1800);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].client_id, "C1");
        assert_eq!(events[0].to_state, AlarmState::Failure);
        assert_eq!(events[0].epoch, now);

        assert!(engine.sweep_overdue(&mut store, now + 60, |_| 1800).is_empty());
    }

    #[test]
    fn dedup_key_is_stable_per_transition() {
        let event = AlarmEvent {
            client_id: "C1".into(),
            tank_index: 0,
            from_state: AlarmState::Normal,
            to_state: AlarmState::High,
            epoch: 10,
            value: 95.0,
        };
        let mut other = event.clone();
        other.value = 96.0;
        assert_eq!(event.dedup_key(), other.dedup_key());
        other.epoch = 11;
        assert_ne!(event.dedup_key(), other.dedup_key());
    }

    #[test]
    fn threshold_validation() {
        assert!(AlarmThresholds::default().validate().is_ok());
        let inverted = AlarmThresholds {
            high: 10.0,
            low: 90.0,
            ..AlarmThresholds::default()
        };
        assert!(inverted.validate().is_err());
        assert!(AlarmLimits {
            stuck_threshold: 1,
            ..AlarmLimits::default()
        }
        .validate()
        .is_err());
    }
}
