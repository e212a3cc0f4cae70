//! Record and wire schema shared by the server, the dispatcher and the viewer.
//!
//! Every producer and consumer of tank data uses these types. Field names on
//! the wire are camelCase and are listed once in [`fields`]; nothing else in
//! the workspace spells them out.

use serde::{Deserialize, Serialize};

use crate::power::PowerStatus;
use crate::types::Epoch;

/// Longest client identifier accepted from a field device, in bytes.
pub const MAX_CLIENT_ID_LEN: usize = 46;

/// Highest sensor index on a single client (eight sensors, 0-based).
pub const MAX_TANK_INDEX: u8 = 7;

/// Longest tank label, in bytes.
pub const MAX_LABEL_LEN: usize = 32;

/// Longest site label, in bytes.
pub const MAX_SITE_LABEL_LEN: usize = 48;

/// Inbound payloads larger than this are rejected before parsing.
pub const MAX_SYNC_PAYLOAD_BYTES: usize = 1024;

/// Wire field names of a [`SyncRecord`].
pub mod fields {
    pub const CLIENT_ID: &str = "clientId";
    pub const TANK_INDEX: &str = "tankIndex";
    pub const HEIGHT_INCHES: &str = "heightInches";
    pub const LEVEL_INCHES: &str = "levelInches";
    pub const PERCENT: &str = "percent";
    pub const VIN_VOLTAGE: &str = "vinVoltage";
    pub const EPOCH: &str = "epoch";

    /// Fields that must be present in every sync record.
    pub const REQUIRED: &[&str] = &[
        CLIENT_ID,
        TANK_INDEX,
        HEIGHT_INCHES,
        LEVEL_INCHES,
        PERCENT,
        VIN_VOLTAGE,
        EPOCH,
    ];
}

// ---------------------------------------------------------------------------
// Inbound sync record
// ---------------------------------------------------------------------------

/// One tank reading as delivered by the relay transport.
///
/// Unknown additional fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub client_id: String,
    pub tank_index: u8,
    /// Raw sensor height reading in inches.
    pub height_inches: f64,
    pub level_inches: f64,
    pub percent: f64,
    pub vin_voltage: f64,
    pub epoch: Epoch,
}

impl SyncRecord {
    /// The measured values carried by this record.
    pub fn reading(&self) -> Reading {
        Reading {
            height_inches: self.height_inches,
            level_inches: self.level_inches,
            percent: self.percent,
            vin_voltage: self.vin_voltage,
            epoch: self.epoch,
        }
    }
}

/// The measured part of a sync record, applied to a [`TankRecord`] as a unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub height_inches: f64,
    pub level_inches: f64,
    pub percent: f64,
    pub vin_voltage: f64,
    pub epoch: Epoch,
}

// ---------------------------------------------------------------------------
// Alarm state
// ---------------------------------------------------------------------------

/// Per-tank alarm state.
///
/// `Cleared` is never stored on a record: it only appears as the target of
/// the one event emitted when an alarm resolves, after which the record
/// settles to `Normal`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmState {
    #[default]
    Normal,
    High,
    Low,
    Stuck,
    Failure,
    Cleared,
}

impl AlarmState {
    /// Whether this state represents an active alarm.
    pub fn is_alarm(self) -> bool {
        matches!(self, Self::High | Self::Low | Self::Stuck | Self::Failure)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
            Self::Low => "low",
            Self::Stuck => "stuck",
            Self::Failure => "failure",
            Self::Cleared => "cleared",
        }
    }
}

impl std::fmt::Display for AlarmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tank record
// ---------------------------------------------------------------------------

/// Server-side state for one (client, tank) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TankRecord {
    pub client_id: String,
    pub tank_index: u8,
    pub label: String,
    pub site_label: String,
    pub height_inches: f64,
    pub level_inches: f64,
    pub percent: f64,
    pub vin_voltage: f64,
    pub last_update_epoch: Epoch,
    pub alarm_state: AlarmState,
    pub power_status: PowerStatus,
    /// The last accepted reading was outside its plausible range.
    pub out_of_range: bool,
    /// Length of the current run of identical height readings.
    pub consecutive_unchanged: u32,
    /// Consecutive readings flagged out of range.
    pub consecutive_invalid: u32,
    /// Consecutive readings that differed from their predecessor.
    pub consecutive_varying: u32,
}

impl TankRecord {
    /// Create a record from its first accepted reading.
    pub fn new(client_id: &str, tank_index: u8, reading: &Reading) -> Self {
        let mut record = Self {
            client_id: client_id.to_string(),
            tank_index,
            label: String::new(),
            site_label: String::new(),
            height_inches: 0.0,
            level_inches: 0.0,
            percent: 0.0,
            vin_voltage: 0.0,
            last_update_epoch: 0,
            alarm_state: AlarmState::Normal,
            power_status: PowerStatus::Unknown,
            out_of_range: false,
            consecutive_unchanged: 0,
            consecutive_invalid: 0,
            consecutive_varying: 0,
        };
        record.apply_reading(reading);
        record
    }

    /// Overwrite the measured fields. Counters are owned by the alarm engine.
    pub fn apply_reading(&mut self, reading: &Reading) {
        self.height_inches = reading.height_inches;
        self.level_inches = reading.level_inches;
        self.percent = reading.percent;
        self.vin_voltage = reading.vin_voltage;
        self.last_update_epoch = reading.epoch;
    }

    /// Whether `reading` carries exactly the values already stored.
    pub fn matches_reading(&self, reading: &Reading) -> bool {
        self.last_update_epoch == reading.epoch
            && self.height_inches == reading.height_inches
            && self.level_inches == reading.level_inches
            && self.percent == reading.percent
            && self.vin_voltage == reading.vin_voltage
    }
}

// ---------------------------------------------------------------------------
// Viewer summary
// ---------------------------------------------------------------------------

/// Read-only projection of a [`TankRecord`] for dashboards and the viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TankSummary {
    pub client_id: String,
    pub tank_index: u8,
    pub label: String,
    pub site_label: String,
    pub level_inches: f64,
    pub percent: f64,
    pub vin_voltage: f64,
    pub power_status: PowerStatus,
    pub alarm_state: AlarmState,
    pub last_update_epoch: Epoch,
}

impl From<&TankRecord> for TankSummary {
    fn from(record: &TankRecord) -> Self {
        Self {
            client_id: record.client_id.clone(),
            tank_index: record.tank_index,
            label: record.label.clone(),
            site_label: record.site_label.clone(),
            level_inches: record.level_inches,
            percent: record.percent,
            vin_voltage: record.vin_voltage,
            power_status: record.power_status,
            alarm_state: record.alarm_state,
            last_update_epoch: record.last_update_epoch,
        }
    }
}

/// Server-wide summary mirrored by the viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerSummary {
    pub server_name: String,
    pub location: String,
    pub generated_at: Epoch,
    pub tank_count: usize,
    pub alarm_count: usize,
    pub tanks: Vec<TankSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "clientId": "C1",
            "tankIndex": 0,
            "heightInches": 48.5,
            "levelInches": 48.5,
            "percent": 80.0,
            "vinVoltage": 12.6,
            "epoch": 1_700_000_000,
        })
    }

    #[test]
    fn sync_record_uses_shared_field_names() {
        let value = sample_json();
        for field in fields::REQUIRED {
            assert!(value.get(field).is_some(), "sample missing {field}");
        }
        let record: SyncRecord = serde_json::from_value(value).expect("valid record");
        assert_eq!(record.client_id, "C1");
        assert_eq!(record.epoch, 1_700_000_000);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut value = sample_json();
        value["firmware"] = serde_json::json!("1.0.0");
        let record: Result<SyncRecord, _> = serde_json::from_value(value);
        assert!(record.is_ok());
    }

    #[test]
    fn only_active_alarms_report_is_alarm() {
        assert!(AlarmState::High.is_alarm());
        assert!(AlarmState::Failure.is_alarm());
        assert!(!AlarmState::Normal.is_alarm());
        assert!(!AlarmState::Cleared.is_alarm());
    }

    #[test]
    fn summary_mirrors_record_fields() {
        let record: SyncRecord = serde_json::from_value(sample_json()).expect("valid record");
        let tank = TankRecord::new(&record.client_id, record.tank_index, &record.reading());
        let summary = TankSummary::from(&tank);
        assert_eq!(summary.percent, 80.0);
        assert_eq!(summary.alarm_state, AlarmState::Normal);
        assert_eq!(summary.last_update_epoch, 1_700_000_000);

        let json = serde_json::to_value(&summary).expect("serializable");
        assert_eq!(json["alarmState"], "normal");
        assert_eq!(json["lastUpdateEpoch"], 1_700_000_000);
    }
}
