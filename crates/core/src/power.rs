//! Supply voltage classification for battery/solar field clients.
//!
//! Voltage tables are the resting state-of-charge references for 12 V
//! lead-acid and 4S LiFePO4 packs. A reading of zero or below means the
//! client did not report a voltage and leaves the stored status untouched.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::hashing::sha256_hex;
use crate::schema::TankRecord;
use crate::types::Epoch;

const LEAD_ACID_12V_LOW: f64 = 12.00;
const LEAD_ACID_12V_CRITICAL: f64 = 11.80;
const LIFEPO4_12V_LOW: f64 = 12.80;
const LIFEPO4_12V_CRITICAL: f64 = 12.00;

/// Battery chemistry used to pick voltage thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BatteryProfile {
    #[default]
    #[serde(rename = "leadAcid12v")]
    LeadAcid12V,
    #[serde(rename = "lifepo4_12v")]
    LiFePo412V,
    Custom { low: f64, critical: f64 },
}

impl BatteryProfile {
    /// `(low, critical)` voltage thresholds.
    pub fn thresholds(&self) -> (f64, f64) {
        match *self {
            Self::LeadAcid12V => (LEAD_ACID_12V_LOW, LEAD_ACID_12V_CRITICAL),
            Self::LiFePo412V => (LIFEPO4_12V_LOW, LIFEPO4_12V_CRITICAL),
            Self::Custom { low, critical } => (low, critical),
        }
    }

    pub fn validate(&self) -> CoreResult<()> {
        if let Self::Custom { low, critical } = *self {
            if !(critical > 0.0 && low > critical && low.is_finite()) {
                return Err(CoreError::Validation(format!(
                    "Custom battery thresholds need 0 < critical < low (got low={low}, critical={critical})"
                )));
            }
        }
        Ok(())
    }
}

/// Supply health inferred from `vinVoltage`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerStatus {
    #[default]
    Unknown,
    Normal,
    Low,
    Critical,
}

impl PowerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Normal => "normal",
            Self::Low => "low",
            Self::Critical => "critical",
        }
    }
}

/// Classify a supply voltage against a battery profile.
pub fn classify_voltage(voltage: f64, profile: &BatteryProfile) -> PowerStatus {
    if !(voltage > 0.0) {
        return PowerStatus::Unknown;
    }
    let (low, critical) = profile.thresholds();
    if voltage < critical {
        PowerStatus::Critical
    } else if voltage < low {
        PowerStatus::Low
    } else {
        PowerStatus::Normal
    }
}

/// Emitted when a client's supply status changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerEvent {
    pub client_id: String,
    pub tank_index: u8,
    pub from: PowerStatus,
    pub to: PowerStatus,
    pub voltage: f64,
    pub epoch: Epoch,
}

impl PowerEvent {
    pub fn dedup_key(&self) -> String {
        sha256_hex(
            format!(
                "power|{}|{}|{}|{}|{}",
                self.client_id,
                self.tank_index,
                self.from.as_str(),
                self.to.as_str(),
                self.epoch
            )
            .as_bytes(),
        )
    }
}

/// Update the record's power status from its latest voltage.
///
/// Returns an event for each real transition. The first known status of a
/// record is only reported when it is already degraded.
pub fn observe_power(record: &mut TankRecord, profile: &BatteryProfile) -> Option<PowerEvent> {
    let next = classify_voltage(record.vin_voltage, profile);
    let previous = record.power_status;
    if next == PowerStatus::Unknown || next == previous {
        return None;
    }
    record.power_status = next;
    if previous == PowerStatus::Unknown && next == PowerStatus::Normal {
        return None;
    }

    tracing::info!(
        client_id = %record.client_id,
        tank_index = record.tank_index,
        from = previous.as_str(),
        to = next.as_str(),
        voltage = record.vin_voltage,
        "Supply status changed"
    );

    Some(PowerEvent {
        client_id: record.client_id.clone(),
        tank_index: record.tank_index,
        from: previous,
        to: next,
        voltage: record.vin_voltage,
        epoch: record.last_update_epoch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Reading;

    fn record_with_voltage(voltage: f64, epoch: Epoch) -> TankRecord {
        TankRecord::new(
            "C1",
            0,
            &Reading {
                height_inches: 40.0,
                level_inches: 40.0,
                percent: 50.0,
                vin_voltage: voltage,
                epoch,
            },
        )
    }

    #[test]
    fn lead_acid_thresholds() {
        let profile = BatteryProfile::LeadAcid12V;
        assert_eq!(classify_voltage(12.6, &profile), PowerStatus::Normal);
        assert_eq!(classify_voltage(11.9, &profile), PowerStatus::Low);
        assert_eq!(classify_voltage(11.5, &profile), PowerStatus::Critical);
        assert_eq!(classify_voltage(0.0, &profile), PowerStatus::Unknown);
        assert_eq!(classify_voltage(f64::NAN, &profile), PowerStatus::Unknown);
    }

    #[test]
    fn lifepo4_has_narrower_window() {
        let profile = BatteryProfile::LiFePo412V;
        assert_eq!(classify_voltage(12.6, &profile), PowerStatus::Low);
        assert_eq!(classify_voltage(11.9, &profile), PowerStatus::Critical);
    }

    #[test]
    fn custom_profile_must_be_ordered() {
        assert!(BatteryProfile::Custom { low: 3.6, critical: 3.3 }.validate().is_ok());
        assert!(BatteryProfile::Custom { low: 3.3, critical: 3.6 }.validate().is_err());
    }

    #[test]
    fn first_normal_status_is_silent() {
        let mut record = record_with_voltage(12.7, 100);
        assert!(observe_power(&mut record, &BatteryProfile::LeadAcid12V).is_none());
        assert_eq!(record.power_status, PowerStatus::Normal);
    }

    #[test]
    fn transitions_emit_once() {
        let profile = BatteryProfile::LeadAcid12V;
        let mut record = record_with_voltage(12.7, 100);
        observe_power(&mut record, &profile);

        record.vin_voltage = 11.9;
        record.last_update_epoch = 200;
        let event = observe_power(&mut record, &profile).expect("normal -> low");
        assert_eq!(event.from, PowerStatus::Normal);
        assert_eq!(event.to, PowerStatus::Low);

        record.last_update_epoch = 300;
        assert!(observe_power(&mut record, &profile).is_none());

        record.vin_voltage = 12.5;
        let event = observe_power(&mut record, &profile).expect("low -> normal");
        assert_eq!(event.to, PowerStatus::Normal);
    }

    #[test]
    fn missing_voltage_keeps_status() {
        let profile = BatteryProfile::LeadAcid12V;
        let mut record = record_with_voltage(11.9, 100);
        observe_power(&mut record, &profile);
        record.vin_voltage = 0.0;
        assert!(observe_power(&mut record, &profile).is_none());
        assert_eq!(record.power_status, PowerStatus::Low);
    }
}
