//! Validation and application of inbound sync records.
//!
//! A payload is parsed and checked in full before the table is touched, so a
//! record is either updated atomically or not at all. Application is keyed by
//! `(clientId, tankIndex)`: replaying an identical payload is reported as a
//! duplicate and leaves the record as it was.

use serde::Serialize;

use crate::error::{CoreError, CoreResult};
use crate::schema::{fields, Reading, SyncRecord, MAX_SYNC_PAYLOAD_BYTES};
use crate::store::{validate_client_id, validate_tank_index, TankRecordStore};
use crate::types::{is_future, Epoch};

/// How an accepted payload affected the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateApplied {
    Created,
    Updated,
    /// Identical to the stored reading; nothing changed.
    Duplicate,
    /// Older than the stored reading; not applied.
    Stale,
}

impl UpdateApplied {
    /// Whether the record's reading changed.
    pub fn changed(self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

/// Plausibility flags raised on an accepted reading.
///
/// Sensor drift is expected, so these never reject a payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingFlags {
    pub percent_out_of_range: bool,
    pub negative_level: bool,
    pub negative_voltage: bool,
}

impl ReadingFlags {
    pub fn out_of_range(&self) -> bool {
        self.percent_out_of_range || self.negative_level || self.negative_voltage
    }
}

/// Outcome of one successful ingest.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestReport {
    pub client_id: String,
    pub tank_index: u8,
    /// Arena position of the record when the reading was applied.
    #[serde(skip)]
    pub slot: Option<usize>,
    pub applied: UpdateApplied,
    pub flags: ReadingFlags,
    /// Height reading held before this update, if the record existed.
    #[serde(skip)]
    pub previous_height: Option<f64>,
    pub epoch: Epoch,
}

/// Running counters for the ingest path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub stale: u64,
    pub rejected: u64,
    pub identity_rejected: u64,
    pub capacity_rejected: u64,
}

#[derive(Debug, Default)]
pub struct SyncIngestor {
    stats: IngestStats,
}

impl SyncIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Parse a raw relay payload.
    pub fn parse_bytes(&mut self, payload: &[u8]) -> CoreResult<SyncRecord> {
        if payload.len() > MAX_SYNC_PAYLOAD_BYTES {
            self.stats.rejected += 1;
            return Err(CoreError::Validation(format!(
                "payload of {} bytes exceeds {MAX_SYNC_PAYLOAD_BYTES}",
                payload.len()
            )));
        }
        serde_json::from_slice(payload).map_err(|e| {
            self.stats.rejected += 1;
            CoreError::Validation(format!("malformed sync record: {e}"))
        })
    }

    /// Parse an already-decoded structured payload.
    pub fn parse_value(&mut self, payload: serde_json::Value) -> CoreResult<SyncRecord> {
        serde_json::from_value(payload).map_err(|e| {
            self.stats.rejected += 1;
            CoreError::Validation(format!("malformed sync record: {e}"))
        })
    }

    /// Validate a record and apply it to the table. `now` bounds how far in
    /// the future the record's epoch may lie.
    pub fn ingest(
        &mut self,
        store: &mut TankRecordStore,
        record: &SyncRecord,
        now: Epoch,
    ) -> CoreResult<IngestReport> {
        let (reading, flags) = match validate(record, now) {
            Ok(v) => v,
            Err(e) => {
                self.reject(record, &e);
                return Err(e);
            }
        };

        let existing = match store.try_lookup(&record.client_id, record.tank_index) {
            Ok(existing) => existing.cloned(),
            Err(e) => {
                self.reject(record, &e);
                return Err(e);
            }
        };

        if let Some(current) = &existing {
            let applied = if current.matches_reading(&reading) {
                self.stats.duplicates += 1;
                Some(UpdateApplied::Duplicate)
            } else if reading.epoch < current.last_update_epoch
                && !is_future(current.last_update_epoch, now)
            {
                self.stats.stale += 1;
                Some(UpdateApplied::Stale)
            } else {
                None
            };
            if let Some(applied) = applied {
                tracing::debug!(
                    client_id = %record.client_id,
                    tank_index = record.tank_index,
                    epoch = record.epoch,
                    stored_epoch = current.last_update_epoch,
                    ?applied,
                    "Sync record not applied"
                );
                return Ok(IngestReport {
                    client_id: record.client_id.clone(),
                    tank_index: record.tank_index,
                    slot: None,
                    applied,
                    flags,
                    previous_height: Some(current.height_inches),
                    epoch: record.epoch,
                });
            }
        }

        let upserted = match store.upsert(&record.client_id, record.tank_index, &reading) {
            Ok(up) => up,
            Err(e) => {
                self.reject(record, &e);
                return Err(e);
            }
        };

        if let Some(stored) = store.get_mut(upserted.slot) {
            stored.out_of_range = flags.out_of_range();
        }
        self.stats.accepted += 1;

        if flags.out_of_range() {
            tracing::warn!(
                client_id = %record.client_id,
                tank_index = record.tank_index,
                percent = record.percent,
                level_inches = record.level_inches,
                vin_voltage = record.vin_voltage,
                "Accepted reading outside plausible range"
            );
        }

        Ok(IngestReport {
            client_id: record.client_id.clone(),
            tank_index: record.tank_index,
            slot: Some(upserted.slot),
            applied: if upserted.created {
                UpdateApplied::Created
            } else {
                UpdateApplied::Updated
            },
            flags,
            previous_height: existing.map(|r| r.height_inches),
            epoch: record.epoch,
        })
    }

    fn reject(&mut self, record: &SyncRecord, err: &CoreError) {
        match err {
            CoreError::Capacity { .. } => self.stats.capacity_rejected += 1,
            CoreError::Validation(_)
                if validate_client_id(&record.client_id).is_err()
                    || validate_tank_index(record.tank_index).is_err() =>
            {
                self.stats.identity_rejected += 1
            }
            _ => self.stats.rejected += 1,
        }
        tracing::warn!(
            client_id = %record.client_id.escape_debug(),
            tank_index = record.tank_index,
            error = %err,
            "Rejected sync record"
        );
    }
}

/// Check a record's fields and derive the reading to apply.
pub fn validate(record: &SyncRecord, now: Epoch) -> CoreResult<(Reading, ReadingFlags)> {
    validate_client_id(&record.client_id)?;
    validate_tank_index(record.tank_index)?;

    for (name, value) in [
        (fields::HEIGHT_INCHES, record.height_inches),
        (fields::LEVEL_INCHES, record.level_inches),
        (fields::PERCENT, record.percent),
        (fields::VIN_VOLTAGE, record.vin_voltage),
    ] {
        if !value.is_finite() {
            return Err(CoreError::Validation(format!("{name} is not a finite number")));
        }
    }
    if record.epoch <= 0 {
        return Err(CoreError::Validation(format!(
            "epoch {} is not a valid timestamp",
            record.epoch
        )));
    }
    if is_future(record.epoch, now) {
        return Err(CoreError::Validation(format!(
            "epoch {} is ahead of server time {now}",
            record.epoch
        )));
    }

    let flags = ReadingFlags {
        percent_out_of_range: !(0.0..=100.0).contains(&record.percent),
        negative_level: record.level_inches < 0.0 || record.height_inches < 0.0,
        negative_voltage: record.vin_voltage < 0.0,
    };

    Ok((record.reading(), flags))
}
