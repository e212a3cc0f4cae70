//! Bounded, hash-indexed table of tank records.
//!
//! Records live in a fixed arena of `capacity` entries. A separate bucket
//! array (twice the capacity, linear probing) maps the hash of
//! `(client_id, tank_index)` to an arena position. Bucket values are
//! untrusted on read: every position is bounds-checked against the arena
//! before it is dereferenced, and an out-of-range or dangling position fails
//! closed as [`CoreError::CorruptIndex`].
//!
//! The table never grows past its capacity. New keys on a full table are
//! rejected unless the eviction policy explicitly allows replacing the
//! least-recently-updated non-alarming record.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::hashing::sha256_prefix_u32;
use crate::schema::{AlarmState, Reading, TankRecord, MAX_CLIENT_ID_LEN, MAX_TANK_INDEX};

/// Bucket value denoting an empty bucket. Arena positions are always below
/// [`MAX_CAPACITY`], so the sentinel cannot name a real record.
pub const EMPTY_SLOT: u16 = u16::MAX;

/// Hard upper bound on configurable capacity.
pub const MAX_CAPACITY: usize = 4096;

/// Default number of concurrent records.
pub const DEFAULT_CAPACITY: usize = 64;

const BUCKETS_PER_ENTRY: usize = 2;

/// What to do when a new key arrives at a full table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EvictionPolicy {
    /// Reject the new record with [`CoreError::Capacity`].
    #[default]
    Reject,
    /// Replace the least-recently-updated record that is not alarming.
    EvictOldest,
}

/// Check a client identifier before it is used as a key.
///
/// Identifiers are 1..=46 bytes with no control characters.
pub fn validate_client_id(client_id: &str) -> CoreResult<()> {
    if client_id.is_empty() {
        return Err(CoreError::Validation("clientId must not be empty".into()));
    }
    if client_id.len() > MAX_CLIENT_ID_LEN {
        return Err(CoreError::Validation(format!(
            "clientId exceeds {MAX_CLIENT_ID_LEN} bytes"
        )));
    }
    if client_id.chars().any(char::is_control) {
        return Err(CoreError::Validation(
            "clientId contains control characters".into(),
        ));
    }
    Ok(())
}

/// Check a sensor index.
pub fn validate_tank_index(tank_index: u8) -> CoreResult<()> {
    if tank_index > MAX_TANK_INDEX {
        return Err(CoreError::Validation(format!(
            "tankIndex {tank_index} outside 0..={MAX_TANK_INDEX}"
        )));
    }
    Ok(())
}

/// Hash of a record key.
pub fn record_hash(client_id: &str, tank_index: u8) -> u32 {
    let mut key = Vec::with_capacity(client_id.len() + 2);
    key.extend_from_slice(client_id.as_bytes());
    key.push(0);
    key.push(tank_index);
    sha256_prefix_u32(&key)
}

#[derive(Debug, Clone)]
struct Entry {
    hash: u32,
    record: TankRecord,
}

/// Result of a successful [`TankRecordStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Upserted {
    /// Arena position of the record, valid until the next eviction.
    pub slot: usize,
    pub created: bool,
    /// The record previously held at `slot` was evicted to make room.
    pub evicted: bool,
}

pub struct TankRecordStore {
    entries: Box<[Option<Entry>]>,
    buckets: Box<[u16]>,
    len: usize,
    policy: EvictionPolicy,
    identity_rejections: u64,
    corrupt_reads: u64,
}

impl TankRecordStore {
    /// Create an empty table. `capacity` is clamped to `1..=MAX_CAPACITY`.
    pub fn new(capacity: usize, policy: EvictionPolicy) -> Self {
        let capacity = capacity.clamp(1, MAX_CAPACITY);
        Self {
            entries: vec![None; capacity].into_boxed_slice(),
            buckets: vec![EMPTY_SLOT; capacity * BUCKETS_PER_ENTRY].into_boxed_slice(),
            len: 0,
            policy,
            identity_rejections: 0,
            corrupt_reads: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: EvictionPolicy) {
        self.policy = policy;
    }

    /// Number of keys rejected by identity validation.
    pub fn identity_rejections(&self) -> u64 {
        self.identity_rejections
    }

    /// Number of reads that hit an out-of-bounds or dangling bucket.
    pub fn corrupt_reads(&self) -> u64 {
        self.corrupt_reads
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Look up a record, reporting invalid identities and corrupt index
    /// entries as errors distinct from "not found".
    pub fn try_lookup(&self, client_id: &str, tank_index: u8) -> CoreResult<Option<&TankRecord>> {
        validate_client_id(client_id)?;
        validate_tank_index(tank_index)?;
        let hash = record_hash(client_id, tank_index);
        match self.find_slot(hash, client_id, tank_index)? {
            Some(slot) => Ok(self.entry(slot).ok().map(|e| &e.record)),
            None => Ok(None),
        }
    }

    /// Look up a record. Any error fails closed as `None`.
    pub fn lookup(&mut self, client_id: &str, tank_index: u8) -> Option<&TankRecord> {
        let slot = match self.locate(client_id, tank_index) {
            Ok(slot) => slot?,
            Err(e) => {
                self.note_error(&e);
                return None;
            }
        };
        self.entries
            .get(slot)
            .and_then(Option::as_ref)
            .map(|e| &e.record)
    }

    /// Look up the first record whose key hashes to `hash`.
    ///
    /// Accepts any caller-supplied value; values that cannot be a record hash
    /// and buckets pointing outside the arena both return `None`.
    pub fn lookup_by_hash(&mut self, hash: u64) -> Option<&TankRecord> {
        let Ok(hash) = u32::try_from(hash) else {
            tracing::debug!(hash, "Hash outside record hash space");
            return None;
        };
        let bucket_count = self.buckets.len();
        let start = hash as usize % bucket_count;
        let mut found = None;
        for step in 0..bucket_count {
            let Some(&slot) = self.buckets.get((start + step) % bucket_count) else {
                break;
            };
            if slot == EMPTY_SLOT {
                break;
            }
            match self.entry(usize::from(slot)) {
                Ok(entry) if entry.hash == hash => {
                    found = Some(usize::from(slot));
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    self.note_error(&e);
                    return None;
                }
            }
        }
        found.and_then(|slot| self.entries.get(slot)?.as_ref().map(|e| &e.record))
    }

    /// Record at an arena position, if occupied.
    pub fn get(&self, slot: usize) -> Option<&TankRecord> {
        self.entries.get(slot)?.as_ref().map(|e| &e.record)
    }

    /// Mutable record at an arena position, if occupied.
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut TankRecord> {
        self.entries.get_mut(slot)?.as_mut().map(|e| &mut e.record)
    }

    /// All records in arena order. Stable while the table is not mutated.
    pub fn all(&self) -> impl Iterator<Item = &TankRecord> {
        self.entries.iter().filter_map(|e| e.as_ref().map(|e| &e.record))
    }

    /// Mutable access to every record in arena order.
    pub fn all_mut(&mut self) -> impl Iterator<Item = &mut TankRecord> {
        self.entries
            .iter_mut()
            .filter_map(|e| e.as_mut().map(|e| &mut e.record))
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert or update the record for `(client_id, tank_index)`.
    ///
    /// All checks happen before anything is written: on error the table is
    /// unchanged.
    pub fn upsert(
        &mut self,
        client_id: &str,
        tank_index: u8,
        reading: &Reading,
    ) -> CoreResult<Upserted> {
        let existing = match self.locate(client_id, tank_index) {
            Ok(slot) => slot,
            Err(e) => {
                self.note_error(&e);
                return Err(e);
            }
        };

        if let Some(slot) = existing {
            let capacity = self.capacity();
            let record = self
                .get_mut(slot)
                .ok_or(CoreError::CorruptIndex { slot, capacity })?;
            record.apply_reading(reading);
            return Ok(Upserted {
                slot,
                created: false,
                evicted: false,
            });
        }

        let hash = record_hash(client_id, tank_index);
        let record = TankRecord::new(client_id, tank_index, reading);

        if self.len < self.capacity() {
            let slot = self.len;
            self.entries[slot] = Some(Entry { hash, record });
            self.len += 1;
            self.place(hash, slot)?;
            return Ok(Upserted {
                slot,
                created: true,
                evicted: false,
            });
        }

        let Some(victim) = self.eviction_candidate() else {
            tracing::warn!(
                client_id,
                tank_index,
                capacity = self.capacity(),
                "Record table full, rejecting new tank"
            );
            return Err(CoreError::Capacity {
                capacity: self.capacity(),
            });
        };

        if let Some(old) = self.get(victim) {
            tracing::warn!(
                evicted_client_id = %old.client_id,
                evicted_tank_index = old.tank_index,
                client_id,
                tank_index,
                "Evicting least recently updated record"
            );
        }
        self.entries[victim] = Some(Entry { hash, record });
        self.rebuild_buckets()?;
        Ok(Upserted {
            slot: victim,
            created: true,
            evicted: true,
        })
    }

    /// Change the table capacity, keeping every record.
    pub fn resize(&mut self, capacity: usize) -> CoreResult<()> {
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(CoreError::Validation(format!(
                "capacity must be within 1..={MAX_CAPACITY}"
            )));
        }
        if capacity < self.len {
            return Err(CoreError::Validation(format!(
                "capacity {capacity} is below the {} records currently held",
                self.len
            )));
        }
        if capacity == self.capacity() {
            return Ok(());
        }

        let mut entries: Vec<Option<Entry>> = self
            .entries
            .iter_mut()
            .filter_map(Option::take)
            .map(Some)
            .collect();
        entries.resize(capacity, None);
        self.entries = entries.into_boxed_slice();
        self.buckets = vec![EMPTY_SLOT; capacity * BUCKETS_PER_ENTRY].into_boxed_slice();
        self.rebuild_buckets()?;
        tracing::info!(capacity, records = self.len, "Record table resized");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn locate(&mut self, client_id: &str, tank_index: u8) -> CoreResult<Option<usize>> {
        if let Err(e) = validate_client_id(client_id).and(validate_tank_index(tank_index)) {
            self.identity_rejections += 1;
            return Err(e);
        }
        let hash = record_hash(client_id, tank_index);
        self.find_slot(hash, client_id, tank_index)
    }

    fn find_slot(&self, hash: u32, client_id: &str, tank_index: u8) -> CoreResult<Option<usize>> {
        let bucket_count = self.buckets.len();
        let start = hash as usize % bucket_count;
        for step in 0..bucket_count {
            let slot = self.buckets[(start + step) % bucket_count];
            if slot == EMPTY_SLOT {
                return Ok(None);
            }
            let entry = self.entry(usize::from(slot))?;
            if entry.hash == hash
                && entry.record.tank_index == tank_index
                && entry.record.client_id == client_id
            {
                return Ok(Some(usize::from(slot)));
            }
        }
        Ok(None)
    }

    /// Bounds-checked arena access for a position read out of a bucket.
    fn entry(&self, slot: usize) -> CoreResult<&Entry> {
        let capacity = self.entries.len();
        if slot >= capacity {
            return Err(CoreError::CorruptIndex { slot, capacity });
        }
        self.entries[slot]
            .as_ref()
            .ok_or(CoreError::CorruptIndex { slot, capacity })
    }

    fn place(&mut self, hash: u32, slot: usize) -> CoreResult<()> {
        let value = u16::try_from(slot).map_err(|_| CoreError::CorruptIndex {
            slot,
            capacity: self.capacity(),
        })?;
        let bucket_count = self.buckets.len();
        let start = hash as usize % bucket_count;
        for step in 0..bucket_count {
            let bucket = &mut self.buckets[(start + step) % bucket_count];
            if *bucket == EMPTY_SLOT {
                *bucket = value;
                return Ok(());
            }
        }
        Err(CoreError::Capacity {
            capacity: self.capacity(),
        })
    }

    fn rebuild_buckets(&mut self) -> CoreResult<()> {
        self.buckets.fill(EMPTY_SLOT);
        let placements: Vec<(u32, usize)> = self
            .entries
            .iter()
            .enumerate()
            .filter_map(|(slot, e)| e.as_ref().map(|e| (e.hash, slot)))
            .collect();
        self.len = placements.len();
        for (hash, slot) in placements {
            self.place(hash, slot)?;
        }
        Ok(())
    }

    fn eviction_candidate(&self) -> Option<usize> {
        if self.policy != EvictionPolicy::EvictOldest {
            return None;
        }
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(slot, e)| e.as_ref().map(|e| (slot, &e.record)))
            .filter(|(_, r)| r.alarm_state == AlarmState::Normal)
            .min_by_key(|(_, r)| r.last_update_epoch)
            .map(|(slot, _)| slot)
    }

    fn note_error(&mut self, err: &CoreError) {
        match err {
            CoreError::CorruptIndex { slot, capacity } => {
                self.corrupt_reads += 1;
                tracing::error!(slot, capacity, "Corrupt record index entry");
            }
            CoreError::Validation(msg) => {
                tracing::warn!(reason = %msg, "Rejected record identity");
            }
            _ => {}
        }
    }

    #[cfg(test)]
    fn corrupt_bucket_for(&mut self, client_id: &str, tank_index: u8, value: u16) {
        let hash = record_hash(client_id, tank_index);
        let bucket_count = self.buckets.len();
        let start = hash as usize % bucket_count;
        for step in 0..bucket_count {
            let bucket = &mut self.buckets[(start + step) % bucket_count];
            if *bucket != EMPTY_SLOT {
                *bucket = value;
                return;
            }
        }
    }
}

impl Default for TankRecordStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, EvictionPolicy::Reject)
    }
}
