//! The server decision engine as one value.
//!
//! [`ServerCore`] owns every piece of core state and exposes the operations
//! the host loop and the admin API drive. Callers serialise access (the API
//! keeps it behind a single mutex), so each operation sees and leaves a
//! consistent table.

use serde::Serialize;

use crate::alarm::{AlarmEngine, AlarmEvent};
use crate::auth::{AuthGuard, Authorized, GuardState};
use crate::config::{ConfigStore, ConfigUpdate, RedactedConfig, SiteConfig};
use crate::error::{CoreError, CoreResult};
use crate::ingest::{IngestReport, IngestStats, SyncIngestor};
use crate::liveness::{HeartbeatCheckpoint, LivenessEvent, PeerLivenessMonitor, PowerState};
use crate::persist::BlobStore;
use crate::power::{observe_power, PowerEvent};
use crate::schema::{SyncRecord, TankRecord, ViewerSummary};
use crate::store::TankRecordStore;
use crate::summary::build_summary;
use crate::types::Epoch;

/// Anything the core hands to the notification dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "event", rename_all = "camelCase")]
pub enum CoreEvent {
    Alarm(AlarmEvent),
    Power(PowerEvent),
    Liveness(LivenessEvent),
}

impl CoreEvent {
    pub fn dedup_key(&self) -> String {
        match self {
            Self::Alarm(e) => e.dedup_key(),
            Self::Power(e) => e.dedup_key(),
            Self::Liveness(e) => e.dedup_key(),
        }
    }
}

/// Result of one accepted sync record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    #[serde(flatten)]
    pub report: IngestReport,
    pub events: Vec<CoreEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecorded {
    pub event: Option<LivenessEvent>,
    /// The checkpoint reached storage.
    pub durable: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigApplied {
    pub config: RedactedConfig,
    pub durable: bool,
}

/// Counters surfaced on the health endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreStats {
    pub records: usize,
    pub capacity: usize,
    pub ingest: IngestStats,
    pub identity_rejections: u64,
    pub corrupt_reads: u64,
    pub auth_comparisons: u64,
}

pub struct ServerCore {
    config: ConfigStore,
    store: TankRecordStore,
    ingestor: SyncIngestor,
    alarms: AlarmEngine,
    liveness: PeerLivenessMonitor,
    auth: AuthGuard,
}

impl ServerCore {
    /// Load persisted state and build the engine.
    pub fn bootstrap(blobs: Box<dyn BlobStore>, bootstrap_pin: Option<&str>) -> Self {
        let mut config = ConfigStore::load(blobs, bootstrap_pin);
        let heartbeat = config.load_heartbeat();
        let site = config.current();
        let store = TankRecordStore::new(site.capacity, site.eviction_policy);
        let alarms = AlarmEngine::new(site.alarm);
        let liveness = PeerLivenessMonitor::new(heartbeat, site.heartbeat);

        tracing::info!(
            capacity = site.capacity,
            degraded = config.is_degraded(),
            has_heartbeat = heartbeat.is_some(),
            "Server core ready"
        );

        Self {
            config,
            store,
            ingestor: SyncIngestor::new(),
            alarms,
            liveness,
            auth: AuthGuard::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Relay path
    // -----------------------------------------------------------------------

    /// Parse and ingest a raw relay payload received at `now`.
    pub fn ingest_bytes(&mut self, payload: &[u8], now: Epoch) -> CoreResult<SyncOutcome> {
        let record = self.ingestor.parse_bytes(payload)?;
        self.ingest(&record, now)
    }

    /// Ingest one sync record and evaluate alarms for the touched tank.
    pub fn ingest(&mut self, record: &SyncRecord, now: Epoch) -> CoreResult<SyncOutcome> {
        let report = self.ingestor.ingest(&mut self.store, record, now)?;
        let Some(slot) = report.slot else {
            return Ok(SyncOutcome {
                report,
                events: Vec::new(),
            });
        };

        let site = self.config.current();
        let capacity = self.store.capacity();
        let tank = self
            .store
            .get_mut(slot)
            .ok_or(CoreError::CorruptIndex { slot, capacity })?;

        let (label, site_label) = site.labels_for(&tank.client_id, tank.tank_index);
        if tank.label != label || tank.site_label != site_label {
            tank.label = label.to_string();
            tank.site_label = site_label.to_string();
        }

        let mut events = Vec::new();
        if let Some(event) = observe_power(tank, &site.battery) {
            events.push(CoreEvent::Power(event));
        }
        let settings = site.settings_for(&tank.client_id, tank.tank_index);
        if let Some(event) = self
            .alarms
            .evaluate_update(tank, report.previous_height, &settings)
        {
            events.push(CoreEvent::Alarm(event));
        }

        Ok(SyncOutcome { report, events })
    }

    /// Mark silent tanks as failed.
    pub fn sweep_overdue(&mut self, now: Epoch) -> Vec<AlarmEvent> {
        let site = self.config.current();
        self.alarms.sweep_overdue(&mut self.store, now, |record| {
            site.settings_for(&record.client_id, record.tank_index)
                .expected_interval_secs
        })
    }

    // -----------------------------------------------------------------------
    // Liveness
    // -----------------------------------------------------------------------

    pub fn record_heartbeat(
        &mut self,
        epoch: Epoch,
        power: PowerState,
        now: Epoch,
    ) -> CoreResult<HeartbeatRecorded> {
        let event = self.liveness.record_heartbeat(epoch, power, now)?;
        let durable = self.persist_checkpoint();
        Ok(HeartbeatRecorded { event, durable })
    }

    pub fn check_liveness(&mut self, now: Epoch) -> Option<LivenessEvent> {
        let event = self.liveness.check_liveness(now)?;
        self.persist_checkpoint();
        Some(event)
    }

    pub fn heartbeat(&self) -> Option<&HeartbeatCheckpoint> {
        self.liveness.checkpoint()
    }

    fn persist_checkpoint(&mut self) -> bool {
        match self.liveness.checkpoint() {
            Some(checkpoint) => self.config.save_heartbeat(*checkpoint),
            None => true,
        }
    }

    // -----------------------------------------------------------------------
    // Admin
    // -----------------------------------------------------------------------

    pub fn authenticate(&mut self, secret: &[u8], now: Epoch) -> CoreResult<Authorized> {
        let site = self.config.current();
        Ok(self.auth.attempt(secret, &site.credential, &site.auth, now)?)
    }

    pub fn auth_state(&self, now: Epoch) -> GuardState {
        self.auth.state(now)
    }

    /// Authenticate, then validate and apply a config write atomically.
    pub fn update_config(
        &mut self,
        secret: &[u8],
        update: ConfigUpdate,
        now: Epoch,
    ) -> CoreResult<ConfigApplied> {
        self.authenticate(secret, now)?;

        let next = self.config.prepare(update, self.store.len())?;
        self.store.resize(next.capacity)?;
        self.store.set_policy(next.eviction_policy);
        self.alarms.set_limits(next.alarm);
        self.liveness.set_policy(next.heartbeat);
        for tank in self.store.all_mut() {
            let (label, site_label) = next.labels_for(&tank.client_id, tank.tank_index);
            tank.label = label.to_string();
            tank.site_label = site_label.to_string();
        }

        let durable = self.config.commit(next);
        tracing::info!(durable, "Site config updated");
        Ok(ConfigApplied {
            config: self.config_view(),
            durable,
        })
    }

    pub fn list_records(&self) -> Vec<TankRecord> {
        self.store.all().cloned().collect()
    }

    pub fn get_record(&self, client_id: &str, tank_index: u8) -> CoreResult<TankRecord> {
        self.store
            .try_lookup(client_id, tank_index)?
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("tank {client_id}/{tank_index}")))
    }

    pub fn summary(&self, now: Epoch) -> ViewerSummary {
        build_summary(&self.store, &self.config.current().site, now)
    }

    pub fn config_view(&self) -> RedactedConfig {
        RedactedConfig::from(self.config.current())
    }

    pub fn site_config(&self) -> &SiteConfig {
        self.config.current()
    }

    /// Some state could not be persisted and lives only in memory.
    pub fn is_degraded(&self) -> bool {
        self.config.is_degraded()
    }

    pub fn stats(&self) -> CoreStats {
        CoreStats {
            records: self.store.len(),
            capacity: self.store.capacity(),
            ingest: self.ingestor.stats(),
            identity_rejections: self.store.identity_rejections(),
            corrupt_reads: self.store.corrupt_reads(),
            auth_comparisons: self.auth.comparisons(),
        }
    }
}
