//! Versioned site configuration and its persistence.
//!
//! The persisted document is a single JSON blob tagged with `schemaVersion`.
//! A document with any other version is refused before its fields are read.
//! Writes go through [`ConfigStore::prepare`] (parse, merge and validate on a
//! copy) and [`ConfigStore::commit`] (swap in memory, then persist), so a
//! rejected update never touches the live config.
//!
//! When a write fails the new config stays live in memory and the store
//! reports itself degraded until a later write succeeds.

use serde::{Deserialize, Serialize};

use crate::alarm::{AlarmLimits, AlarmThresholds, TankAlarmSettings};
use crate::auth::{AuthPolicy, Credential};
use crate::error::{CoreError, CoreResult};
use crate::liveness::{HeartbeatCheckpoint, HeartbeatPolicy};
use crate::persist::{BlobKey, BlobStore};
use crate::power::BatteryProfile;
use crate::schema::{MAX_LABEL_LEN, MAX_SITE_LABEL_LEN};
use crate::store::{
    validate_client_id, validate_tank_index, EvictionPolicy, DEFAULT_CAPACITY, MAX_CAPACITY,
};

/// The only config schema this build understands.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

const MAX_CONTACTS: usize = 16;
const MAX_CONTACT_LEN: usize = 96;
const MAX_TANK_OVERRIDES: usize = MAX_CAPACITY;

// ---------------------------------------------------------------------------
// Config model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SiteInfo {
    pub server_name: String,
    pub location: String,
}

impl Default for SiteInfo {
    fn default() -> Self {
        Self {
            server_name: "Tank Alarm Server".into(),
            location: String::new(),
        }
    }
}

/// Per-tank metadata and threshold overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TankOverride {
    pub client_id: String,
    pub tank_index: u8,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub site_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thresholds: Option<AlarmThresholds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_interval_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub stuck_detection: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContactList {
    /// Alarm SMS recipients.
    pub sms: Vec<String>,
    /// Alarm email recipients.
    pub email: Vec<String>,
    /// Daily report email recipients.
    pub daily_report: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DailyReportConfig {
    pub enabled: bool,
    pub hour: u8,
    pub minute: u8,
}

impl Default for DailyReportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hour: 5,
            minute: 0,
        }
    }
}

/// Live server configuration.
///
/// Serializing this type yields the redacted view: the credential is never
/// written by serde.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SiteConfig {
    pub schema_version: u32,
    pub site: SiteInfo,
    pub capacity: usize,
    pub eviction_policy: EvictionPolicy,
    pub thresholds: AlarmThresholds,
    pub tanks: Vec<TankOverride>,
    pub alarm: AlarmLimits,
    pub contacts: ContactList,
    pub daily_report: DailyReportConfig,
    pub heartbeat: HeartbeatPolicy,
    pub auth: AuthPolicy,
    pub battery: BatteryProfile,
    #[serde(skip)]
    pub credential: Credential,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            site: SiteInfo::default(),
            capacity: DEFAULT_CAPACITY,
            eviction_policy: EvictionPolicy::default(),
            thresholds: AlarmThresholds::default(),
            tanks: Vec::new(),
            alarm: AlarmLimits::default(),
            contacts: ContactList::default(),
            daily_report: DailyReportConfig::default(),
            heartbeat: HeartbeatPolicy::default(),
            auth: AuthPolicy::default(),
            battery: BatteryProfile::default(),
            credential: Credential::empty(),
        }
    }
}

impl SiteConfig {
    /// Validate every field. Nothing is applied unless this passes.
    pub fn validate(&self) -> CoreResult<()> {
        if self.schema_version != CONFIG_SCHEMA_VERSION {
            return Err(CoreError::ConfigVersion {
                found: self.schema_version,
                expected: CONFIG_SCHEMA_VERSION,
            });
        }
        if self.capacity == 0 || self.capacity > MAX_CAPACITY {
            return Err(CoreError::Validation(format!(
                "capacity must be within 1..={MAX_CAPACITY}"
            )));
        }
        bounded("serverName", &self.site.server_name, MAX_SITE_LABEL_LEN)?;
        bounded("location", &self.site.location, MAX_SITE_LABEL_LEN)?;

        self.thresholds.validate()?;
        self.alarm.validate()?;
        self.heartbeat.validate()?;
        self.auth.validate()?;
        self.battery.validate()?;

        if self.daily_report.hour > 23 || self.daily_report.minute > 59 {
            return Err(CoreError::Validation(format!(
                "daily report time {:02}:{:02} is invalid",
                self.daily_report.hour, self.daily_report.minute
            )));
        }

        for (name, list) in [
            ("sms", &self.contacts.sms),
            ("email", &self.contacts.email),
            ("dailyReport", &self.contacts.daily_report),
        ] {
            if list.len() > MAX_CONTACTS {
                return Err(CoreError::Validation(format!(
                    "contacts.{name} holds more than {MAX_CONTACTS} entries"
                )));
            }
            for contact in list {
                if contact.trim().is_empty() {
                    return Err(CoreError::Validation(format!("contacts.{name} has a blank entry")));
                }
                bounded(name, contact, MAX_CONTACT_LEN)?;
            }
        }

        if self.tanks.len() > MAX_TANK_OVERRIDES {
            return Err(CoreError::Validation("too many tank overrides".into()));
        }
        for (i, tank) in self.tanks.iter().enumerate() {
            validate_client_id(&tank.client_id)?;
            validate_tank_index(tank.tank_index)?;
            bounded("label", &tank.label, MAX_LABEL_LEN)?;
            bounded("siteLabel", &tank.site_label, MAX_SITE_LABEL_LEN)?;
            if let Some(t) = &tank.thresholds {
                t.validate()?;
            }
            if tank.expected_interval_secs == Some(0) {
                return Err(CoreError::Validation(
                    "expectedIntervalSecs must be positive".into(),
                ));
            }
            let duplicate = self.tanks[..i]
                .iter()
                .any(|t| t.client_id == tank.client_id && t.tank_index == tank.tank_index);
            if duplicate {
                return Err(CoreError::Validation(format!(
                    "duplicate override for {}/{}",
                    tank.client_id, tank.tank_index
                )));
            }
        }
        Ok(())
    }

    pub fn tank(&self, client_id: &str, tank_index: u8) -> Option<&TankOverride> {
        self.tanks
            .iter()
            .find(|t| t.tank_index == tank_index && t.client_id == client_id)
    }

    /// Alarm settings for a tank, falling back to the site defaults.
    pub fn settings_for(&self, client_id: &str, tank_index: u8) -> TankAlarmSettings {
        let tank = self.tank(client_id, tank_index);
        TankAlarmSettings {
            thresholds: tank
                .and_then(|t| t.thresholds)
                .unwrap_or(self.thresholds),
            stuck_detection: tank.map_or(true, |t| t.stuck_detection),
            expected_interval_secs: tank
                .and_then(|t| t.expected_interval_secs)
                .unwrap_or(self.alarm.expected_interval_secs),
        }
    }

    /// `(label, siteLabel)` configured for a tank, empty when unset.
    pub fn labels_for(&self, client_id: &str, tank_index: u8) -> (&str, &str) {
        self.tank(client_id, tank_index)
            .map_or(("", ""), |t| (t.label.as_str(), t.site_label.as_str()))
    }
}

fn bounded(name: &str, value: &str, max: usize) -> CoreResult<()> {
    if value.len() > max {
        return Err(CoreError::Validation(format!("{name} exceeds {max} bytes")));
    }
    if value.chars().any(char::is_control) {
        return Err(CoreError::Validation(format!("{name} contains control characters")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Wire forms
// ---------------------------------------------------------------------------

/// The persisted document: the config plus the admin PIN.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigDocument {
    #[serde(flatten)]
    config: SiteConfig,
    #[serde(default)]
    admin_pin: String,
}

/// Read view of the config returned to admin clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedactedConfig {
    #[serde(flatten)]
    pub config: SiteConfig,
    pub admin_pin_set: bool,
}

impl From<&SiteConfig> for RedactedConfig {
    fn from(config: &SiteConfig) -> Self {
        Self {
            config: config.clone(),
            admin_pin_set: !config.credential.is_empty(),
        }
    }
}

/// A partial config write. Absent fields keep their current value.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigUpdate {
    pub schema_version: u32,
    pub site: Option<SiteInfo>,
    pub capacity: Option<usize>,
    pub eviction_policy: Option<EvictionPolicy>,
    pub thresholds: Option<AlarmThresholds>,
    pub tanks: Option<Vec<TankOverride>>,
    pub alarm: Option<AlarmLimits>,
    pub contacts: Option<ContactList>,
    pub daily_report: Option<DailyReportConfig>,
    pub heartbeat: Option<HeartbeatPolicy>,
    pub auth: Option<AuthPolicy>,
    pub battery: Option<BatteryProfile>,
    pub admin_pin: Option<String>,
}

impl std::fmt::Debug for ConfigUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigUpdate")
            .field("schema_version", &self.schema_version)
            .field("capacity", &self.capacity)
            .field("admin_pin", &self.admin_pin.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

/// Encode a config as its persisted document.
pub fn encode(config: &SiteConfig) -> CoreResult<Vec<u8>> {
    let doc = ConfigDocument {
        config: config.clone(),
        admin_pin: config.credential.expose().to_string(),
    };
    serde_json::to_vec_pretty(&doc).map_err(|e| CoreError::Persistence(e.to_string()))
}

/// Decode and fully validate a persisted document.
pub fn decode(bytes: &[u8]) -> CoreResult<SiteConfig> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| CoreError::Validation(format!("config is not valid JSON: {e}")))?;
    let found = value
        .get("schemaVersion")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| CoreError::Validation("config has no schemaVersion".into()))?;
    if found != u64::from(CONFIG_SCHEMA_VERSION) {
        return Err(CoreError::ConfigVersion {
            found: u32::try_from(found).unwrap_or(u32::MAX),
            expected: CONFIG_SCHEMA_VERSION,
        });
    }

    let doc: ConfigDocument = serde_json::from_value(value)
        .map_err(|e| CoreError::Validation(format!("config fields are invalid: {e}")))?;
    let mut config = doc.config;
    if !doc.admin_pin.is_empty() {
        config.credential = Credential::new(&doc.admin_pin)?;
    }
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Owner of the live config and the heartbeat checkpoint blob.
pub struct ConfigStore {
    blobs: Box<dyn BlobStore>,
    current: SiteConfig,
    config_dirty: bool,
    pending_heartbeat: Option<HeartbeatCheckpoint>,
    load_failed: bool,
}

impl ConfigStore {
    /// Load the persisted config, falling back to defaults.
    ///
    /// A missing blob is a first boot: defaults are used (with the bootstrap
    /// PIN, if given) and written out. An unreadable or unrecognised blob is
    /// left untouched on disk and the store starts degraded.
    pub fn load(blobs: Box<dyn BlobStore>, bootstrap_pin: Option<&str>) -> Self {
        let mut store = Self {
            blobs,
            current: SiteConfig::default(),
            config_dirty: false,
            pending_heartbeat: None,
            load_failed: false,
        };

        match store.blobs.read(BlobKey::Config) {
            Ok(Some(bytes)) => match decode(&bytes) {
                Ok(config) => {
                    tracing::info!(
                        capacity = config.capacity,
                        tanks = config.tanks.len(),
                        "Loaded site config"
                    );
                    store.current = config;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Persisted config rejected, running on defaults");
                    store.load_failed = true;
                }
            },
            Ok(None) => {
                if let Some(pin) = bootstrap_pin {
                    match Credential::new(pin) {
                        Ok(credential) => store.current.credential = credential,
                        Err(e) => tracing::warn!(error = %e, "Ignoring invalid bootstrap PIN"),
                    }
                }
                if store.current.credential.is_empty() {
                    tracing::warn!("No admin PIN configured, admin writes are disabled");
                }
                tracing::info!("No persisted config, writing defaults");
                store.config_dirty = true;
                store.flush();
            }
            Err(e) => {
                tracing::error!(error = %e, "Config read failed, running on defaults");
                store.load_failed = true;
            }
        }
        store
    }

    pub fn current(&self) -> &SiteConfig {
        &self.current
    }

    /// Parse, merge and validate an update on a copy of the live config.
    ///
    /// `record_count` is the number of records currently held; capacity may
    /// not drop below it.
    pub fn prepare(&self, update: ConfigUpdate, record_count: usize) -> CoreResult<SiteConfig> {
        if update.schema_version != CONFIG_SCHEMA_VERSION {
            return Err(CoreError::ConfigVersion {
                found: update.schema_version,
                expected: CONFIG_SCHEMA_VERSION,
            });
        }

        let mut next = self.current.clone();
        if let Some(site) = update.site {
            next.site = site;
        }
        if let Some(capacity) = update.capacity {
            next.capacity = capacity;
        }
        if let Some(policy) = update.eviction_policy {
            next.eviction_policy = policy;
        }
        if let Some(thresholds) = update.thresholds {
            next.thresholds = thresholds;
        }
        if let Some(tanks) = update.tanks {
            next.tanks = tanks;
        }
        if let Some(alarm) = update.alarm {
            next.alarm = alarm;
        }
        if let Some(contacts) = update.contacts {
            next.contacts = contacts;
        }
        if let Some(daily_report) = update.daily_report {
            next.daily_report = daily_report;
        }
        if let Some(heartbeat) = update.heartbeat {
            next.heartbeat = heartbeat;
        }
        if let Some(auth) = update.auth {
            next.auth = auth;
        }
        if let Some(battery) = update.battery {
            next.battery = battery;
        }
        if let Some(pin) = update.admin_pin {
            next.credential = Credential::new(&pin)?;
        }

        next.validate()?;
        if next.capacity < record_count {
            return Err(CoreError::Validation(format!(
                "capacity {} is below the {record_count} records currently held",
                next.capacity
            )));
        }
        Ok(next)
    }

    /// Make `next` the live config and persist it. Returns whether the write
    /// landed.
    pub fn commit(&mut self, next: SiteConfig) -> bool {
        self.current = next;
        self.config_dirty = true;
        self.flush();
        !self.config_dirty
    }

    /// Read the heartbeat checkpoint saved by a previous run.
    pub fn load_heartbeat(&mut self) -> Option<HeartbeatCheckpoint> {
        let bytes = match self.blobs.read(BlobKey::Heartbeat) {
            Ok(bytes) => bytes?,
            Err(e) => {
                tracing::error!(error = %e, "Heartbeat checkpoint read failed");
                self.load_failed = true;
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                tracing::error!(error = %e, "Heartbeat checkpoint is corrupt, ignoring");
                None
            }
        }
    }

    /// Persist the heartbeat checkpoint. Returns whether the write landed.
    pub fn save_heartbeat(&mut self, checkpoint: HeartbeatCheckpoint) -> bool {
        self.pending_heartbeat = Some(checkpoint);
        self.flush();
        self.pending_heartbeat.is_none()
    }

    /// Some state exists only in memory.
    pub fn is_degraded(&self) -> bool {
        self.load_failed || self.config_dirty || self.pending_heartbeat.is_some()
    }

    /// Write whatever is pending.
    fn flush(&mut self) {
        if self.config_dirty {
            match encode(&self.current).and_then(|b| self.blobs.write(BlobKey::Config, &b)) {
                Ok(()) => {
                    self.config_dirty = false;
                    self.load_failed = false;
                }
                Err(e) => tracing::error!(error = %e, "Config write failed, keeping it in memory"),
            }
        }
        if let Some(checkpoint) = self.pending_heartbeat {
            let written = serde_json::to_vec(&checkpoint)
                .map_err(|e| CoreError::Persistence(e.to_string()))
                .and_then(|b| self.blobs.write(BlobKey::Heartbeat, &b));
            match written {
                Ok(()) => self.pending_heartbeat = None,
                Err(e) => tracing::error!(error = %e, "Heartbeat checkpoint write failed"),
            }
        }
    }
}
