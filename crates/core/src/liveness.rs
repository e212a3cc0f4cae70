//! Peer liveness from persisted heartbeats.
//!
//! The monitor reports a `PeerDown` incident once when heartbeats stop for
//! longer than the gap threshold while the peer last reported a power loss,
//! and a matching `PeerRestored` when the next heartbeat arrives. The
//! notified flag is part of the persisted checkpoint so a restart does not
//! repeat an incident.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::hashing::sha256_hex;
use crate::types::{is_future, Epoch};

/// Default silence window before a peer is considered down.
pub const DEFAULT_HEARTBEAT_GAP_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    #[default]
    On,
    Off,
}

impl PowerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
        }
    }
}

/// Persisted heartbeat record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatCheckpoint {
    pub last_heartbeat_epoch: Epoch,
    pub last_known_power_state: PowerState,
    #[serde(default)]
    pub down_notified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatPolicy {
    pub gap_threshold_secs: u64,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            gap_threshold_secs: DEFAULT_HEARTBEAT_GAP_SECS,
        }
    }
}

impl HeartbeatPolicy {
    pub fn validate(&self) -> CoreResult<()> {
        if self.gap_threshold_secs == 0 {
            return Err(CoreError::Validation("heartbeat gapThresholdSecs must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LivenessKind {
    PeerDown,
    PeerRestored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LivenessEvent {
    pub kind: LivenessKind,
    pub last_heartbeat_epoch: Epoch,
    pub power_state: PowerState,
    pub epoch: Epoch,
}

impl LivenessEvent {
    pub fn dedup_key(&self) -> String {
        let kind = match self.kind {
            LivenessKind::PeerDown => "down",
            LivenessKind::PeerRestored => "restored",
        };
        // One incident is identified by the heartbeat it followed.
        sha256_hex(format!("liveness|{kind}|{}", self.last_heartbeat_epoch).as_bytes())
    }
}

#[derive(Debug, Default)]
pub struct PeerLivenessMonitor {
    checkpoint: Option<HeartbeatCheckpoint>,
    policy: HeartbeatPolicy,
}

impl PeerLivenessMonitor {
    /// Resume from the checkpoint read at startup, if any.
    pub fn new(checkpoint: Option<HeartbeatCheckpoint>, policy: HeartbeatPolicy) -> Self {
        Self { checkpoint, policy }
    }

    pub fn checkpoint(&self) -> Option<&HeartbeatCheckpoint> {
        self.checkpoint.as_ref()
    }

    pub fn set_policy(&mut self, policy: HeartbeatPolicy) {
        self.policy = policy;
    }

    /// Record a heartbeat received at server time `now`. The caller persists
    /// the updated checkpoint.
    pub fn record_heartbeat(
        &mut self,
        epoch: Epoch,
        power: PowerState,
        now: Epoch,
    ) -> CoreResult<Option<LivenessEvent>> {
        if epoch <= 0 {
            return Err(CoreError::Validation(format!("heartbeat epoch {epoch} is invalid")));
        }
        if is_future(epoch, now) {
            return Err(CoreError::Validation(format!(
                "heartbeat epoch {epoch} is ahead of server time {now}"
            )));
        }
        let previous = self.checkpoint;
        if let Some(prev) = previous {
            // A checkpoint beyond the clock-skew window cannot be a real
            // baseline and is replaced by the next heartbeat.
            if epoch < prev.last_heartbeat_epoch && !is_future(prev.last_heartbeat_epoch, now) {
                return Err(CoreError::Validation(format!(
                    "heartbeat epoch {epoch} precedes checkpoint {}",
                    prev.last_heartbeat_epoch
                )));
            }
        }

        self.checkpoint = Some(HeartbeatCheckpoint {
            last_heartbeat_epoch: epoch,
            last_known_power_state: power,
            down_notified: false,
        });

        let restored = previous.filter(|p| p.down_notified).map(|p| {
            tracing::info!(
                last_heartbeat_epoch = p.last_heartbeat_epoch,
                epoch,
                "Peer heartbeat restored"
            );
            LivenessEvent {
                kind: LivenessKind::PeerRestored,
                last_heartbeat_epoch: p.last_heartbeat_epoch,
                power_state: power,
                epoch,
            }
        });
        Ok(restored)
    }

    /// Check the gap since the last heartbeat. Emits at most once per incident;
    /// when it does, the checkpoint changed and must be persisted.
    pub fn check_liveness(&mut self, now: Epoch) -> Option<LivenessEvent> {
        let gap = i64::try_from(self.policy.gap_threshold_secs).unwrap_or(i64::MAX);
        let checkpoint = self.checkpoint.as_mut()?;
        if checkpoint.down_notified
            || checkpoint.last_known_power_state != PowerState::Off
            || now.saturating_sub(checkpoint.last_heartbeat_epoch) <= gap
        {
            return None;
        }

        checkpoint.down_notified = true;
        tracing::warn!(
            last_heartbeat_epoch = checkpoint.last_heartbeat_epoch,
            now,
            "Peer silent beyond heartbeat window after power loss"
        );
        Some(LivenessEvent {
            kind: LivenessKind::PeerDown,
            last_heartbeat_epoch: checkpoint.last_heartbeat_epoch,
            power_state: checkpoint.last_known_power_state,
            epoch: now,
        })
    }
}
