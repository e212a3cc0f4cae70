//! Admin PIN verification with exponential backoff and lockout.
//!
//! Attempt counters live in an explicit [`AuthGuard`] value owned by the
//! caller. They are not persisted, so a restart resets them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AuthError, CoreError, CoreResult};
use crate::types::Epoch;

/// Upper bound on a stored secret, and the fixed width of every comparison.
pub const MAX_SECRET_LEN: usize = 32;

/// Shortest PIN accepted by a config write.
pub const MIN_SECRET_LEN: usize = 4;

/// Throttling policy for admin authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthPolicy {
    pub max_failures: u32,
    pub lockout_secs: u64,
    pub backoff_cap_secs: u64,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            max_failures: 5,
            lockout_secs: 30,
            backoff_cap_secs: 30,
        }
    }
}

impl AuthPolicy {
    pub fn validate(&self) -> CoreResult<()> {
        if self.max_failures == 0 || self.lockout_secs == 0 {
            return Err(CoreError::Validation(
                "auth maxFailures and lockoutSecs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Delay imposed after the `failures`-th consecutive failure.
    pub fn backoff_secs(&self, failures: u32) -> u64 {
        let exp = failures.saturating_sub(1).min(63);
        (1u64 << exp).min(self.backoff_cap_secs)
    }
}

/// The stored admin secret: fixed-size buffer plus explicit length.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential {
    bytes: [u8; MAX_SECRET_LEN],
    len: u8,
}

impl Credential {
    /// Build a credential from a PIN, enforcing length and character rules.
    pub fn new(pin: &str) -> CoreResult<Self> {
        let raw = pin.as_bytes();
        if raw.len() < MIN_SECRET_LEN || raw.len() > MAX_SECRET_LEN {
            return Err(CoreError::Validation(format!(
                "PIN must be {MIN_SECRET_LEN}..={MAX_SECRET_LEN} characters"
            )));
        }
        if !raw.iter().all(|b| b.is_ascii_graphic()) {
            return Err(CoreError::Validation(
                "PIN must be printable ASCII without spaces".into(),
            ));
        }
        let mut bytes = [0u8; MAX_SECRET_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self {
            bytes,
            len: raw.len() as u8,
        })
    }

    /// An unprovisioned credential. Every attempt against it fails.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The PIN text, for the persistence encoder only.
    pub(crate) fn expose(&self) -> &str {
        std::str::from_utf8(&self.bytes[..usize::from(self.len)]).unwrap_or_default()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Compare a supplied secret against the stored credential in fixed time.
///
/// Always walks all [`MAX_SECRET_LEN`] bytes and folds the length difference
/// into the same accumulator, so neither the mismatch position nor a length
/// mismatch changes the amount of work done.
pub fn constant_time_matches(supplied: &[u8], stored: &Credential) -> bool {
    let mut acc = supplied.len() ^ usize::from(stored.len);
    for i in 0..MAX_SECRET_LEN {
        let b = supplied.get(i).copied().unwrap_or(0);
        acc |= usize::from(b ^ stored.bytes[i]);
    }
    std::hint::black_box(acc) == 0
}

/// Proof of a successful attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authorized {
    pub epoch: Epoch,
}

/// Guard state as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum GuardState {
    Open,
    Locked { until: Epoch },
}

/// Process-lifetime attempt counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthAttemptState {
    pub failure_count: u32,
    pub last_failure_epoch: Epoch,
    pub lockout_until_epoch: Epoch,
    /// Earliest epoch at which the next attempt is compared.
    pub retry_not_before: Epoch,
}

#[derive(Debug, Default)]
pub struct AuthGuard {
    attempts: AuthAttemptState,
    comparisons: u64,
}

impl AuthGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> &AuthAttemptState {
        &self.attempts
    }

    /// Number of secret comparisons actually performed.
    pub fn comparisons(&self) -> u64 {
        self.comparisons
    }

    pub fn state(&self, now: Epoch) -> GuardState {
        if self.attempts.lockout_until_epoch > now {
            GuardState::Locked {
                until: self.attempts.lockout_until_epoch,
            }
        } else {
            GuardState::Open
        }
    }

    /// Check a supplied secret.
    pub fn attempt(
        &mut self,
        supplied: &[u8],
        credential: &Credential,
        policy: &AuthPolicy,
        now: Epoch,
    ) -> Result<Authorized, AuthError> {
        if self.attempts.lockout_until_epoch != 0 {
            if now < self.attempts.lockout_until_epoch {
                return Err(AuthError::Locked {
                    until: self.attempts.lockout_until_epoch,
                });
            }
            tracing::info!(
                locked_until = self.attempts.lockout_until_epoch,
                "Admin lockout expired"
            );
            self.attempts = AuthAttemptState::default();
        }

        if now < self.attempts.retry_not_before {
            return Err(AuthError::Throttled {
                retry_after_secs: (self.attempts.retry_not_before - now).unsigned_abs(),
            });
        }

        self.comparisons += 1;
        let matched = constant_time_matches(supplied, credential);
        if matched && !credential.is_empty() {
            if self.attempts.failure_count > 0 {
                tracing::info!(
                    previous_failures = self.attempts.failure_count,
                    "Admin authenticated after failures"
                );
            }
            self.attempts = AuthAttemptState::default();
            return Ok(Authorized { epoch: now });
        }

        self.attempts.failure_count = self.attempts.failure_count.saturating_add(1);
        self.attempts.last_failure_epoch = now;

        if self.attempts.failure_count >= policy.max_failures {
            let until = now.saturating_add_unsigned(policy.lockout_secs);
            self.attempts.lockout_until_epoch = until;
            tracing::warn!(
                failures = self.attempts.failure_count,
                locked_until = until,
                "Admin authentication locked out"
            );
            return Err(AuthError::Invalid {
                retry_after_secs: policy.lockout_secs,
            });
        }

        let delay = policy.backoff_secs(self.attempts.failure_count);
        self.attempts.retry_not_before = now.saturating_add_unsigned(delay);
        tracing::warn!(
            failures = self.attempts.failure_count,
            retry_after_secs = delay,
            "Admin authentication failed"
        );
        Err(AuthError::Invalid {
            retry_after_secs: delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use assert_matches::assert_matches;

    use super::*;

    fn pin() -> Credential {
        Credential::new("4921").expect("valid pin")
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = AuthPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|n| policy.backoff_secs(n)).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn correct_pin_is_accepted() {
        let mut guard = AuthGuard::new();
        let ok = guard.attempt(b"4921", &pin(), &AuthPolicy::default(), 100);
        assert_matches!(ok, Ok(Authorized { epoch: 100 }));
    }

    #[test]
    fn wrong_pin_reports_backoff_and_throttles_early_retry() {
        let mut guard = AuthGuard::new();
        let policy = AuthPolicy::default();
        assert_matches!(
            guard.attempt(b"0000", &pin(), &policy, 100),
            Err(AuthError::Invalid { retry_after_secs: 1 })
        );
        assert_matches!(
            guard.attempt(b"4921", &pin(), &policy, 100),
            Err(AuthError::Throttled { retry_after_secs: 1 })
        );
        assert_eq!(guard.attempts().failure_count, 1, "throttled attempts are not counted");
        assert_eq!(guard.comparisons(), 1);

        assert_matches!(guard.attempt(b"4921", &pin(), &policy, 101), Ok(_));
        assert_eq!(guard.attempts().failure_count, 0);
    }

    #[test]
    fn five_failures_lock_then_expire() {
        let mut guard = AuthGuard::new();
        let policy = AuthPolicy::default();
        let mut now = 1_000;
        for n in 1..=5u32 {
            let result = guard.attempt(b"9999", &pin(), &policy, now);
            assert_matches!(result, Err(AuthError::Invalid { .. }));
            now += policy.backoff_secs(n) as i64;
        }
        let locked_at = 1_000 + 1 + 2 + 4 + 8;
        assert_eq!(guard.state(locked_at), GuardState::Locked { until: locked_at + 30 });

        let comparisons = guard.comparisons();
        assert_matches!(
            guard.attempt(b"4921", &pin(), &policy, locked_at + 1),
            Err(AuthError::Locked { until }) if until == locked_at + 30
        );
        assert_eq!(guard.comparisons(), comparisons, "no comparison while locked");

        assert_matches!(guard.attempt(b"4921", &pin(), &policy, locked_at + 30), Ok(_));
        assert_eq!(guard.state(locked_at + 30), GuardState::Open);
    }

    #[test]
    fn empty_credential_never_authenticates() {
        let mut guard = AuthGuard::new();
        assert_matches!(
            guard.attempt(b"", &Credential::empty(), &AuthPolicy::default(), 1),
            Err(AuthError::Invalid { .. })
        );
    }

    #[test]
    fn comparison_rejects_prefixes_and_extensions() {
        let stored = pin();
        assert!(constant_time_matches(b"4921", &stored));
        assert!(!constant_time_matches(b"492", &stored));
        assert!(!constant_time_matches(b"49210", &stored));
        assert!(!constant_time_matches(b"4921\0", &stored));
        assert!(!constant_time_matches(&[b'4'; 64], &stored));
    }

    #[test]
    fn credential_rules_and_redaction() {
        assert!(Credential::new("123").is_err());
        assert!(Credential::new(&"1".repeat(33)).is_err());
        assert!(Credential::new("12 4").is_err());
        let cred = Credential::new("a-long-admin-pin").expect("valid");
        assert_eq!(format!("{cred:?}"), "Credential(<redacted>)");
        assert_eq!(cred.expose(), "a-long-admin-pin");
    }

    fn time_comparisons(supplied: &[u8], stored: &Credential) -> Duration {
        (0..5)
            .map(|_| {
                let start = Instant::now();
                for _ in 0..20_000 {
                    std::hint::black_box(constant_time_matches(
                        std::hint::black_box(supplied),
                        stored,
                    ));
                }
                start.elapsed()
            })
            .min()
            .unwrap_or_default()
    }

    #[test]
    fn comparison_time_does_not_depend_on_length() {
        let stored = Credential::new("73914826").expect("valid");
        let same_length = time_comparisons(b"00000000", &stored);
        let wrong_length = time_comparisons(b"0", &stored);
        let near_miss = time_comparisons(b"73914820", &stored);

        let fastest = same_length.min(wrong_length).min(near_miss).as_nanos().max(1);
        let slowest = same_length.max(wrong_length).max(near_miss).as_nanos();
        assert!(
            slowest <= fastest * 3,
            "comparison timings diverge: {same_length:?} / {wrong_length:?} / {near_miss:?}"
        );
    }
}
