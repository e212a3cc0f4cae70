/// All timestamps exchanged with field clients are Unix epoch seconds.
pub type Epoch = i64;

/// Current wall-clock time as a Unix epoch.
pub fn now_epoch() -> Epoch {
    chrono::Utc::now().timestamp()
}

/// Convert an epoch to a UTC timestamp for display, if it is representable.
pub fn epoch_to_datetime(epoch: Epoch) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp(epoch, 0)
}

/// How far ahead of the server clock a field timestamp may run before it is
/// refused.
pub const MAX_CLOCK_SKEW_SECS: Epoch = 60 * 60;

/// Whether `epoch` lies further in the future than clock skew explains.
pub fn is_future(epoch: Epoch, now: Epoch) -> bool {
    epoch > now.saturating_add(MAX_CLOCK_SKEW_SECS)
}
