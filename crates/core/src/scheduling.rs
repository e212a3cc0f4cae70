//! Wall-clock alignment for daily jobs.

use crate::types::Epoch;

const SECONDS_PER_DAY: Epoch = 86_400;

/// The first epoch strictly after `now` that falls on `hour:minute` UTC.
pub fn next_aligned_epoch(now: Epoch, hour: u8, minute: u8) -> Epoch {
    let offset = Epoch::from(hour) * 3600 + Epoch::from(minute) * 60;
    let mut next = now.div_euclid(SECONDS_PER_DAY) * SECONDS_PER_DAY + offset;
    while next <= now {
        next += SECONDS_PER_DAY;
    }
    next
}
