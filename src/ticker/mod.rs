//! Wall-clock ticks for interval sampling.
//!
//! Sync subscribers that ask for the same interval share one schedule whose
//! ticks land on multiples of the interval (every analyzer collecting every
//! 60s ticks at :00). Wait subscribers tick once as soon as they are added and
//! then every interval from there.

mod clock;

pub use clock::{Clock, ClockHandle, Tick};

use std::time::Duration;

/// Tick delivery timeout for each subscriber; a stalled subscriber misses the tick.
pub const TICK_DELIVERY_TIMEOUT: Duration = Duration::from_millis(20);

/// Time to sleep from `now` (since the Unix epoch) until the next multiple of `interval`.
#[must_use]
pub fn first_tick_delay(now: Duration, interval: Duration) -> Duration {
    let n = interval.as_nanos();
    if n == 0 {
        return Duration::ZERO;
    }
    let wait = n - now.as_nanos() % n;
    Duration::from_nanos(u64::try_from(wait).unwrap_or(u64::MAX))
}
