//! Pacing primitives for the transmitter scheduler and the controller's
//! results wait.
//!
//! Inter-payload and inter-batch delays are cooperative hints, not a
//! schedule to catch up on: each delay is measured relative to when it is
//! requested, not against an absolute deadline, so a slow station never
//! tries to compensate by sleeping less on the next payload.

use std::time::Duration;

use tokio::time::Instant;

/// A single configured delay, slept cooperatively between payloads or
/// between batches. A zero delay is a no-op: no timer is armed and no
/// `.await` point is introduced.
#[derive(Debug, Clone, Copy)]
pub struct Pacer {
    delay: Duration,
}

impl Pacer {
    /// Build a pacer from a microsecond delay as carried in
    /// `station_config`.
    #[must_use]
    pub fn from_micros(usec: u32) -> Self {
        Self {
            delay: Duration::from_micros(u64::from(usec)),
        }
    }

    /// Whether this pacer has no delay configured.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.delay.is_zero()
    }

    /// Sleep the configured delay, if any.
    pub async fn pace(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

/// A one-shot wall-clock bound, armed from a seconds count where `0` means
/// "unbounded". Used for `max_test_time` and the controller's
/// `results_timeout`.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// Arm a deadline `secs` seconds from now. `0` means unbounded.
    #[must_use]
    pub fn after_secs(secs: u32) -> Self {
        if secs == 0 {
            Self { at: None }
        } else {
            Self {
                at: Some(Instant::now() + Duration::from_secs(u64::from(secs))),
            }
        }
    }

    /// Arm a deadline `micros` microseconds from now. `0` means unbounded.
    #[must_use]
    pub fn after_micros(micros: u64) -> Self {
        if micros == 0 {
            Self { at: None }
        } else {
            Self {
                at: Some(Instant::now() + Duration::from_micros(micros)),
            }
        }
    }

    /// Whether the deadline, if armed, has passed.
    #[must_use]
    pub fn is_elapsed(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time remaining, or `None` if unbounded or already elapsed.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.at.and_then(|at| at.checked_duration_since(Instant::now()))
    }
}
