//! Microsecond timestamps for the receiver measurement engine.
//!
//! The kernel's receive timestamp, delivered via UDP ancillary control data
//! (`SO_TIMESTAMP`/`cmsg`), would be more accurate than a userspace clock
//! read taken after the frame has already been decoded. `tokio::net::
//! UdpSocket` has no `recvmsg`/cmsg support, though, and hand-rolling one
//! over a raw fd means unsafe code this module avoids — so only the
//! userspace fallback is implemented here. Wiring up the kernel timestamp
//! is a natural follow-up.

use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch, saturating rather than panicking if
/// the system clock is set before 1970.
#[must_use]
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
