//! Errors produced while encoding or decoding frames on the wire.

use crate::frame::FrameTag;

/// Errors produced by [`crate::frame`] and [`crate::config`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Fewer bytes were available than the frame declares it needs.
    #[error("short read: need {need} bytes, have {have}")]
    ShortRead {
        /// Bytes required to complete the read.
        need: usize,
        /// Bytes actually available.
        have: usize,
    },
    /// A frame's declared length exceeds [`crate::MAX_PACKET_LEN`].
    #[error("frame length {0} exceeds max packet length {max}", max = crate::MAX_PACKET_LEN)]
    TooLarge(u32),
    /// A frame declared a length smaller than the fixed header.
    #[error("frame length {0} is smaller than the header size {header}", header = crate::HEADER_SIZE)]
    TooSmall(u32),
    /// The peer's protocol version does not match ours.
    #[error("protocol version mismatch: peer {major}.{minor}, expected {exp_major}.{exp_minor}",
        exp_major = crate::PROTOCOL_MAJOR, exp_minor = crate::PROTOCOL_MINOR)]
    VersionMismatch {
        /// Peer's major version.
        major: u32,
        /// Peer's minor version.
        minor: u32,
    },
    /// The frame-type tag is not one of the known values.
    #[error("unknown frame tag {0}")]
    UnknownTag(u32),
    /// A known tag appeared where the protocol state machine disallows it.
    #[error("frame {0:?} is not permitted in this context")]
    UnexpectedTag(FrameTag),
    /// A UDP datagram's observed length did not match its declared length.
    #[error("datagram length mismatch: header declares {declared}, datagram is {actual} bytes")]
    DatagramLengthMismatch {
        /// Length declared in the frame header.
        declared: u32,
        /// Length actually read from the socket.
        actual: usize,
    },
    /// A `station_config` payload was not exactly
    /// [`crate::config::STATION_CONFIG_BYTES`] bytes.
    #[error("station_config payload must be {expected} bytes, got {actual}")]
    BadConfigLength {
        /// Expected byte count.
        expected: usize,
        /// Observed byte count.
        actual: usize,
    },
}
