//! Wire framing and `station_config` codec for the zap network-performance
//! protocol.
//!
//! Every frame on the wire is a fixed 20-byte header followed by a
//! type-specific payload, all multi-byte integers big-endian. See
//! [`frame::Frame`] for the frame types and [`config::StationConfig`] for
//! the configuration blob carried by `OpenControlConn`.

pub mod config;
pub mod error;
pub mod frame;

pub use config::StationConfig;
pub use error::Error;
pub use frame::{Frame, FrameHeader, FrameTag, PerformanceResult};

/// Size of the fixed frame header, in bytes.
pub const HEADER_SIZE: usize = 20;

/// Largest frame, header included, the protocol permits.
pub const MAX_PACKET_LEN: usize = 65536;

/// Protocol major version.
pub const PROTOCOL_MAJOR: u32 = 1;

/// Protocol minor version.
pub const PROTOCOL_MINOR: u32 = 83;

/// Fixed TCP/UDP service port used by every server.
pub const SERVICE_PORT: u16 = 18301;

/// Maximum concurrent stations a single server will host.
pub const MAX_STATIONS: usize = 20;

/// Maximum data TCP connections (receivers) a single transmitter station
/// may rendezvous with.
pub const MAX_RECEIVERS: usize = 20;
