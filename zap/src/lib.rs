//! A distributed network-performance measurement fabric.
//!
//! `zap` is a library of the pieces `zapd` (the per-host server) and
//! `zapctl` (the controller that drives a test end to end) are built from:
//! the wire-level station table and measurement engine
//! ([`station`], [`receiver`], [`transmitter`]), the server actor loop
//! ([`server`]), the controller's handshake driver ([`controller`]), and
//! the socket/config/signal plumbing both binaries share.

pub mod clock;
pub mod config;
pub mod controller;
pub mod receiver;
pub mod server;
pub mod signals;
pub mod socket;
pub mod station;
pub mod transmitter;
