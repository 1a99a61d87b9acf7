//! Controller-side test plan configuration: which servers participate, as
//! which stations, with which `station_config`. A
//! `#[serde(deny_unknown_fields)]` struct deserialized with `serde_yaml`,
//! errors collected into a flat `thiserror` enum.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use zap_wire::StationConfig;

/// Errors produced loading or validating a [`TestPlan`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Reading the plan file off disk failed.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path that could not be read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The plan's YAML did not parse.
    #[error("failed to parse test plan: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// A plan named no receivers for a transmitter, or vice versa.
    #[error("test plan must name exactly one transmitter and at least one receiver")]
    MissingRole,
}

/// One station's role and address in a [`TestPlan`].
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StationPlan {
    /// Test id this station will answer to.
    pub tid: u32,
    /// The server's control-plane address (data-plane traffic always uses
    /// `SERVICE_PORT` on the same host).
    pub server: SocketAddr,
    /// `true` if this station transmits; exactly one station per plan may
    /// set this.
    #[serde(default)]
    pub transmitter: bool,
}

/// A full end-to-end test: one transmitter, one or more receivers, and the
/// `station_config` negotiated with every one of them.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TestPlan {
    /// Participating stations.
    pub stations: Vec<StationPlan>,
    /// Configuration applied uniformly to every station. Real deployments
    /// that need per-station tuning (asymmetric `tx_ip`, differing
    /// `payload_length`) are expected to run `zapctl` once per pairing;
    /// the control-plane protocol itself has no notion of a shared config
    /// either.
    pub config: RawStationConfig,
    /// How long the controller waits for a final `PerformanceResult` batch
    /// before giving up on a receiver, seconds. `0` is unbounded.
    #[serde(default)]
    pub results_timeout_secs: u32,
}

/// [`StationConfig`] spelled out field-by-field for YAML, rather than the
/// flat wire array — a human editing a test plan names fields, not word
/// offsets.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RawStationConfig {
    #[serde(default)]
    pub payload_transmit_delay: u32,
    #[serde(default)]
    pub batch_transmit_delay: u32,
    #[serde(default)]
    pub payload_timeout: u32,
    #[serde(default)]
    pub batch_timeout: u32,
    pub payload_length: u32,
    pub batches: u32,
    pub batch_size: u32,
    #[serde(default)]
    pub batch_time: u32,
    #[serde(default = "default_asynchronous")]
    pub asynchronous: u32,
    #[serde(default)]
    pub batch_inband_response: u32,
    #[serde(default)]
    pub batch_completion: u32,
    #[serde(default)]
    pub batch_report_rate: u32,
    #[serde(default)]
    pub tcp: u32,
    #[serde(default)]
    pub max_test_time: u32,
    #[serde(default)]
    pub buf_required: u32,
    #[serde(default)]
    pub ip_tos: u32,
}

fn default_asynchronous() -> u32 {
    1
}

impl RawStationConfig {
    /// Fill in the `tx`/`tx_ip` fields the handshake negotiates rather than
    /// the plan declaring them up front.
    #[must_use]
    pub fn into_station_config(self, is_transmitter: bool) -> StationConfig {
        StationConfig {
            payload_transmit_delay: self.payload_transmit_delay,
            batch_transmit_delay: self.batch_transmit_delay,
            payload_timeout: self.payload_timeout,
            batch_timeout: self.batch_timeout,
            payload_length: self.payload_length,
            batches: self.batches,
            batch_size: self.batch_size,
            batch_time: self.batch_time,
            asynchronous: self.asynchronous,
            batch_inband_response: self.batch_inband_response,
            batch_completion: self.batch_completion,
            batch_report_rate: self.batch_report_rate,
            tcp: self.tcp,
            max_test_time: self.max_test_time,
            tx: u32::from(is_transmitter),
            tx_ip: 0,
            buf_required: self.buf_required,
            ip_tos: self.ip_tos,
        }
    }
}

impl TestPlan {
    /// Load and validate a test plan from a YAML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.display().to_string(),
            source,
        })?;
        let plan: TestPlan = serde_yaml::from_str(&contents)?;
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<(), Error> {
        let transmitters = self.stations.iter().filter(|s| s.transmitter).count();
        let receivers = self.stations.len().saturating_sub(transmitters);
        if transmitters != 1 || receivers == 0 {
            return Err(Error::MissingRole);
        }
        Ok(())
    }

    /// The plan's single transmitting station.
    #[must_use]
    pub fn transmitter(&self) -> &StationPlan {
        self.stations
            .iter()
            .find(|s| s.transmitter)
            .expect("validate() guarantees exactly one transmitter")
    }

    /// The plan's receiving stations.
    pub fn receivers(&self) -> impl Iterator<Item = &StationPlan> {
        self.stations.iter().filter(|s| !s.transmitter)
    }
}
