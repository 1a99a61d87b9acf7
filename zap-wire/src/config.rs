//! `station_config`: the flat, all-`u32` configuration blob carried in an
//! [`crate::frame::Frame::OpenControlConn`] frame.
//!
//! The field order here is load-bearing: `to_words`/`from_words` must
//! round-trip the exact same 18-word array every peer on the wire expects,
//! byte for byte.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;

/// Number of 32-bit words in an encoded [`StationConfig`].
pub const STATION_CONFIG_WORDS: usize = 18;

/// Number of bytes in an encoded [`StationConfig`].
pub const STATION_CONFIG_BYTES: usize = STATION_CONFIG_WORDS * 4;

/// A station's full configuration, as negotiated by the controller.
///
/// All fields are 32-bit unsigned and are transmitted big-endian, one word
/// at a time, independent of host endianness.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StationConfig {
    /// Inter-payload pacing, microseconds.
    pub payload_transmit_delay: u32,
    /// Inter-batch pacing, microseconds.
    pub batch_transmit_delay: u32,
    /// Payload-to-payload watchdog, microseconds.
    pub payload_timeout: u32,
    /// Batch-to-batch watchdog, microseconds.
    pub batch_timeout: u32,
    /// Bytes per data frame on the wire.
    pub payload_length: u32,
    /// Total batches this station will send (transmitter) or expect.
    pub batches: u32,
    /// Payloads per batch.
    pub batch_size: u32,
    /// Time-bounded batch length in microseconds; 0 disables. Mutually
    /// exclusive with `batch_size` as the reporting trigger, though both
    /// may be set.
    pub batch_time: u32,
    /// Maximum outstanding batches (pipeline depth). Must be >= 1.
    pub asynchronous: u32,
    /// Whether an in-band response flows on batch completion.
    pub batch_inband_response: u32,
    /// Whether a `DataComplete`/`DataCompleteResponse` exchange gates the
    /// transmitter's asynchronous window.
    pub batch_completion: u32,
    /// Reserved pacing for performance reports.
    pub batch_report_rate: u32,
    /// Nonzero: data frames travel over TCP. Zero: UDP.
    pub tcp: u32,
    /// Test envelope ceiling, seconds.
    pub max_test_time: u32,
    /// Nonzero if this station is the transmitter.
    pub tx: u32,
    /// Destination IP for UDP data frames, network byte order. Zero means
    /// "not yet known" (learned from the NAT-prime datagram).
    pub tx_ip: u32,
    /// Buffer space required to hold all outstanding frames.
    pub buf_required: u32,
    /// IP type-of-service value to apply to this station's traffic.
    pub ip_tos: u32,
}

impl StationConfig {
    /// Minimum `payload_length` that can hold the 20-byte frame header plus
    /// the 8-byte batch/payload-number prefix of a `Data` frame.
    pub const MIN_PAYLOAD_LENGTH: u32 = (crate::HEADER_SIZE + 8) as u32;

    /// Serialize to the flat word array transmitted on the wire.
    #[must_use]
    pub fn to_words(self) -> [u32; STATION_CONFIG_WORDS] {
        [
            self.payload_transmit_delay,
            self.batch_transmit_delay,
            self.payload_timeout,
            self.batch_timeout,
            self.payload_length,
            self.batches,
            self.batch_size,
            self.batch_time,
            self.asynchronous,
            self.batch_inband_response,
            self.batch_completion,
            self.batch_report_rate,
            self.tcp,
            self.max_test_time,
            self.tx,
            self.tx_ip,
            self.buf_required,
            self.ip_tos,
        ]
    }

    /// Deserialize from the flat word array as read off the wire.
    #[must_use]
    pub fn from_words(w: [u32; STATION_CONFIG_WORDS]) -> Self {
        Self {
            payload_transmit_delay: w[0],
            batch_transmit_delay: w[1],
            payload_timeout: w[2],
            batch_timeout: w[3],
            payload_length: w[4],
            batches: w[5],
            batch_size: w[6],
            batch_time: w[7],
            asynchronous: w[8],
            batch_inband_response: w[9],
            batch_completion: w[10],
            batch_report_rate: w[11],
            tcp: w[12],
            max_test_time: w[13],
            tx: w[14],
            tx_ip: w[15],
            buf_required: w[16],
            ip_tos: w[17],
        }
    }

    /// Append the big-endian encoded form to `buf`.
    pub fn encode(self, buf: &mut BytesMut) {
        for word in self.to_words() {
            buf.put_u32(word);
        }
    }

    /// Decode from an exactly-[`STATION_CONFIG_BYTES`]-byte slice.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != STATION_CONFIG_BYTES {
            return Err(Error::BadConfigLength {
                expected: STATION_CONFIG_BYTES,
                actual: bytes.len(),
            });
        }
        let mut words = [0u32; STATION_CONFIG_WORDS];
        for word in &mut words {
            *word = bytes.get_u32();
        }
        Ok(Self::from_words(words))
    }

    /// Whether `batch_time`-based batch flushing is in effect.
    #[must_use]
    pub fn is_time_bounded(&self) -> bool {
        self.batch_time != 0
    }

    /// Whether this station is configured as the transmitter.
    #[must_use]
    pub fn is_transmitter(&self) -> bool {
        self.tx != 0
    }

    /// Whether data frames for this station travel over TCP rather than UDP.
    #[must_use]
    pub fn is_tcp_data(&self) -> bool {
        self.tcp != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StationConfig {
        StationConfig {
            payload_transmit_delay: 10,
            batch_transmit_delay: 20,
            payload_timeout: 30,
            batch_timeout: 40,
            payload_length: 1000,
            batches: 3,
            batch_size: 10,
            batch_time: 0,
            asynchronous: 1,
            batch_inband_response: 0,
            batch_completion: 0,
            batch_report_rate: 1,
            tcp: 0,
            max_test_time: 60,
            tx: 1,
            tx_ip: 0x0A00_0001,
            buf_required: 20_000,
            ip_tos: 0,
        }
    }

    #[test]
    fn round_trip_preserves_all_fields() {
        let cfg = sample();
        let mut buf = BytesMut::new();
        cfg.encode(&mut buf);
        assert_eq!(buf.len(), STATION_CONFIG_BYTES);
        let decoded = StationConfig::decode(&buf).expect("decode");
        assert_eq!(cfg, decoded);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);
        buf.truncate(buf.len() - 1);
        let err = StationConfig::decode(&buf).unwrap_err();
        assert_eq!(
            err,
            Error::BadConfigLength {
                expected: STATION_CONFIG_BYTES,
                actual: STATION_CONFIG_BYTES - 1,
            }
        );
    }

    #[test]
    fn word_order_matches_field_order() {
        let cfg = sample();
        let words = cfg.to_words();
        assert_eq!(words[4], cfg.payload_length);
        assert_eq!(words[17], cfg.ip_tos);
        assert_eq!(StationConfig::from_words(words), cfg);
    }
}
