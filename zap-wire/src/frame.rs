//! Fixed 20-byte header plus tagged payload framing.
//!
//! Every frame is `major(4) | minor(4) | test_id(4) | frame_type(4) | length(4)`
//! followed by a type-specific payload, all multi-byte integers big-endian.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::{StationConfig, STATION_CONFIG_BYTES};
use crate::error::Error;
use crate::{HEADER_SIZE, MAX_PACKET_LEN, PROTOCOL_MAJOR, PROTOCOL_MINOR};

/// The closed set of frame types the protocol knows about. Tag values are
/// the ordinal position in this table; decoding an out-of-range value is a
/// [`Error::UnknownTag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FrameTag {
    /// A single data payload within a batch.
    Data = 0,
    /// Marks the end of a batch's data frames (TCP, even for UDP data).
    DataComplete = 1,
    /// Acknowledges a [`FrameTag::DataComplete`].
    DataCompleteResponse = 2,
    /// Graceful end of test for a station.
    TestComplete = 3,
    /// Opens a TCP data connection for a station.
    OpenDataConn = 4,
    /// Opens a TCP control connection for a station, carrying its config.
    OpenControlConn = 5,
    /// Directs a transmitter to rendezvous with a receiver's IP/ToS.
    Connect = 6,
    /// Acknowledges readiness for the next handshake step.
    Ready = 7,
    /// Starts the test for a configured station.
    TestStart = 8,
    /// A periodic measurement report from a receiver.
    PerformanceResult = 9,
    /// NAT-priming datagram sent transmitter to receiver over UDP.
    Null = 10,
}

impl FrameTag {
    const ALL: [FrameTag; 11] = [
        FrameTag::Data,
        FrameTag::DataComplete,
        FrameTag::DataCompleteResponse,
        FrameTag::TestComplete,
        FrameTag::OpenDataConn,
        FrameTag::OpenControlConn,
        FrameTag::Connect,
        FrameTag::Ready,
        FrameTag::TestStart,
        FrameTag::PerformanceResult,
        FrameTag::Null,
    ];
}

impl TryFrom<u32> for FrameTag {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        FrameTag::ALL
            .into_iter()
            .find(|tag| *tag as u32 == value)
            .ok_or(Error::UnknownTag(value))
    }
}

/// The decoded fixed header, prior to tag validation of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol major version, must equal [`PROTOCOL_MAJOR`].
    pub major: u32,
    /// Protocol minor version, must equal [`PROTOCOL_MINOR`].
    pub minor: u32,
    /// The test id this frame belongs to.
    pub test_id: u32,
    /// Raw tag value; validate with [`FrameTag::try_from`].
    pub tag: u32,
    /// Total frame length, header included, in bytes.
    pub length: u32,
}

impl FrameHeader {
    /// Decode the fixed header from exactly [`HEADER_SIZE`] bytes and check
    /// the protocol version and length bounds. Does not validate the tag.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::ShortRead {
                need: HEADER_SIZE,
                have: bytes.len(),
            });
        }
        let major = bytes.get_u32();
        let minor = bytes.get_u32();
        let test_id = bytes.get_u32();
        let tag = bytes.get_u32();
        let length = bytes.get_u32();
        if major != PROTOCOL_MAJOR || minor != PROTOCOL_MINOR {
            return Err(Error::VersionMismatch { major, minor });
        }
        if length as usize > MAX_PACKET_LEN {
            return Err(Error::TooLarge(length));
        }
        if (length as usize) < HEADER_SIZE {
            return Err(Error::TooSmall(length));
        }
        Ok(Self {
            major,
            minor,
            test_id,
            tag,
            length,
        })
    }

    fn encode(self, buf: &mut BytesMut) {
        buf.put_u32(self.major);
        buf.put_u32(self.minor);
        buf.put_u32(self.test_id);
        buf.put_u32(self.tag);
        buf.put_u32(self.length);
    }
}

/// A periodic receiver-side measurement report. All fields are transmitted
/// as `u32`; the microsecond timestamps are truncated to 32 bits on the
/// wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerformanceResult {
    /// Payloads received and accounted for in this report.
    pub received: u32,
    /// Payloads inferred lost (skipped) in this report.
    pub dropped: u32,
    /// Payloads that arrived out of order.
    pub out_of_order: u32,
    /// Payloads that arrived more than once.
    pub repeated: u32,
    /// The batch number this report covers.
    pub batch: u32,
    /// First frame arrival timestamp of the window, truncated to 32 bits.
    pub first_ts: u32,
    /// Last frame arrival timestamp of the window, truncated to 32 bits.
    pub last_ts: u32,
    /// Measured bits per second over the window.
    pub bits_per_second: u32,
}

const PERFORMANCE_RESULT_BYTES: usize = 8 * 4;

/// One decoded protocol frame, header fields stripped out (the header's
/// `test_id` travels alongside a `Frame` at the call sites that need it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `batch_number`/`payload_number` plus opaque padding out to
    /// `frame_len` total bytes (header included).
    Data {
        /// Batch this payload belongs to.
        batch_number: u32,
        /// Index of this payload within its batch.
        payload_number: u32,
        /// Total on-wire frame length, header included.
        frame_len: u32,
    },
    /// End-of-batch marker, sent TX -> RX over TCP.
    DataComplete {
        /// The batch that has finished transmission.
        batch_number: u32,
    },
    /// Acknowledges a `DataComplete`, sent RX -> TX over TCP.
    DataCompleteResponse {
        /// The batch being acknowledged.
        batch_number: u32,
    },
    /// Graceful end of test.
    TestComplete,
    /// Request to open a TCP data connection.
    OpenDataConn,
    /// Request to open a TCP control connection, carrying the station's
    /// configuration.
    OpenControlConn {
        /// The negotiated configuration for this station.
        config: StationConfig,
    },
    /// Directs a transmitter to rendezvous with a receiver.
    Connect {
        /// Receiver's IP address; `0.0.0.0` means "not yet known".
        remote_ip: Ipv4Addr,
        /// IP type-of-service to apply.
        ip_tos: u32,
    },
    /// Generic acknowledgement / readiness signal.
    Ready,
    /// Starts data emission for a transmitter station.
    TestStart,
    /// A periodic measurement report.
    PerformanceResult(PerformanceResult),
    /// NAT-priming datagram.
    Null,
}

impl Frame {
    /// The [`FrameTag`] this frame will encode as.
    #[must_use]
    pub fn tag(&self) -> FrameTag {
        match self {
            Frame::Data { .. } => FrameTag::Data,
            Frame::DataComplete { .. } => FrameTag::DataComplete,
            Frame::DataCompleteResponse { .. } => FrameTag::DataCompleteResponse,
            Frame::TestComplete => FrameTag::TestComplete,
            Frame::OpenDataConn => FrameTag::OpenDataConn,
            Frame::OpenControlConn { .. } => FrameTag::OpenControlConn,
            Frame::Connect { .. } => FrameTag::Connect,
            Frame::Ready => FrameTag::Ready,
            Frame::TestStart => FrameTag::TestStart,
            Frame::PerformanceResult(_) => FrameTag::PerformanceResult,
            Frame::Null => FrameTag::Null,
        }
    }

    /// Encode this frame, header included, for `test_id`.
    ///
    /// # Panics
    ///
    /// Panics if a `Data` frame's `frame_len` is smaller than
    /// [`StationConfig::MIN_PAYLOAD_LENGTH`]; callers are expected to
    /// enforce the minimum when accepting station configuration, not here.
    #[must_use]
    pub fn encode(&self, test_id: u32) -> Bytes {
        let mut payload = BytesMut::new();
        match self {
            Frame::Data {
                batch_number,
                payload_number,
                frame_len,
            } => {
                assert!(
                    *frame_len >= StationConfig::MIN_PAYLOAD_LENGTH,
                    "Data frame_len {frame_len} below minimum {min}",
                    min = StationConfig::MIN_PAYLOAD_LENGTH
                );
                payload.put_u32(*batch_number);
                payload.put_u32(*payload_number);
                let padding = *frame_len as usize - HEADER_SIZE - 8;
                payload.resize(payload.len() + padding, 0);
            }
            Frame::DataComplete { batch_number } | Frame::DataCompleteResponse { batch_number } => {
                payload.put_u32(*batch_number);
            }
            Frame::OpenControlConn { config } => config.encode(&mut payload),
            Frame::Connect { remote_ip, ip_tos } => {
                payload.put_u32(u32::from(*remote_ip));
                payload.put_u32(*ip_tos);
            }
            Frame::PerformanceResult(r) => {
                payload.put_u32(r.received);
                payload.put_u32(r.dropped);
                payload.put_u32(r.out_of_order);
                payload.put_u32(r.repeated);
                payload.put_u32(r.batch);
                payload.put_u32(r.first_ts);
                payload.put_u32(r.last_ts);
                payload.put_u32(r.bits_per_second);
            }
            Frame::TestComplete
            | Frame::OpenDataConn
            | Frame::Ready
            | Frame::TestStart
            | Frame::Null => {}
        }

        let length = (HEADER_SIZE + payload.len()) as u32;
        let mut buf = BytesMut::with_capacity(length as usize);
        FrameHeader {
            major: PROTOCOL_MAJOR,
            minor: PROTOCOL_MINOR,
            test_id,
            tag: self.tag() as u32,
            length,
        }
        .encode(&mut buf);
        buf.extend_from_slice(&payload);
        buf.freeze()
    }

    /// Decode a frame body given its already-validated tag and the header's
    /// declared total `length`. `payload` must be exactly
    /// `length - HEADER_SIZE` bytes.
    pub fn decode_payload(tag: FrameTag, length: u32, payload: &[u8]) -> Result<Self, Error> {
        let want = length as usize - HEADER_SIZE;
        if payload.len() != want {
            return Err(Error::ShortRead {
                need: want,
                have: payload.len(),
            });
        }
        let mut p = payload;
        Ok(match tag {
            FrameTag::Data => {
                if p.len() < 8 {
                    return Err(Error::ShortRead {
                        need: 8,
                        have: p.len(),
                    });
                }
                let batch_number = p.get_u32();
                let payload_number = p.get_u32();
                Frame::Data {
                    batch_number,
                    payload_number,
                    frame_len: length,
                }
            }
            FrameTag::DataComplete => {
                expect_len(p.len(), 4)?;
                Frame::DataComplete {
                    batch_number: p.get_u32(),
                }
            }
            FrameTag::DataCompleteResponse => {
                expect_len(p.len(), 4)?;
                Frame::DataCompleteResponse {
                    batch_number: p.get_u32(),
                }
            }
            FrameTag::TestComplete => {
                expect_len(p.len(), 0)?;
                Frame::TestComplete
            }
            FrameTag::OpenDataConn => {
                expect_len(p.len(), 0)?;
                Frame::OpenDataConn
            }
            FrameTag::OpenControlConn => {
                expect_len(p.len(), STATION_CONFIG_BYTES)?;
                Frame::OpenControlConn {
                    config: StationConfig::decode(p)?,
                }
            }
            FrameTag::Connect => {
                expect_len(p.len(), 8)?;
                let remote_ip = Ipv4Addr::from(p.get_u32());
                let ip_tos = p.get_u32();
                Frame::Connect { remote_ip, ip_tos }
            }
            FrameTag::Ready => {
                expect_len(p.len(), 0)?;
                Frame::Ready
            }
            FrameTag::TestStart => {
                expect_len(p.len(), 0)?;
                Frame::TestStart
            }
            FrameTag::PerformanceResult => {
                expect_len(p.len(), PERFORMANCE_RESULT_BYTES)?;
                Frame::PerformanceResult(PerformanceResult {
                    received: p.get_u32(),
                    dropped: p.get_u32(),
                    out_of_order: p.get_u32(),
                    repeated: p.get_u32(),
                    batch: p.get_u32(),
                    first_ts: p.get_u32(),
                    last_ts: p.get_u32(),
                    bits_per_second: p.get_u32(),
                })
            }
            FrameTag::Null => {
                expect_len(p.len(), 0)?;
                Frame::Null
            }
        })
    }

    /// Decode a full UDP datagram: exactly one read, header plus payload,
    /// with the datagram's actual length checked against the header's
    /// declared length.
    pub fn decode_datagram(buf: &[u8]) -> Result<(u32, Frame), Error> {
        let header = FrameHeader::decode(buf)?;
        if buf.len() != header.length as usize {
            return Err(Error::DatagramLengthMismatch {
                declared: header.length,
                actual: buf.len(),
            });
        }
        let tag = FrameTag::try_from(header.tag)?;
        let frame = Frame::decode_payload(tag, header.length, &buf[HEADER_SIZE..])?;
        Ok((header.test_id, frame))
    }
}

fn expect_len(have: usize, want: usize) -> Result<(), Error> {
    if have != want {
        return Err(Error::ShortRead { need: want, have });
    }
    Ok(())
}
