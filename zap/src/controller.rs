//! Controller-side handshake driver: the thin client that drives the
//! control-plane operations against every participating server — configure,
//! connect, start, collect reports, complete. `zapctl` is a caller of this
//! module, not a reimplementation of it.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use zap_wire::{Frame, FrameTag, PerformanceResult};

use crate::config::TestPlan;

/// Bound on how long any single handshake step (`Ready`, `OpenDataConn`
/// ack, etc.) may take before the controller gives up on that server.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors the controller can hit driving a test.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Connecting to a station's server failed.
    #[error("connecting to {addr}: {source}")]
    Connect {
        /// Server address.
        addr: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: crate::socket::Error,
    },
    /// A handshake step's I/O failed.
    #[error("station {tid:#x}: {source}")]
    Io {
        /// Station this error belongs to.
        tid: u32,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The wire protocol rejected or mis-shaped a frame.
    #[error("station {tid:#x}: {source}")]
    Protocol {
        /// Station this error belongs to.
        tid: u32,
        /// Underlying decode error.
        #[source]
        source: zap_wire::Error,
    },
    /// A step expected `Ready` and got something else.
    #[error("station {tid:#x}: expected Ready, got {tag:?}")]
    UnexpectedReply {
        /// Station this error belongs to.
        tid: u32,
        /// The tag that arrived instead.
        tag: FrameTag,
    },
}

/// One open control connection plus the station it belongs to.
struct Station {
    tid: u32,
    stream: TcpStream,
}

impl Station {
    fn into_parts(self) -> (u32, TcpStream) {
        (self.tid, self.stream)
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), Error> {
        let bytes = frame.encode(self.tid);
        self.stream
            .write_all(&bytes)
            .await
            .map_err(|source| Error::Io { tid: self.tid, source })
    }

    async fn recv(&mut self) -> Result<Frame, Error> {
        let mut header_buf = [0u8; zap_wire::HEADER_SIZE];
        self.stream
            .read_exact(&mut header_buf)
            .await
            .map_err(|source| Error::Io { tid: self.tid, source })?;
        let header =
            zap_wire::FrameHeader::decode(&header_buf).map_err(|source| Error::Protocol { tid: self.tid, source })?;
        let mut payload = vec![0u8; header.length as usize - zap_wire::HEADER_SIZE];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|source| Error::Io { tid: self.tid, source })?;
        let tag = FrameTag::try_from(header.tag).map_err(|source| Error::Protocol { tid: self.tid, source })?;
        Frame::decode_payload(tag, header.length, &payload).map_err(|source| Error::Protocol { tid: self.tid, source })
    }

    async fn expect_ready(&mut self) -> Result<(), Error> {
        match self.recv().await? {
            Frame::Ready => Ok(()),
            other => Err(Error::UnexpectedReply {
                tid: self.tid,
                tag: other.tag(),
            }),
        }
    }
}

async fn connect(addr: SocketAddr) -> Result<TcpStream, Error> {
    crate::socket::connect_with_deadline(addr, HANDSHAKE_TIMEOUT)
        .await
        .map_err(|source| Error::Connect { addr, source })
}

/// The outcome of running one test plan end to end: every
/// [`PerformanceResult`] observed, per receiving station.
#[derive(Debug, Default)]
pub struct TestOutcome {
    /// Reports received, in arrival order, keyed by receiver TID.
    pub reports: Vec<(u32, PerformanceResult)>,
}

/// Drive `plan` through the full handshake sequence and collect reports
/// until every receiver reports its last configured batch or
/// `results_timeout_secs` elapses.
pub async fn run_test(plan: &TestPlan) -> Result<TestOutcome, Error> {
    // Step 1: configure every station.
    let tx_plan = plan.transmitter();
    let mut tx = Station {
        tid: tx_plan.tid,
        stream: connect(tx_plan.server).await?,
    };
    tx.send(&Frame::OpenControlConn {
        config: plan.config.into_station_config(true),
    })
    .await?;
    tx.expect_ready().await?;

    let mut receivers = Vec::new();
    for rx_plan in plan.receivers() {
        let mut rx = Station {
            tid: rx_plan.tid,
            stream: connect(rx_plan.server).await?,
        };
        rx.send(&Frame::OpenControlConn {
            config: plan.config.into_station_config(false),
        })
        .await?;
        rx.expect_ready().await?;
        receivers.push((rx_plan.server.ip(), rx));
    }

    // Step 2: rendezvous the transmitter with each receiver.
    for (rx_ip, _) in &receivers {
        let remote_ip = match rx_ip {
            std::net::IpAddr::V4(v4) => *v4,
            std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        tx.send(&Frame::Connect { remote_ip, ip_tos: plan.config.ip_tos }).await?;
        tx.expect_ready().await?;
    }

    // Step 4: start every station.
    tx.send(&Frame::TestStart).await?;
    tx.expect_ready_or_ignore().await;
    for (_, rx) in &mut receivers {
        rx.send(&Frame::TestStart).await?;
    }

    // Step 5: collect PerformanceResult frames from every receiver until
    // each has reported its configured batch count or the deadline fires.
    // Splitting each receiver's connection lets a reader task forward
    // reports to this loop concurrently while the write half stays
    // available here for the final TestComplete below.
    let (report_tx, mut report_rx) = mpsc::channel(256);
    let mut writers = Vec::new();
    let mut reader_handles = Vec::new();
    for (_, station) in receivers.drain(..) {
        let (tid, stream) = station.into_parts();
        let (read, write) = stream.into_split();
        writers.push((tid, write));
        let sender = report_tx.clone();
        reader_handles.push(tokio::spawn(read_reports(tid, read, sender)));
    }
    drop(report_tx);

    let expected_batches = plan.config.batches;
    let mut remaining: std::collections::HashMap<u32, u32> =
        writers.iter().map(|(tid, _)| (*tid, expected_batches)).collect();
    let deadline = zap_pacing::Deadline::after_secs(plan.results_timeout_secs);

    let mut outcome = TestOutcome::default();
    loop {
        if expected_batches != 0 && remaining.values().all(|&n| n == 0) {
            break;
        }
        let next = match deadline.remaining() {
            Some(budget) => tokio::time::timeout(budget, report_rx.recv()).await.ok().flatten(),
            None if plan.results_timeout_secs != 0 => None, // deadline already elapsed
            None => report_rx.recv().await,
        };
        let Some((tid, report)) = next else { break };
        if let Some(left) = remaining.get_mut(&tid) {
            *left = left.saturating_sub(1);
        }
        outcome.reports.push((tid, report));
    }
    for handle in reader_handles {
        handle.abort();
    }

    // Step 6: graceful completion.
    tx.send(&Frame::TestComplete).await?;
    for (tid, mut write) in writers {
        let bytes = Frame::TestComplete.encode(tid);
        let _ = write.write_all(&bytes).await;
    }

    Ok(outcome)
}

impl Station {
    /// `TestStart` has no defined reply in handshake table;
    /// some servers may still echo `Ready`. Best-effort drain, not a
    /// protocol requirement.
    async fn expect_ready_or_ignore(&mut self) {
        let _ = tokio::time::timeout(Duration::from_millis(50), self.recv()).await;
    }
}

async fn read_reports(tid: u32, mut read: tokio::net::tcp::OwnedReadHalf, sender: mpsc::Sender<(u32, PerformanceResult)>) {
    loop {
        let mut header_buf = [0u8; zap_wire::HEADER_SIZE];
        if read.read_exact(&mut header_buf).await.is_err() {
            return;
        }
        let Ok(header) = zap_wire::FrameHeader::decode(&header_buf) else {
            return;
        };
        let mut payload = vec![0u8; header.length as usize - zap_wire::HEADER_SIZE];
        if read.read_exact(&mut payload).await.is_err() {
            return;
        }
        let Ok(tag) = FrameTag::try_from(header.tag) else {
            return;
        };
        let Ok(frame) = Frame::decode_payload(tag, header.length, &payload) else {
            return;
        };
        if let Frame::PerformanceResult(report) = frame {
            if sender.send((tid, report)).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use tokio::net::TcpListener;

    fn test_plan(tx_addr: SocketAddr, rx_addr: SocketAddr, batches: u32) -> TestPlan {
        let yaml = format!(
            "stations:\n\
             \x20 - tid: 1\n\
             \x20   server: {tx_addr}\n\
             \x20   transmitter: true\n\
             \x20 - tid: 2\n\
             \x20   server: {rx_addr}\n\
             config:\n\
             \x20 payload_length: 1000\n\
             \x20 batches: {batches}\n\
             \x20 batch_size: 10\n\
             results_timeout_secs: 5\n"
        );
        serde_yaml::from_str(&yaml).expect("test plan parses")
    }

    async fn read_frame(stream: &mut TcpStream) -> Frame {
        let mut header_buf = [0u8; zap_wire::HEADER_SIZE];
        stream.read_exact(&mut header_buf).await.expect("header read");
        let header = zap_wire::FrameHeader::decode(&header_buf).expect("header decodes");
        let mut payload = vec![0u8; header.length as usize - zap_wire::HEADER_SIZE];
        stream.read_exact(&mut payload).await.expect("payload read");
        let tag = FrameTag::try_from(header.tag).expect("known tag");
        Frame::decode_payload(tag, header.length, &payload).expect("payload decodes")
    }

    async fn write_frame(stream: &mut TcpStream, tid: u32, frame: &Frame) {
        let bytes = frame.encode(tid);
        stream.write_all(&bytes).await.expect("write succeeds");
    }

    /// Stands in for a server's control connection on the transmitting
    /// station: configure, rendezvous, start, complete.
    async fn mock_tx_server(listener: TcpListener, tid: u32) {
        let (mut stream, _peer) = listener.accept().await.expect("accept");

        assert!(matches!(read_frame(&mut stream).await, Frame::OpenControlConn { .. }));
        write_frame(&mut stream, tid, &Frame::Ready).await;

        assert!(matches!(read_frame(&mut stream).await, Frame::Connect { .. }));
        write_frame(&mut stream, tid, &Frame::Ready).await;

        assert!(matches!(read_frame(&mut stream).await, Frame::TestStart));
        assert!(matches!(read_frame(&mut stream).await, Frame::TestComplete));
    }

    /// Stands in for a server's control connection on a receiving station:
    /// configure, start, emit `batches` reports, complete.
    async fn mock_rx_server(listener: TcpListener, tid: u32, batches: u32) {
        let (mut stream, _peer) = listener.accept().await.expect("accept");

        assert!(matches!(read_frame(&mut stream).await, Frame::OpenControlConn { .. }));
        write_frame(&mut stream, tid, &Frame::Ready).await;

        assert!(matches!(read_frame(&mut stream).await, Frame::TestStart));

        for batch in 0..batches {
            write_frame(
                &mut stream,
                tid,
                &Frame::PerformanceResult(PerformanceResult {
                    batch,
                    ..PerformanceResult::default()
                }),
            )
            .await;
        }

        assert!(matches!(read_frame(&mut stream).await, Frame::TestComplete));
    }

    #[tokio::test]
    async fn run_test_drives_full_handshake_and_collects_reports() {
        let tx_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let tx_addr = tx_listener.local_addr().expect("local addr");
        let rx_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let rx_addr = rx_listener.local_addr().expect("local addr");

        let tx_task = tokio::spawn(mock_tx_server(tx_listener, 1));
        let rx_task = tokio::spawn(mock_rx_server(rx_listener, 2, 3));

        let plan = test_plan(tx_addr, rx_addr, 3);
        let outcome = run_test(&plan).await.expect("handshake succeeds");

        assert_eq!(outcome.reports.len(), 3);
        assert!(outcome.reports.iter().all(|(tid, _)| *tid == 2));
        assert_eq!(
            outcome.reports.iter().map(|(_, r)| r.batch).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        tx_task.await.expect("mock tx server task");
        rx_task.await.expect("mock rx server task");
    }

    #[tokio::test]
    async fn run_test_stops_collecting_once_results_timeout_elapses() {
        // Receiver reports fewer batches than configured and never sends
        // the rest; the collection loop must still return once
        // `results_timeout_secs` elapses rather than hang forever.
        let tx_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let tx_addr = tx_listener.local_addr().expect("local addr");
        let rx_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let rx_addr = rx_listener.local_addr().expect("local addr");

        let tx_task = tokio::spawn(mock_tx_server(tx_listener, 1));
        let rx_task = tokio::spawn(mock_rx_server(rx_listener, 2, 1));

        // Plan claims 3 batches but the mock receiver only ever sends 1.
        let mut plan = test_plan(tx_addr, rx_addr, 3);
        plan.results_timeout_secs = 1;
        let outcome = run_test(&plan).await.expect("handshake succeeds");

        assert_eq!(outcome.reports.len(), 1);

        tx_task.await.expect("mock tx server task");
        rx_task.await.expect("mock rx server task");
    }
}
