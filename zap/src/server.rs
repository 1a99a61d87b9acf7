//! Server-side station protocol engine: handshake handling and the
//! concurrency model that keeps station state single-threaded.
//!
//! One actor task owns the [`StationTable`] exclusively. Every other task
//! — the TCP accept loop, one frame-reader task per accepted connection,
//! the UDP receive loop, and each station's [`crate::transmitter`] task —
//! only ever talks to the actor by sending an [`Inbound`] event down an
//! `mpsc` channel. This keeps every mutation of station state
//! single-threaded and lock-free, realized as one actor plus
//! message-passing I/O tasks instead of a literal hand-rolled
//! `select`/`poll` fan-in — see DESIGN.md for the reasoning behind that
//! substitution.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use zap_wire::{Frame, FrameTag, HEADER_SIZE, MAX_RECEIVERS, SERVICE_PORT};

use crate::receiver;
use crate::signals::Shutdown;
use crate::station::{Connection, StationState, StationTable};
use crate::transmitter::{self, TransmitPlan};

/// Monotonic id distinguishing TCP connections before their owning
/// station's TID is known.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Which socket role a connection plays once classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    /// The single control connection for a station.
    Control,
    /// One of up to [`MAX_RECEIVERS`] data connections.
    Data,
}

/// Everything that can happen that the actor must react to.
enum Inbound {
    /// A connection was accepted; its write half and reader task handle are
    /// parked in `pending` until the first frame reveals which station and
    /// role it belongs to.
    NewConn { conn_id: u64, conn: Connection },
    /// A decoded frame on a connection, established or still pending.
    Frame {
        conn_id: u64,
        kind: ConnKind,
        test_id: u32,
        frame: Frame,
    },
    /// A connection's reader hit EOF or an I/O error.
    ConnClosed { conn_id: u64 },
    /// A UDP datagram decoded successfully.
    Udp { test_id: u32, frame: Frame, src: SocketAddr },
}

/// Shared, read-only server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// UDP send/receive buffer floor; grown as stations are configured.
    pub udp_buffer_floor: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            udp_buffer_floor: 64 * 1024,
        }
    }
}

/// Bind the TCP listener and UDP socket on [`SERVICE_PORT`] and run the
/// server actor until `shutdown` fires. Returns once every spawned task has
/// wound down.
pub async fn run(config: ServerConfig, shutdown: Shutdown) -> Result<(), crate::socket::Error> {
    let tcp_socket = crate::socket::make_socket(0, true)?;
    crate::socket::bind_service(&tcp_socket).await?;
    let listener = crate::socket::into_tcp_listener(tcp_socket)?;

    let udp_socket = crate::socket::make_socket(config.udp_buffer_floor, false)?;
    crate::socket::bind_service(&udp_socket).await?;
    let udp_socket = Arc::new(crate::socket::into_udp_socket(udp_socket)?);

    let (tx, rx) = mpsc::channel(256);

    let accept_task = tokio::spawn(accept_loop(listener, tx.clone(), shutdown.clone()));
    let udp_task = tokio::spawn(udp_loop(Arc::clone(&udp_socket), tx.clone(), shutdown.clone()));

    actor_loop(rx, udp_socket, config, shutdown).await;

    accept_task.abort();
    udp_task.abort();
    Ok(())
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Inbound>, mut shutdown: Shutdown) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => spawn_connection(stream, peer, &tx, shutdown.clone()),
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            () = shutdown.recv() => return,
        }
    }
}

/// Split a freshly accepted stream, register it with the actor, and spawn
/// the task that decodes frames off its read half for the rest of its
/// life.
fn spawn_connection(stream: TcpStream, peer: SocketAddr, tx: &mpsc::Sender<Inbound>, shutdown: Shutdown) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (read, write) = stream.into_split();
    let reader_tx = tx.clone();
    let reader = tokio::spawn(read_loop(conn_id, read, reader_tx, shutdown));
    let conn = Connection {
        write: Some(write),
        peer,
        reader,
    };
    let _ = tx.try_send(Inbound::NewConn { conn_id, conn });
}

/// Decode frames off one connection's read half for as long as it lives,
/// forwarding each to the actor. The first frame must be `OpenControlConn`
/// or `OpenDataConn`; everything after is routed by whatever kind that
/// turned out to be, which the actor — not this task — tracks.
async fn read_loop(conn_id: u64, mut read: OwnedReadHalf, tx: mpsc::Sender<Inbound>, mut shutdown: Shutdown) {
    let mut kind = None;
    loop {
        let decoded = tokio::select! {
            result = read_one_frame(&mut read) => result,
            () = shutdown.recv() => return,
        };
        let (test_id, frame) = match decoded {
            Ok(decoded) => decoded,
            Err(_) => {
                let _ = tx.send(Inbound::ConnClosed { conn_id }).await;
                return;
            }
        };
        let this_kind = *kind.get_or_insert_with(|| classify(&frame));
        if tx
            .send(Inbound::Frame {
                conn_id,
                kind: this_kind,
                test_id,
                frame,
            })
            .await
            .is_err()
        {
            return;
        }
    }
}

fn classify(frame: &Frame) -> ConnKind {
    match frame.tag() {
        FrameTag::OpenDataConn | FrameTag::Data | FrameTag::DataComplete | FrameTag::DataCompleteResponse => {
            ConnKind::Data
        }
        _ => ConnKind::Control,
    }
}

async fn read_one_frame(read: &mut OwnedReadHalf) -> std::io::Result<(u32, Frame)> {
    let mut header_buf = [0u8; HEADER_SIZE];
    read.read_exact(&mut header_buf).await?;
    let header = zap_wire::FrameHeader::decode(&header_buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut payload = vec![0u8; header.length as usize - HEADER_SIZE];
    read.read_exact(&mut payload).await?;
    let tag = FrameTag::try_from(header.tag)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let frame = Frame::decode_payload(tag, header.length, &payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok((header.test_id, frame))
}

async fn udp_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<Inbound>, mut shutdown: Shutdown) {
    let mut buf = vec![0u8; zap_wire::MAX_PACKET_LEN];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, src)) => {
                        match Frame::decode_datagram(&buf[..len]) {
                            Ok((test_id, frame)) => {
                                if tx.send(Inbound::Udp { test_id, frame, src }).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!(error = %e, %src, "dropped malformed datagram"),
                        }
                    }
                    Err(e) => warn!(error = %e, "udp recv failed"),
                }
            }
            () = shutdown.recv() => return,
        }
    }
}

/// The single task that owns [`StationTable`]. Every mutation of station
/// state happens here and only here.
async fn actor_loop(
    mut rx: mpsc::Receiver<Inbound>,
    udp_socket: Arc<UdpSocket>,
    _config: ServerConfig,
    mut shutdown: Shutdown,
) {
    let mut table = StationTable::new();
    // conn_id -> (slot index, role) once a connection has been attributed
    // to a station.
    let mut conns: FxHashMap<u64, (usize, ConnKind)> = FxHashMap::default();
    // Connections the actor has a write half and reader handle for, but
    // has not yet attributed to a station because no frame arrived yet.
    let mut pending: FxHashMap<u64, Connection> = FxHashMap::default();
    // Per-station ack forwarders to the running transmitter task, if any.
    let mut ack_senders: FxHashMap<u32, mpsc::Sender<u32>> = FxHashMap::default();

    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
            () = shutdown.recv() => {
                for station in table.iter_mut() {
                    if !station.is_off() {
                        station.zap_clean_station().await;
                    }
                }
                return;
            }
        };

        match event {
            Inbound::NewConn { conn_id, conn } => {
                pending.insert(conn_id, conn);
            }
            Inbound::Frame {
                conn_id,
                kind,
                test_id,
                frame,
            } => {
                handle_frame(
                    conn_id,
                    kind,
                    test_id,
                    frame,
                    &mut table,
                    &mut conns,
                    &mut pending,
                    &mut ack_senders,
                    Arc::clone(&udp_socket),
                )
                .await;
            }
            Inbound::ConnClosed { conn_id } => {
                pending.remove(&conn_id);
                if let Some((slot, _kind)) = conns.remove(&conn_id) {
                    let tid = table.get(slot).id;
                    if tid != 0 {
                        debug!(tid, conn_id, "connection closed, cleaning station");
                        table.get_mut(slot).zap_clean_station().await;
                        ack_senders.remove(&tid);
                    }
                }
            }
            Inbound::Udp { test_id, frame, src } => {
                handle_udp(test_id, frame, src, &mut table).await;
            }
        }
        metrics::gauge!("zap_active_stations").set(table.active_count() as f64);
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_frame(
    conn_id: u64,
    kind: ConnKind,
    test_id: u32,
    frame: Frame,
    table: &mut StationTable,
    conns: &mut FxHashMap<u64, (usize, ConnKind)>,
    pending: &mut FxHashMap<u64, Connection>,
    ack_senders: &mut FxHashMap<u32, mpsc::Sender<u32>>,
    udp_socket: Arc<UdpSocket>,
) {
    // Frames on an already-attributed connection route straight to the
    // owning slot; its kind was decided when the connection first opened.
    if let Some(&(slot, _existing_kind)) = conns.get(&conn_id) {
        route_established(slot, kind, frame, table, ack_senders, udp_socket).await;
        return;
    }

    let Some(conn) = pending.remove(&conn_id) else {
        // Reader forwarded a frame for a connection we already rejected
        // and dropped; nothing to do.
        return;
    };

    match kind {
        ConnKind::Control => {
            let Frame::OpenControlConn { config: station_config } = frame else {
                warn!(test_id, "unexpected frame on a fresh control connection; closing");
                conn.close().await;
                return;
            };
            let Some(slot) = table.find(test_id, true) else {
                warn!(test_id, "station table full, rejecting");
                conn.close().await;
                return;
            };
            if table.get(slot).control.is_some() {
                // Duplicate OpenControlConn on a live slot: hard-close the
                // new socket, leave the existing station intact.
                debug!(test_id, "duplicate OpenControlConn, closing new connection");
                conn.close().await;
                return;
            }
            let station = table.get_mut(slot);
            station.config = station_config;
            station.state = StationState::RxConfig;
            station.control = Some(conn);
            conns.insert(conn_id, (slot, ConnKind::Control));
            send_control(table, slot, &Frame::Ready).await;
            if !station_config.is_transmitter() {
                table.get_mut(slot).state = StationState::RunningRx;
            }
        }
        ConnKind::Data => {
            let Frame::OpenDataConn = frame else {
                warn!(test_id, "unexpected frame on a fresh data connection; closing");
                conn.close().await;
                return;
            };
            let Some(slot) = table.find(test_id, false) else {
                warn!(test_id, "OpenDataConn for unknown station; closing");
                conn.close().await;
                return;
            };
            if table.get(slot).data.len() >= MAX_RECEIVERS {
                warn!(test_id, "MAX_RECEIVERS exhausted, rejecting data connection");
                conn.close().await;
                return;
            }
            table.get_mut(slot).data.push(conn);
            conns.insert(conn_id, (slot, ConnKind::Data));
            send_data_conn(table, slot, &Frame::Ready).await;
        }
    }
}

async fn route_established(
    slot: usize,
    kind: ConnKind,
    frame: Frame,
    table: &mut StationTable,
    ack_senders: &mut FxHashMap<u32, mpsc::Sender<u32>>,
    udp_socket: Arc<UdpSocket>,
) {
    match (kind, frame) {
        (ConnKind::Control, Frame::TestStart) => {
            if table.get(slot).config.is_transmitter() {
                table.get_mut(slot).state = StationState::RunningTx;
                spawn_transmitter(slot, table, ack_senders, udp_socket).await;
            } else {
                table.get_mut(slot).state = StationState::RunningRx;
            }
        }
        (ConnKind::Control, Frame::TestComplete) => {
            let tid = table.get(slot).id;
            table.get_mut(slot).zap_clean_station().await;
            ack_senders.remove(&tid);
        }
        (ConnKind::Control, Frame::Connect { remote_ip, ip_tos }) => {
            handle_connect(slot, remote_ip, ip_tos, table, &udp_socket).await;
        }
        (ConnKind::Data, Frame::DataComplete { batch_number }) => {
            let station = table.get_mut(slot);
            let (reports, respond) = receiver::on_data_complete(station, batch_number);
            for report in reports {
                send_control(table, slot, &Frame::PerformanceResult(report)).await;
            }
            if respond {
                send_data_conn(table, slot, &Frame::DataCompleteResponse { batch_number }).await;
            }
        }
        (ConnKind::Data, Frame::DataCompleteResponse { batch_number }) => {
            let tid = table.get(slot).id;
            if let Some(sender) = ack_senders.get(&tid) {
                let _ = sender.try_send(batch_number);
            }
            table.get_mut(slot).last_completed_batch = batch_number;
        }
        (ConnKind::Data, Frame::Data { batch_number, payload_number, frame_len }) => {
            let usec = crate::clock::now_micros();
            let station = table.get_mut(slot);
            match receiver::on_data(station, batch_number, payload_number, frame_len, usec) {
                Ok(reports) => {
                    metrics::counter!("zap_frames_received_total").increment(1);
                    for report in reports {
                        send_control(table, slot, &Frame::PerformanceResult(report)).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, tid = table.get(slot).id, "protocol violation, cleaning station");
                    metrics::counter!("zap_protocol_violations_total").increment(1);
                    table.get_mut(slot).zap_clean_station().await;
                }
            }
        }
        (kind, frame) => {
            warn!(?kind, tag = ?frame.tag(), "unexpected frame, cleaning station");
            metrics::counter!("zap_protocol_violations_total").increment(1);
            table.get_mut(slot).zap_clean_station().await;
        }
    }
}

/// `Connect` on the TX station's control socket: learn the RX's address,
/// open the TCP data rendezvous connection, prime the RX's NAT mapping
/// with a UDP `Null` frame sent from the same shared socket that station's
/// later `Data` traffic will use, and acknowledge.
async fn handle_connect(
    slot: usize,
    remote_ip: std::net::Ipv4Addr,
    ip_tos: u32,
    table: &mut StationTable,
    udp_socket: &UdpSocket,
) {
    let tid = table.get(slot).id;
    let rx_addr: SocketAddr = (remote_ip, SERVICE_PORT).into();
    table.get_mut(slot).tx_peer = Some(rx_addr);

    if table.get(slot).data.len() >= MAX_RECEIVERS {
        warn!(tid, "MAX_RECEIVERS exhausted, not opening another data connection");
    } else {
        match TcpStream::connect(rx_addr).await {
            Ok(data_stream) => {
                let _ = data_stream.set_nodelay(true);
                let bytes = Frame::OpenDataConn.encode(tid);
                let (read, mut write) = data_stream.into_split();
                if write.write_all(&bytes).await.is_ok() {
                    let reader = tokio::spawn(async move {
                        let mut read = read;
                        let mut buf = [0u8; HEADER_SIZE];
                        let _ = read.read_exact(&mut buf).await;
                    });
                    table.get_mut(slot).data.push(Connection {
                        write: Some(write),
                        peer: rx_addr,
                        reader,
                    });
                }
            }
            Err(e) => warn!(error = %e, %rx_addr, "failed to open TCP data connection to receiver"),
        }
    }

    let null = Frame::Null.encode(tid);
    if let Err(e) = udp_socket.send_to(&null, rx_addr).await {
        warn!(error = %e, %rx_addr, "failed to send NAT-priming datagram");
    }

    // Last writer wins on the shared socket's ToS, by design.
    if ip_tos != 0 {
        if let Err(e) = crate::socket::set_ip_tos(udp_socket, ip_tos) {
            warn!(error = %e, ip_tos, "failed to set IP ToS on shared UDP socket");
        }
    }
    send_control(table, slot, &Frame::Ready).await;
}

async fn handle_udp(test_id: u32, frame: Frame, src: SocketAddr, table: &mut StationTable) {
    let Some(slot) = table.find(test_id, false) else {
        return;
    };
    match frame {
        Frame::Null => {
            // NAT-prime: learn the transmitter's address if it wasn't
            // already known.
            let station = table.get_mut(slot);
            if station.tx_peer.is_none() {
                station.tx_peer = Some(src);
            }
        }
        Frame::Data {
            batch_number,
            payload_number,
            frame_len,
        } => {
            let usec = crate::clock::now_micros();
            let station = table.get_mut(slot);
            match receiver::on_data(station, batch_number, payload_number, frame_len, usec) {
                Ok(reports) => {
                    for report in reports {
                        send_control(table, slot, &Frame::PerformanceResult(report)).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, tid = test_id, "protocol violation on UDP data, cleaning station");
                    table.get_mut(slot).zap_clean_station().await;
                }
            }
        }
        other => {
            warn!(tag = ?other.tag(), "unexpected UDP frame, ignoring");
        }
    }
}

async fn send_control(table: &mut StationTable, slot: usize, frame: &Frame) {
    let test_id = table.get(slot).id;
    if let Some(conn) = table.get_mut(slot).control.as_mut() {
        if let Some(write) = conn.write.as_mut() {
            let bytes = frame.encode(test_id);
            if let Err(e) = write.write_all(&bytes).await {
                warn!(error = %e, test_id, "failed to write control frame");
            }
        }
    }
}

async fn send_data_conn(table: &mut StationTable, slot: usize, frame: &Frame) {
    let test_id = table.get(slot).id;
    if let Some(conn) = table.get_mut(slot).data.first_mut() {
        if let Some(write) = conn.write.as_mut() {
            let bytes = frame.encode(test_id);
            if let Err(e) = write.write_all(&bytes).await {
                warn!(error = %e, test_id, "failed to write data-channel frame");
            }
        }
    }
}

/// Spawn the transmitter task for a station that just received
/// `TestStart` with `tx=1`. The data connection at `data[0]` — the
/// back-channel used for `DataComplete`/`DataCompleteResponse` even over
/// UDP data, opened in [`handle_connect`] — has its write half handed to
/// the transmitter task; the actor keeps the reader side so
/// `DataCompleteResponse` frames still flow back through the normal
/// [`route_established`] path.
async fn spawn_transmitter(
    slot: usize,
    table: &mut StationTable,
    ack_senders: &mut FxHashMap<u32, mpsc::Sender<u32>>,
    udp_socket: Arc<UdpSocket>,
) {
    let station = table.get(slot);
    let test_id = station.id;
    let config = station.config;
    let tx_dest: SocketAddr = station.tx_peer.unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
    let (ack_tx, ack_rx) = mpsc::channel(64);
    ack_senders.insert(test_id, ack_tx);
    let (trigger, shutdown) = crate::signals::pair();
    table.get_mut(slot).tx_stop = Some(trigger);
    let ack_watermark = table.get(slot).ack.clone();

    let tcp_data = table
        .get_mut(slot)
        .data
        .first_mut()
        .and_then(|conn| conn.write.take());

    let plan = TransmitPlan {
        test_id,
        config,
        udp_tx: Some(udp_socket),
        tx_dest,
        tcp_data,
        acks: ack_rx,
        ack_watermark,
        shutdown,
    };
    tokio::spawn(transmitter::run(plan));
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use zap_wire::StationConfig;

    async fn loopback_connection() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    /// A `Connection` over a real loopback socket, with its reader task
    /// spun up the same way `spawn_connection` does, but with no frames
    /// ever decoded off it — the test drives `handle_frame` directly
    /// instead of going through `read_loop`.
    async fn fresh_connection() -> (Connection, TcpStream) {
        let (server_side, client_side) = loopback_connection().await;
        let (read, write) = server_side.into_split();
        let reader = tokio::spawn(async move {
            let mut read = read;
            let mut buf = [0u8; 1];
            let _ = tokio::io::AsyncReadExt::read(&mut read, &mut buf).await;
        });
        (
            Connection {
                write: Some(write),
                peer: "127.0.0.1:0".parse().unwrap(),
                reader,
            },
            client_side,
        )
    }

    async fn unbound_udp_socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    #[tokio::test]
    async fn open_control_conn_claims_slot_and_replies_ready() {
        let (conn, mut client_side) = fresh_connection().await;
        let mut table = StationTable::new();
        let mut conns = FxHashMap::default();
        let mut pending = FxHashMap::default();
        pending.insert(1, conn);
        let mut ack_senders = FxHashMap::default();

        handle_frame(
            1,
            ConnKind::Control,
            42,
            Frame::OpenControlConn {
                config: StationConfig {
                    tx: 0,
                    ..StationConfig::default()
                },
            },
            &mut table,
            &mut conns,
            &mut pending,
            &mut ack_senders,
            unbound_udp_socket().await,
        )
        .await;

        let slot = conns.get(&1).expect("connection attributed").0;
        assert!(table.get(slot).control.is_some());
        assert_eq!(table.get(slot).state, StationState::RunningRx);

        let mut header_buf = [0u8; HEADER_SIZE];
        client_side.read_exact(&mut header_buf).await.expect("ready header");
        let header = zap_wire::FrameHeader::decode(&header_buf).expect("header decodes");
        assert_eq!(FrameTag::try_from(header.tag), Ok(FrameTag::Ready));
    }

    #[tokio::test]
    async fn duplicate_open_control_conn_is_hard_closed() {
        let mut table = StationTable::new();
        let mut conns = FxHashMap::default();
        let mut pending = FxHashMap::default();
        let mut ack_senders = FxHashMap::default();

        let (first, _first_client) = fresh_connection().await;
        pending.insert(1, first);
        handle_frame(
            1,
            ConnKind::Control,
            7,
            Frame::OpenControlConn {
                config: StationConfig::default(),
            },
            &mut table,
            &mut conns,
            &mut pending,
            &mut ack_senders,
            unbound_udp_socket().await,
        )
        .await;

        let (second, mut second_client) = fresh_connection().await;
        pending.insert(2, second);
        handle_frame(
            2,
            ConnKind::Control,
            7,
            Frame::OpenControlConn {
                config: StationConfig::default(),
            },
            &mut table,
            &mut conns,
            &mut pending,
            &mut ack_senders,
            unbound_udp_socket().await,
        )
        .await;

        assert!(!conns.contains_key(&2));
        // The rejected second connection was hard-closed: its peer sees EOF
        // rather than the socket being silently leaked.
        let mut buf = [0u8; 1];
        let n = second_client.read(&mut buf).await.expect("read completes");
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn open_data_conn_rejected_once_max_receivers_reached() {
        let mut table = StationTable::new();
        let slot = table.find(9, true).expect("slot claimed");
        for _ in 0..MAX_RECEIVERS {
            let (conn, _client) = fresh_connection().await;
            table.get_mut(slot).data.push(conn);
        }

        let mut conns = FxHashMap::default();
        let mut pending = FxHashMap::default();
        let (conn, mut client_side) = fresh_connection().await;
        pending.insert(99, conn);
        let mut ack_senders = FxHashMap::default();

        handle_frame(
            99,
            ConnKind::Data,
            9,
            Frame::OpenDataConn,
            &mut table,
            &mut conns,
            &mut pending,
            &mut ack_senders,
            unbound_udp_socket().await,
        )
        .await;

        assert_eq!(table.get(slot).data.len(), MAX_RECEIVERS);
        assert!(!conns.contains_key(&99));
        let mut buf = [0u8; 1];
        let n = client_side.read(&mut buf).await.expect("read completes");
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_start_moves_transmitter_to_running_tx_and_receiver_to_running_rx() {
        let mut table = StationTable::new();
        let mut ack_senders = FxHashMap::default();

        let tx_slot = table.find(1, true).expect("slot claimed");
        table.get_mut(tx_slot).config = StationConfig {
            tx: 1,
            batches: 1,
            batch_size: 1,
            payload_length: StationConfig::MIN_PAYLOAD_LENGTH,
            ..StationConfig::default()
        };
        let (data_conn, _tx_data_client) = fresh_connection().await;
        table.get_mut(tx_slot).data.push(data_conn);

        route_established(
            tx_slot,
            ConnKind::Control,
            Frame::TestStart,
            &mut table,
            &mut ack_senders,
            unbound_udp_socket().await,
        )
        .await;
        assert_eq!(table.get(tx_slot).state, StationState::RunningTx);
        assert!(ack_senders.contains_key(&1));

        let rx_slot = table.find(2, true).expect("slot claimed");
        table.get_mut(rx_slot).config = StationConfig {
            tx: 0,
            ..StationConfig::default()
        };
        route_established(
            rx_slot,
            ConnKind::Control,
            Frame::TestStart,
            &mut table,
            &mut ack_senders,
            unbound_udp_socket().await,
        )
        .await;
        assert_eq!(table.get(rx_slot).state, StationState::RunningRx);
    }

    #[tokio::test]
    async fn null_frame_over_udp_learns_peer_address_once() {
        let mut table = StationTable::new();
        let slot = table.find(5, true).expect("slot claimed");
        assert!(table.get(slot).tx_peer.is_none());

        let first: SocketAddr = "10.0.0.1:18301".parse().unwrap();
        handle_udp(5, Frame::Null, first, &mut table).await;
        assert_eq!(table.get(slot).tx_peer, Some(first));

        // A second Null from a different source must not overwrite an
        // address already learned.
        let second: SocketAddr = "10.0.0.2:18301".parse().unwrap();
        handle_udp(5, Frame::Null, second, &mut table).await;
        assert_eq!(table.get(slot).tx_peer, Some(first));
    }

    #[tokio::test]
    async fn read_one_frame_rejects_version_mismatch() {
        let (server_side, mut client_side) = loopback_connection().await;
        let (mut read, _write) = server_side.into_split();

        let mut header = BytesMut::new();
        header.put_u32(zap_wire::PROTOCOL_MAJOR);
        header.put_u32(zap_wire::PROTOCOL_MINOR + 1);
        header.put_u32(1);
        header.put_u32(FrameTag::Ready as u32);
        header.put_u32(HEADER_SIZE as u32);
        client_side.write_all(&header).await.expect("write succeeds");

        let result = read_one_frame(&mut read).await;
        assert!(result.is_err());
    }
}
