//! Per-station server-side state: the data model and the fixed-size
//! station table every server owns.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use zap_wire::StationConfig;

pub use zap_wire::{MAX_RECEIVERS, MAX_STATIONS};

/// Delay between half-closing a station's sockets and actually closing
/// them, to let unsent bytes drain.
const DRAIN_DELAY: Duration = Duration::from_millis(100);

/// Server-side lifecycle of a station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationState {
    /// Slot unused.
    Off,
    /// A control connection exists but no configuration has arrived.
    Init,
    /// Configured, waiting to learn whether it is transmitter or receiver.
    RxConfig,
    /// Actively transmitting.
    RunningTx,
    /// Actively receiving.
    RunningRx,
    /// Test finished; awaiting cleanup.
    Complete,
}

/// The running statistics bucket between two [`zap_wire::PerformanceResult`]
/// emissions — "sample window".
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Timestamp (microseconds) the window's first frame arrived.
    pub first_frame_arrival_time: u64,
    /// Timestamp (microseconds) the window's most recent frame arrived.
    pub last_frame_arrival_time: u64,
    /// Running sum of inter-arrival gaps, microseconds.
    pub total_time: u64,
    /// Payload bytes accounted for in this window.
    pub payload_bytes: u32,
    /// Frames received and accounted for.
    pub frames_received: u32,
    /// Frames that arrived out of order.
    pub frames_out_of_order: u32,
    /// Frames that arrived more than once.
    pub frames_repeated: u32,
    /// Frames inferred lost.
    pub frames_skipped: u32,
}

impl Sample {
    /// Zero the window, as happens on every report emission.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Lock-free publication of a transmitter's acknowledged-batch watermark.
///
/// This is the one piece of [`Station`] state touched from a task other
/// than the server actor: the actor updates it when a
/// `DataCompleteResponse` arrives, and the station's transmitter task reads
/// it to evaluate the asynchronous window. An `Arc<AtomicU32>` plus
/// [`Notify`] is a deliberate, narrow exception to "station state is
/// touched only from the loop" — see DESIGN.md.
#[derive(Debug, Clone)]
pub struct AckWatermark(Arc<AckWatermarkInner>);

#[derive(Debug, Default)]
struct AckWatermarkInner {
    last_completed_batch: AtomicU32,
    notify: Notify,
}

impl Default for AckWatermark {
    fn default() -> Self {
        Self(Arc::new(AckWatermarkInner::default()))
    }
}

impl AckWatermark {
    /// Record a newly acknowledged batch and wake any waiting transmitter.
    pub fn publish(&self, batch: u32) {
        self.0.last_completed_batch.store(batch, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    /// Read the current watermark.
    #[must_use]
    pub fn get(&self) -> u32 {
        self.0.last_completed_batch.load(Ordering::Acquire)
    }

    /// Resolve the next time the watermark is published.
    pub async fn changed(&self) {
        self.0.notify.notified().await;
    }
}

/// A live TCP connection belonging to a station: the write half the server
/// actor uses to send frames, plus the handle of the task reading frames
/// off the other half and forwarding them as [`crate::server::Inbound`]
/// events.
///
/// `write` is `None` once a station's transmitter task has taken ownership
/// of a data connection's write half to drive it directly; the reader
/// side, and therefore `DataCompleteResponse` ingress, stays with the
/// actor either way.
#[derive(Debug)]
pub struct Connection {
    /// Write half, owned by the server actor until a transmitter task
    /// claims it.
    pub write: Option<OwnedWriteHalf>,
    /// Peer address, for logging.
    pub peer: SocketAddr,
    /// The task reading this connection's read half.
    pub reader: JoinHandle<()>,
}

impl Connection {
    /// Shut down the write half, abort the paired reader task, and drop
    /// the connection. Used both by [`Station::zap_clean_station`] and by
    /// the server actor to hard-close a connection it rejects before it
    /// is ever attributed to a station slot.
    pub(crate) async fn close(mut self) {
        if let Some(mut write) = self.write.take() {
            let _ = write.shutdown().await;
        }
        self.reader.abort();
    }
}

/// One station slot.
#[derive(Debug)]
pub struct Station {
    /// Test id; `0` means the slot is free.
    pub id: u32,
    /// Current lifecycle state.
    pub state: StationState,
    /// Negotiated configuration.
    pub config: StationConfig,
    /// Control connection (`s_control`).
    pub control: Option<Connection>,
    /// Data connections (`s_tcp[0..count)`); `data[0]` is the back-channel
    /// used for `DataComplete`/`DataCompleteResponse` even when payload
    /// data itself travels over UDP.
    pub data: Vec<Connection>,
    /// Current batch number.
    pub batch_num: u32,
    /// Number of `PerformanceResult` reports emitted so far.
    pub sample_num: u32,
    /// Highest batch number acknowledged via `DataCompleteResponse`.
    pub last_completed_batch: u32,
    /// Next expected receive payload index / next payload to transmit.
    pub payload_num: u32,
    /// Current measurement window.
    pub sample: Sample,
    /// Learned or configured UDP peer address for data frames.
    pub tx_peer: Option<SocketAddr>,
    /// Shared ack watermark for this station's transmitter task, if any.
    pub ack: AckWatermark,
    /// Stops this station's transmitter task, if one is running.
    pub tx_stop: Option<crate::signals::Trigger>,
}

impl Station {
    /// A freed slot: `id == 0`, `state == Off`, no sockets.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            id: 0,
            state: StationState::Off,
            config: StationConfig::default(),
            control: None,
            data: Vec::new(),
            batch_num: 0,
            sample_num: 0,
            last_completed_batch: 0,
            payload_num: 0,
            sample: Sample::default(),
            tx_peer: None,
            ack: AckWatermark::default(),
            tx_stop: None,
        }
    }

    /// A slot is `Off` iff it has no id and no live sockets.
    #[must_use]
    pub fn is_off(&self) -> bool {
        self.state == StationState::Off && self.id == 0 && self.control.is_none() && self.data.is_empty()
    }

    /// Close every socket this station owns: shut down the write side,
    /// abort the paired reader task, wait briefly to let unsent bytes
    /// drain, then reset to a fresh empty slot. The station is either
    /// fully intact or fully clean; there is no partially-cleaned
    /// observable state (scoped-resource requirement).
    pub async fn zap_clean_station(&mut self) {
        if let Some(stop) = self.tx_stop.take() {
            stop.fire();
        }
        if let Some(conn) = self.control.take() {
            conn.close().await;
        }
        for conn in self.data.drain(..) {
            conn.close().await;
        }
        tokio::time::sleep(DRAIN_DELAY).await;
        let id = self.id;
        *self = Self::empty();
        tracing::debug!(tid = id, "station cleaned");
    }
}

/// The fixed `MAX_STATIONS`-slot table every server owns.
#[derive(Debug)]
pub struct StationTable {
    slots: Vec<Station>,
}

impl StationTable {
    /// Build a table of `MAX_STATIONS` empty slots.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_STATIONS).map(|_| Station::empty()).collect(),
        }
    }

    /// `find_station(tid, add)`: return the slot already
    /// bound to `tid`, or -- if `add` is set and a free slot exists -- claim
    /// the first free slot for `tid`. Returns `None` if no slot matches and
    /// either `add` is false or the table is full.
    pub fn find(&mut self, tid: u32, add: bool) -> Option<usize> {
        let mut free_slot = None;
        for (i, s) in self.slots.iter().enumerate() {
            if s.id == tid {
                return Some(i);
            }
            if free_slot.is_none() && s.state == StationState::Off {
                free_slot = Some(i);
            }
        }
        if add {
            if let Some(i) = free_slot {
                let s = &mut self.slots[i];
                s.id = tid;
                s.state = StationState::Init;
                s.sample = Sample::default();
                return Some(i);
            }
        }
        None
    }

    /// Borrow slot `idx`.
    #[must_use]
    pub fn get(&self, idx: usize) -> &Station {
        &self.slots[idx]
    }

    /// Mutably borrow slot `idx`.
    pub fn get_mut(&mut self, idx: usize) -> &mut Station {
        &mut self.slots[idx]
    }

    /// Iterate every slot.
    pub fn iter(&self) -> impl Iterator<Item = &Station> {
        self.slots.iter()
    }

    /// Iterate every slot index alongside the slot.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Station> {
        self.slots.iter_mut()
    }

    /// Count of slots not currently `Off`.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.state != StationState::Off).count()
    }
}

impl Default for StationTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn find_without_add_fails_on_unknown_tid() {
        let mut table = StationTable::new();
        assert_eq!(table.find(42, false), None);
    }

    #[test]
    fn find_with_add_claims_first_free_slot() {
        let mut table = StationTable::new();
        let idx = table.find(42, true).expect("slot claimed");
        assert_eq!(table.get(idx).id, 42);
        assert_eq!(table.get(idx).state, StationState::Init);
    }

    #[test]
    fn find_returns_existing_slot_for_known_tid() {
        let mut table = StationTable::new();
        let first = table.find(7, true).unwrap();
        let second = table.find(7, true).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn find_fails_when_table_is_full() {
        let mut table = StationTable::new();
        for tid in 1..=MAX_STATIONS as u32 {
            table.find(tid, true).expect("slot available");
        }
        assert_eq!(table.find(999, true), None);
    }

    #[test]
    fn at_most_one_slot_per_tid() {
        let mut table = StationTable::new();
        table.find(5, true).unwrap();
        let ids: Vec<u32> = table.iter().map(|s| s.id).filter(|&id| id == 5).collect();
        assert_eq!(ids.len(), 1);
    }

    async fn loopback_connection() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn zap_clean_station_resets_to_off() {
        let (server_side, _client_side) = loopback_connection().await;
        let (read, write) = server_side.into_split();
        let reader = tokio::spawn(async move {
            let mut r = read;
            let mut buf = [0u8; 1];
            let _ = tokio::io::AsyncReadExt::read(&mut r, &mut buf).await;
        });

        let mut station = Station::empty();
        station.id = 99;
        station.state = StationState::RunningRx;
        station.control = Some(Connection {
            write: Some(write),
            peer: "127.0.0.1:0".parse().unwrap(),
            reader,
        });

        station.zap_clean_station().await;
        assert!(station.is_off());
    }
}
