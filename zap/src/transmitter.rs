//! Transmitter scheduler: batch-oriented, asynchronous, rate-paced. Runs as its own task per
//! transmitting station (spawned by the server actor when a station's
//! `TestStart` arrives), paced with [`zap_pacing::Pacer`] and gated on the
//! station's [`AckWatermark`] rather than on any shared mutable state, so it
//! never needs to reach back into the `StationTable`.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use zap_wire::{Frame, StationConfig};

use crate::signals::Shutdown;
use crate::station::AckWatermark;

/// Everything a transmitter task needs that isn't the station's ack
/// watermark: where to send data, where to send `DataComplete` /
/// `DataCompleteResponse` traffic, and the station's negotiated config.
pub struct TransmitPlan {
    /// This station's test id, stamped on every frame.
    pub test_id: u32,
    /// Negotiated configuration.
    pub config: StationConfig,
    /// Shared UDP transmit socket (unused when `config.is_tcp_data()`),
    /// shared with the server actor and every other live transmitter.
    pub udp_tx: Option<Arc<UdpSocket>>,
    /// Destination for UDP data frames.
    pub tx_dest: std::net::SocketAddr,
    /// TCP data channel (`s_tcp[0]`), used for `Data` frames when
    /// `config.is_tcp_data()`, and always for `DataComplete` /
    /// `DataCompleteResponse`.
    pub tcp_data: Option<tokio::net::tcp::OwnedWriteHalf>,
    /// Delivers `DataCompleteResponse.batch_number` as it arrives from the
    /// server actor's frame-classification task.
    pub acks: mpsc::Receiver<u32>,
    /// Watermark the server actor publishes to when a
    /// `DataCompleteResponse` is observed.
    pub ack_watermark: AckWatermark,
    /// Cooperative shutdown signal.
    pub shutdown: Shutdown,
}

/// Drive one station's transmit schedule to completion: `config.batches`
/// batches sent, `max_test_time` elapsed, or shutdown requested, whichever
/// comes first.
pub async fn run(mut plan: TransmitPlan) {
    let payload_pacer = zap_pacing::Pacer::from_micros(plan.config.payload_transmit_delay);
    let batch_pacer = zap_pacing::Pacer::from_micros(plan.config.batch_transmit_delay);
    let deadline = zap_pacing::Deadline::after_secs(plan.config.max_test_time);

    let mut batch_num: u32 = 0;
    while plan.config.batches == 0 || batch_num < plan.config.batches {
        if deadline.is_elapsed() || plan.shutdown.is_shutdown() {
            break;
        }

        if !advance_allowed(&plan, batch_num) {
            wait_for_window(&mut plan, batch_num).await;
            if plan.shutdown.is_shutdown() {
                break;
            }
        }

        for payload_num in 0..plan.config.batch_size {
            if plan.shutdown.is_shutdown() {
                return;
            }
            let frame = Frame::Data {
                batch_number: batch_num,
                payload_number: payload_num,
                frame_len: plan.config.payload_length,
            };
            if send_data(&mut plan, &frame).await.is_err() {
                // Peer classified as gone; nothing further to do for this
                // station. The server actor observes the closed socket on
                // its own and cleans the slot.
                return;
            }
            payload_pacer.pace().await;
        }

        if send_control(&mut plan, &Frame::DataComplete { batch_number: batch_num })
            .await
            .is_err()
        {
            return;
        }

        if plan.config.batch_completion != 0 {
            drain_acks_until(&mut plan, batch_num);
        } else {
            plan.ack_watermark.publish(batch_num);
        }

        batch_num += 1;
        batch_pacer.pace().await;
    }

    let _ = send_control(&mut plan, &Frame::TestComplete).await;
}

/// The asynchronous window rule: advance unconditionally when
/// `batch_completion == 0`, otherwise only once the ack watermark has
/// caught up enough that fewer than `asynchronous` batches are outstanding.
fn advance_allowed(plan: &TransmitPlan, batch_num: u32) -> bool {
    if plan.config.batch_completion == 0 {
        return true;
    }
    plan.ack_watermark.get() + plan.config.asynchronous > batch_num
}

async fn wait_for_window(plan: &mut TransmitPlan, batch_num: u32) {
    loop {
        if advance_allowed(plan, batch_num) || plan.shutdown.is_shutdown() {
            return;
        }
        tokio::select! {
            () = plan.ack_watermark.changed() => {}
            () = plan.shutdown.recv() => return,
        }
    }
}

/// Drain any `DataCompleteResponse` acks that arrived for `batch_num` or
/// earlier, publishing each to the watermark as it's observed. Used right
/// after sending `DataComplete` so the very next iteration's window check
/// sees an up-to-date watermark without a full `wait_for_window` round
/// trip when the ack already raced ahead of us.
fn drain_acks_until(plan: &mut TransmitPlan, batch_num: u32) {
    while let Ok(acked) = plan.acks.try_recv() {
        plan.ack_watermark.publish(acked);
        if acked >= batch_num {
            break;
        }
    }
}

async fn send_data(plan: &mut TransmitPlan, frame: &Frame) -> std::io::Result<()> {
    let bytes: Bytes = frame.encode(plan.test_id);
    if plan.config.is_tcp_data() {
        let writer = plan
            .tcp_data
            .as_mut()
            .expect("tcp data configured without a socket");
        writer.write_all(&bytes).await
    } else {
        let socket = plan
            .udp_tx
            .as_ref()
            .expect("udp data configured without a socket");
        socket.send_to(&bytes, plan.tx_dest).await.map(|_| ())
    }
}

async fn send_control(plan: &mut TransmitPlan, frame: &Frame) -> std::io::Result<()> {
    let bytes: Bytes = frame.encode(plan.test_id);
    let writer = plan
        .tcp_data
        .as_mut()
        .expect("data-complete channel requires s_tcp[0]");
    writer.write_all(&bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::AckWatermark;

    fn config(batches: u32, batch_completion: u32, asynchronous: u32) -> StationConfig {
        StationConfig {
            batches,
            batch_size: 4,
            batch_completion,
            asynchronous,
            payload_length: 1028,
            ..StationConfig::default()
        }
    }

    #[test]
    fn advance_allowed_ignores_watermark_without_batch_completion() {
        let plan_config = config(3, 0, 1);
        let ack = AckWatermark::default();
        let plan = fake_plan(plan_config, ack);
        assert!(advance_allowed(&plan, 5));
    }

    #[test]
    fn advance_allowed_gates_on_watermark_with_batch_completion() {
        let plan_config = config(3, 1, 1);
        let ack = AckWatermark::default();
        let plan = fake_plan(plan_config, ack.clone());
        assert!(advance_allowed(&plan, 0)); // 0 + 1 > 0
        assert!(!advance_allowed(&plan, 1)); // 0 + 1 > 1 is false
        ack.publish(1);
        assert!(advance_allowed(&plan, 1)); // 1 + 1 > 1
    }

    fn fake_plan(config: StationConfig, ack: AckWatermark) -> TransmitPlan {
        let (_tx, rx) = mpsc::channel(1);
        let (_trigger, shutdown) = crate::signals::pair();
        TransmitPlan {
            test_id: 1,
            config,
            udp_tx: None,
            tx_dest: "127.0.0.1:0".parse().unwrap(),
            tcp_data: None,
            acks: rx,
            ack_watermark: ack,
            shutdown,
        }
    }
}
