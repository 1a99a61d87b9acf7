//! Receiver measurement engine.
//!
//! Turns a stream of possibly reordered, duplicated, or lost `Data` frames
//! (plus `DataComplete` markers) into a sequence of [`PerformanceResult`]
//! reports. Every function here is a pure transformation of [`Station`]
//! fields; the server actor is the only caller, so there is nothing to
//! synchronize.

use zap_wire::PerformanceResult;

use crate::station::Station;

/// `rx_payload` named a slot outside `config.batch_size`. This is a
/// protocol-level error: the caller should run `Station::zap_clean_station`
/// on the owning slot.
#[derive(thiserror::Error, Debug)]
#[error("payload index {rx_payload} is out of range for batch_size {batch_size}")]
pub struct PayloadOutOfRange {
    rx_payload: u32,
    batch_size: u32,
}

/// Process one `Data{rx_batch, rx_payload}` frame of `frame_len` wire bytes
/// arriving at `usec`, mutating the station's sample window and returning
/// every [`PerformanceResult`] this frame causes to be emitted (zero, one,
/// or several when a batch skip is discovered).
///
/// Two quirks are preserved deliberately rather than smoothed over:
///
/// - The first two arrivals in a batch anchor `first_frame_arrival_time`
///   and `last_frame_arrival_time` and return without touching any
///   counter, so the first two payloads of every batch are never counted
///   in `frames_received`.
/// - `frames_repeated` is tracked on [`crate::station::Sample`] but never
///   incremented anywhere in this module: it is read back into every
///   report but nothing in the receive path ever detects a repeated
///   frame. See DESIGN.md.
pub fn on_data(
    station: &mut Station,
    rx_batch: u32,
    rx_payload: u32,
    frame_len: u32,
    usec: u64,
) -> Result<Vec<PerformanceResult>, PayloadOutOfRange> {
    let batch_size = station.config.batch_size;
    if rx_payload >= batch_size {
        return Err(PayloadOutOfRange {
            rx_payload,
            batch_size,
        });
    }

    let mut reports = Vec::new();

    if station.batch_num < rx_batch {
        jump_ahead(station, rx_batch, &mut reports);
    }
    if station.batch_num > rx_batch {
        // Seriously out-of-order frame for a batch we've moved past; toss it.
        return Ok(reports);
    }

    if station.sample.first_frame_arrival_time == 0 {
        station.sample.first_frame_arrival_time = usec;
        station.payload_num = rx_payload + 1;
        return Ok(reports);
    }
    if station.sample.last_frame_arrival_time == 0 {
        station.sample.last_frame_arrival_time = usec;
        station.payload_num = rx_payload + 1;
        return Ok(reports);
    }

    station.sample.total_time += usec - station.sample.last_frame_arrival_time;
    station.sample.last_frame_arrival_time = usec;
    station.sample.payload_bytes += frame_len;
    station.sample.frames_received += 1;

    if rx_payload < station.payload_num {
        station.sample.frames_out_of_order += 1;
    }
    if rx_payload > station.payload_num {
        station.sample.frames_skipped += rx_payload - station.payload_num;
    }
    if rx_payload >= station.payload_num {
        station.payload_num = rx_payload + 1;
    }

    if rx_payload == batch_size - 1 && station.config.batch_time == 0 {
        reports.push(emit_report(station));
        advance_batch(station);
    }
    if station.config.batch_time != 0
        && station.sample.total_time >= u64::from(station.config.batch_time)
    {
        reports.push(emit_report(station));
    }

    Ok(reports)
}

/// A `DataComplete{batch_number}` marker arrived on TCP. If it names the
/// batch we're currently on, finalize it (without charging loss for
/// payloads that never arrived — unlike [`advance_batch`], this path does
/// not touch `frames_skipped`, matching the source material exactly).
/// Returns any report this produced plus whether `DataCompleteResponse`
/// should be echoed back.
pub fn on_data_complete(station: &mut Station, declared_batch: u32) -> (Vec<PerformanceResult>, bool) {
    let mut reports = Vec::new();
    if station.batch_num == declared_batch {
        station.sample.first_frame_arrival_time = 0;
        station.sample.last_frame_arrival_time = 0;
        station.batch_num += 1;
        station.payload_num = 0;
        if station.config.batch_time == 0 {
            reports.push(emit_report(station));
        }
    }
    let should_respond = station.config.batch_completion != 0;
    (reports, should_respond)
}

/// We observed a frame for `rx_batch`, strictly ahead of `station.batch_num`.
/// Finalize the batch in progress, then fast-forward through every batch
/// index between it and `rx_batch` that we never saw a single frame for,
/// emitting an empty report for each (when not in `batch_time` mode).
fn jump_ahead(station: &mut Station, rx_batch: u32, reports: &mut Vec<PerformanceResult>) {
    let batch_size = station.config.batch_size;

    advance_batch(station);
    if station.config.batch_time == 0 {
        reports.push(emit_report(station));
    }

    while station.batch_num < rx_batch {
        if station.config.batch_time == 0 {
            reports.push(PerformanceResult {
                received: 0,
                dropped: batch_size,
                out_of_order: 0,
                repeated: 0,
                batch: station.batch_num,
                first_ts: 0,
                last_ts: 0,
                bits_per_second: 0,
            });
        }
        station.batch_num += 1;
        station.payload_num = 0;
    }
    station.batch_num = rx_batch;
}

/// Charge the remainder of the current batch as skipped, clear the
/// arrival-time anchors, and move to the next batch index.
fn advance_batch(station: &mut Station) {
    let batch_size = station.config.batch_size;
    station.sample.frames_skipped += batch_size.saturating_sub(station.payload_num);
    station.sample.first_frame_arrival_time = 0;
    station.sample.last_frame_arrival_time = 0;
    station.batch_num += 1;
    station.payload_num = 0;
}

/// Build a [`PerformanceResult`] from the current sample window, stamp it
/// with `sample_num` (not `batch_num` — the two track together only when
/// every batch produces exactly one report, which is not true across a
/// jump-ahead's fast-forward reports), advance `sample_num`, and zero the
/// window for the next one.
///
/// `payloads_dropped` is set from `frames_skipped` unconditionally; there
/// is no separate accounting path for a batch finalized by `DataComplete`
/// versus one finalized by filling its last payload slot.
fn emit_report(station: &mut Station) -> PerformanceResult {
    let total_time = station.sample.total_time;
    let bits_per_second = if total_time == 0 {
        0
    } else {
        (u64::from(station.sample.frames_received)
            * u64::from(station.config.payload_length)
            * 8
            * 1_000_000
            / total_time) as u32
    };

    let report = PerformanceResult {
        received: station.sample.frames_received,
        dropped: station.sample.frames_skipped,
        out_of_order: station.sample.frames_out_of_order,
        repeated: station.sample.frames_repeated,
        batch: station.sample_num,
        first_ts: 0,
        last_ts: total_time as u32,
        bits_per_second,
    };

    station.sample_num += 1;
    station.sample.reset();
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use zap_wire::StationConfig;

    fn station_with(batch_size: u32, payload_length: u32, batch_time: u32) -> Station {
        let mut station = Station::empty();
        station.id = 1;
        station.config = StationConfig {
            batch_size,
            payload_length,
            batch_time,
            ..StationConfig::default()
        };
        station
    }

    fn feed(station: &mut Station, batch: u32, payload: u32, usec: u64) -> Vec<PerformanceResult> {
        on_data(station, batch, payload, 1028, usec).expect("payload in range")
    }

    /// Lossless UDP, single batch.
    #[test]
    fn lossless_batch_reports_full_reception() {
        let mut station = station_with(10, 1000, 0);
        let mut reports = Vec::new();
        for (i, payload) in (0..10).enumerate() {
            reports.extend(feed(&mut station, 0, payload, 1000 + i as u64 * 100));
        }
        assert_eq!(reports.len(), 1);
        let r = &reports[0];
        assert_eq!(r.received, 8); // first two arrivals anchor and aren't counted
        assert_eq!(r.dropped, 0);
        assert_eq!(r.out_of_order, 0);
    }

    /// Scenario 2: payloads 3 and 7 dropped in the test harness before
    /// reaching the engine.
    #[test]
    fn lossy_batch_counts_the_gap_as_skipped() {
        let mut station = station_with(10, 1000, 0);
        let delivered = [0u32, 1, 2, 4, 5, 6, 8, 9];
        let mut reports = Vec::new();
        for (i, payload) in delivered.iter().enumerate() {
            reports.extend(feed(&mut station, 0, *payload, 1000 + i as u64 * 100));
        }
        assert_eq!(reports.len(), 1);
        let r = &reports[0];
        assert_eq!(r.dropped, 2);
        assert_eq!(r.out_of_order, 0);
    }

    /// Scenario 3: payload 3 and 4 swapped.
    #[test]
    fn reordered_pair_counts_one_out_of_order_frame() {
        let mut station = station_with(10, 1000, 0);
        let delivered = [0u32, 1, 2, 4, 3, 5, 6, 7, 8, 9];
        let mut reports = Vec::new();
        for (i, payload) in delivered.iter().enumerate() {
            reports.extend(feed(&mut station, 0, *payload, 1000 + i as u64 * 100));
        }
        assert_eq!(reports.len(), 1);
        let r = &reports[0];
        assert_eq!(r.out_of_order, 1);
        assert_eq!(r.dropped, 0);
    }

    /// Scenario 4: batches 1 and 2 are never observed at all.
    #[test]
    fn batch_skip_emits_empty_reports_for_every_missed_batch() {
        let mut station = station_with(10, 1000, 0);
        let mut reports = Vec::new();
        for (i, payload) in (0..10u32).enumerate() {
            reports.extend(feed(&mut station, 0, payload, 1000 + i as u64 * 100));
        }
        assert_eq!(reports.len(), 1); // batch 0's own report

        // First frame of batch 3 arrives directly.
        reports.extend(feed(&mut station, 3, 0, 5000));
        assert_eq!(reports.len(), 4); // batch 0, batch 1 (empty), batch 2 (empty), nothing yet for 3
        assert_eq!(reports[1].batch, 1);
        assert_eq!(reports[1].received, 0);
        assert_eq!(reports[1].dropped, 10);
        assert_eq!(reports[2].batch, 2);
        assert_eq!(reports[2].dropped, 10);
        assert_eq!(station.batch_num, 3);
    }

    #[test]
    fn payload_index_at_batch_size_is_rejected() {
        let mut station = station_with(10, 1000, 0);
        let err = on_data(&mut station, 0, 10, 1028, 1000);
        assert!(err.is_err());
    }

    #[test]
    fn seriously_late_batch_is_dropped_silently() {
        let mut station = station_with(10, 1000, 0);
        for (i, payload) in (0..10u32).enumerate() {
            feed(&mut station, 2, payload, 1000 + i as u64 * 100);
        }
        assert_eq!(station.batch_num, 2);
        let reports = feed(&mut station, 0, 0, 9000);
        assert!(reports.is_empty());
        assert_eq!(station.batch_num, 2);
    }

    #[test]
    fn data_complete_on_current_batch_finalizes_without_charging_loss() {
        let mut station = station_with(10, 1000, 0);
        feed(&mut station, 0, 0, 1000);
        feed(&mut station, 0, 1, 1100);
        // Only two payloads ever arrived; DataComplete should not treat the
        // other eight as skipped.
        let (reports, _respond) = on_data_complete(&mut station, 0);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].dropped, 0);
        assert_eq!(station.batch_num, 1);
    }

    #[test]
    fn data_complete_response_only_when_negotiated() {
        let mut station = station_with(10, 1000, 0);
        station.config.batch_completion = 0;
        let (_, respond) = on_data_complete(&mut station, 0);
        assert!(!respond);

        station.config.batch_completion = 1;
        let batch_num = station.batch_num;
        let (_, respond) = on_data_complete(&mut station, batch_num);
        assert!(respond);
    }

    #[test]
    fn frames_repeated_is_never_incremented() {
        // Feed the exact same payload twice; nothing in the engine detects
        // the duplicate (see module docs).
        let mut station = station_with(10, 1000, 0);
        feed(&mut station, 0, 0, 1000);
        feed(&mut station, 0, 1, 1100);
        feed(&mut station, 0, 1, 1200);
        assert_eq!(station.sample.frames_repeated, 0);
    }
}
