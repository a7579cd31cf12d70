//! Multi-Signal Adaptive congestion control and the reliability state
//! machine: in-flight bookkeeping, cumulative-ACK processing, duplicate-ACK
//! counting, fast recovery, timeout retransmission, and the end-of-transfer
//! handshake.
//!
//! Grounded in `original_source/senders/custom_protocol.py::CustomProtocol`
//! for every formula and the shape of `task-udp/src/main.rs`'s send loop
//! (a `HashMap<seq, entry>` in-flight table driven by a single blocking
//! receive per iteration).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::SenderError;
use crate::metrics::Metrics;
use crate::packet::{self, MSS};
use crate::rtt::RttEstimator;
use crate::transport::Transport;

const INITIAL_CWND: f64 = 10.0;
const INITIAL_SSTHRESH: f64 = 32.0;
const INITIAL_BDP: f64 = 32.0;
const RTT_GRADIENT_THRESHOLD: f64 = 1.20;
const CA_INCREMENT: f64 = 2.0;
const DELAY_REDUCTION_FACTOR: f64 = 0.95;
const DUP_ACK_THRESHOLD: u32 = 3;
const RTT_HISTORY_BOUND: usize = 10;
const THROUGHPUT_HISTORY_BOUND: usize = 5;
/// Window floor used on timeout, per the deliberate Reno departure in
/// `spec.md` §4.5.7/§9: stay in congestion avoidance rather than collapse
/// to a window of 1.
const INITIAL_WINDOW: f64 = 10.0;
/// Retransmission cap before a still-unacked segment is assumed to be a
/// stale ACK that the receiver already covered.
const MAX_RETRANSMISSIONS_BEFORE_STALE_CHECK: u32 = 5;
const FIN_WAIT: Duration = Duration::from_secs(5);

struct InFlightEntry {
    last_send: Instant,
    bytes: Vec<u8>,
    retrans_count: u32,
}

struct CongestionState {
    cwnd: f64,
    ssthresh: f64,
    in_slow_start: bool,
    in_fast_recovery: bool,
    recovery_point: i32,
    estimated_bdp: f64,
    base_rtt: Option<f64>,
    current_rtt: Option<f64>,
    rtt_gradient: f64,
    rtt_history: VecDeque<f64>,
    throughput_history: VecDeque<f64>,
    dup_ack_count: u32,
    last_ack_id: i32,
    highest_acked: i32,
}

impl CongestionState {
    fn new() -> Self {
        Self {
            cwnd: INITIAL_CWND,
            ssthresh: INITIAL_SSTHRESH,
            in_slow_start: true,
            in_fast_recovery: false,
            recovery_point: 0,
            estimated_bdp: INITIAL_BDP,
            base_rtt: None,
            current_rtt: None,
            rtt_gradient: 0.0,
            rtt_history: VecDeque::with_capacity(RTT_HISTORY_BOUND),
            throughput_history: VecDeque::with_capacity(THROUGHPUT_HISTORY_BOUND),
            dup_ack_count: 0,
            last_ack_id: -1,
            highest_acked: -1,
        }
    }
}

/// Drives one unidirectional transfer to completion over `T`.
pub struct Engine<T: Transport> {
    transport: T,
    rtt: RttEstimator,
    metrics: Metrics,
    cc: CongestionState,
    in_flight: HashMap<i32, InFlightEntry>,
    chunks: Vec<Vec<u8>>,
    packets_sent: usize,
    packets_acked: usize,
    total_packets: usize,
    payload_len: usize,
}

impl<T: Transport> Engine<T> {
    pub fn new(transport: T, payload: &[u8]) -> Self {
        let chunks: Vec<Vec<u8>> = payload.chunks(MSS).map(|c| c.to_vec()).collect();
        let total_packets = chunks.len();
        Self {
            transport,
            rtt: RttEstimator::new(),
            metrics: Metrics::new(),
            cc: CongestionState::new(),
            in_flight: HashMap::new(),
            chunks,
            packets_sent: 0,
            packets_acked: 0,
            total_packets,
            payload_len: payload.len(),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Runs the transfer to completion: fill-window / await-ack loop, then
    /// the EOF marker and FIN handshake. Only fatal transport errors
    /// propagate; `Timeout` and `MalformedPacket` are handled internally.
    pub fn run(&mut self) -> Result<(), SenderError> {
        self.metrics.start_transfer();
        info!(
            total_packets = self.total_packets,
            cwnd = self.cc.cwnd,
            ssthresh = self.cc.ssthresh,
            "starting transfer"
        );

        loop {
            self.fill_window()?;
            if self.in_flight.is_empty() {
                break;
            }
            self.await_and_dispatch_ack()?;
        }

        self.send_eof_and_await_fin()?;
        self.metrics.end_transfer();
        info!(
            packets_acked = self.packets_acked,
            score = self.metrics.score(),
            "transfer complete"
        );
        Ok(())
    }

    fn fill_window(&mut self) -> Result<(), SenderError> {
        while self.in_flight.len() < self.cc.cwnd.floor().max(1.0) as usize
            && self.packets_sent < self.total_packets
        {
            let seq_id = (self.packets_sent * MSS) as i32;
            let bytes = self.chunks[self.packets_sent].clone();
            self.send_segment(seq_id, bytes, 0)?;
            self.packets_sent += 1;
        }
        Ok(())
    }

    fn send_segment(
        &mut self,
        seq_id: i32,
        bytes: Vec<u8>,
        retrans_count: u32,
    ) -> Result<(), SenderError> {
        let now = Instant::now();
        let packet = packet::encode(seq_id, &bytes);
        self.transport.send(&packet)?;
        self.metrics.record_send(bytes.len(), now);
        self.in_flight.insert(
            seq_id,
            InFlightEntry {
                last_send: now,
                bytes,
                retrans_count,
            },
        );
        Ok(())
    }

    fn smallest_in_flight_seq(&self) -> Option<i32> {
        self.in_flight.keys().copied().min()
    }

    fn await_and_dispatch_ack(&mut self) -> Result<(), SenderError> {
        match self.transport.receive(None) {
            Ok(bytes) => match packet::decode_ack(&bytes) {
                Ok((ack_id, message)) => self.dispatch_ack(ack_id, &message),
                Err(SenderError::MalformedPacket) => {
                    warn!("discarding malformed ACK datagram");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Err(SenderError::Timeout) => self.handle_timeout(),
            Err(e) => Err(e),
        }
    }

    fn dispatch_ack(&mut self, ack_id: i32, message: &str) -> Result<(), SenderError> {
        let ack_time = Instant::now();

        if message.starts_with("fin") {
            self.respond_fin(ack_id)?;
            return Ok(());
        }

        if ack_id == self.cc.last_ack_id {
            self.handle_duplicate_ack()?;
        } else {
            self.handle_new_ack(ack_id, ack_time)?;
        }
        Ok(())
    }

    fn handle_duplicate_ack(&mut self) -> Result<(), SenderError> {
        self.cc.dup_ack_count += 1;
        if self.cc.dup_ack_count == DUP_ACK_THRESHOLD && !self.cc.in_fast_recovery {
            if let Some(seq) = self.smallest_in_flight_seq() {
                let bytes = self.in_flight.get(&seq).unwrap().bytes.clone();
                let retrans_count = self.in_flight.get(&seq).unwrap().retrans_count;
                self.send_segment(seq, bytes, retrans_count + 1)?;
                self.handle_loss(false);
                self.cc.recovery_point = self.in_flight.keys().copied().max().unwrap_or(seq);
                warn!(seq, cwnd = self.cc.cwnd, "fast retransmit");
            }
        } else if self.cc.in_fast_recovery {
            self.cc.cwnd += 1.0;
        }
        Ok(())
    }

    fn handle_new_ack(&mut self, ack_id: i32, ack_time: Instant) -> Result<(), SenderError> {
        self.cc.dup_ack_count = 0;
        self.cc.last_ack_id = ack_id;

        if ack_id > self.cc.highest_acked {
            self.cc.highest_acked = ack_id;

            let mut retiring: Vec<i32> = self
                .in_flight
                .iter()
                .filter(|(seq, entry)| **seq + entry.bytes.len() as i32 <= ack_id)
                .map(|(seq, _)| *seq)
                .collect();
            retiring.sort_unstable();

            for seq in retiring {
                let entry = self.in_flight.remove(&seq).unwrap();
                let sample_rtt = ack_time.saturating_duration_since(entry.last_send).as_secs_f64();
                let is_retrans = entry.retrans_count > 0;
                self.rtt.update(sample_rtt, is_retrans);
                if !is_retrans {
                    self.update_rtt_signals(sample_rtt);
                }
                self.metrics.record_ack(entry.last_send, ack_time);
                self.packets_acked += 1;
            }

            self.transport.set_default_timeout(self.rtt.current_rto());

            let throughput = self.metrics.throughput();
            if self.cc.throughput_history.len() == THROUGHPUT_HISTORY_BOUND {
                self.cc.throughput_history.pop_front();
            }
            self.cc.throughput_history.push_back(throughput);

            self.update_window();

            if self.cc.in_fast_recovery && ack_id >= self.cc.recovery_point {
                self.cc.cwnd = self.cc.ssthresh;
                self.cc.in_fast_recovery = false;
                info!(cwnd = self.cc.cwnd, "exited fast recovery");
            }
        } else {
            let mut retiring: Vec<i32> = self
                .in_flight
                .iter()
                .filter(|(seq, entry)| **seq + entry.bytes.len() as i32 <= ack_id)
                .map(|(seq, _)| *seq)
                .collect();
            retiring.sort_unstable();
            for seq in retiring {
                self.in_flight.remove(&seq);
                self.packets_acked += 1;
            }
        }
        Ok(())
    }

    fn update_rtt_signals(&mut self, sample_rtt: f64) {
        self.cc.current_rtt = Some(sample_rtt);
        if self.cc.rtt_history.len() == RTT_HISTORY_BOUND {
            self.cc.rtt_history.pop_front();
        }
        self.cc.rtt_history.push_back(sample_rtt);

        self.cc.base_rtt = Some(match self.cc.base_rtt {
            Some(base) => base.min(sample_rtt),
            None => sample_rtt,
        });

        if self.cc.rtt_history.len() >= 2 {
            if let Some(base) = self.cc.base_rtt {
                if base > 0.0 {
                    let window: Vec<f64> = self.cc.rtt_history.iter().rev().take(3).copied().collect();
                    let recent_avg = window.iter().sum::<f64>() / window.len() as f64;
                    self.cc.rtt_gradient = recent_avg / base;
                }
            }
        }
    }

    /// Literal `throughput_history[0]` baseline, per `spec.md`'s Open
    /// Questions: preserved even though a rolling mean would read more
    /// naturally, because the reference implementation uses the index.
    fn detect_phase_transition(&self) -> bool {
        if self.cc.rtt_history.len() < 3 || self.cc.throughput_history.len() < 3 {
            return false;
        }

        let n = self.cc.rtt_history.len();
        let recent_rtt: f64 = self.cc.rtt_history.iter().rev().take(3).sum::<f64>() / 3.0;
        let older_n = n.saturating_sub(3);
        let older_rtt = if older_n > 0 {
            self.cc.rtt_history.iter().take(older_n).sum::<f64>() / older_n as f64
        } else {
            0.0
        };
        if older_rtt > 0.0 && ((recent_rtt - older_rtt).abs() / older_rtt) > 0.30 {
            return true;
        }

        let recent_tput: f64 = self.cc.throughput_history.iter().rev().take(2).sum::<f64>() / 2.0;
        let older_tput = self.cc.throughput_history[0];
        if older_tput > 0.0 && ((recent_tput - older_tput).abs() / older_tput) > 0.40 {
            return true;
        }

        false
    }

    fn estimate_bdp(&mut self) -> f64 {
        if let Some(current_rtt) = self.cc.current_rtt {
            if current_rtt > 0.0 && !self.cc.throughput_history.is_empty() {
                let avg_throughput = self.cc.throughput_history.iter().sum::<f64>()
                    / self.cc.throughput_history.len() as f64;
                let bdp_candidate = (avg_throughput / MSS as f64) * current_rtt;
                self.cc.estimated_bdp = 0.8 * self.cc.estimated_bdp + 0.2 * bdp_candidate;
            }
        }
        self.cc.estimated_bdp.max(10.0)
    }

    fn update_window(&mut self) {
        if self.detect_phase_transition() {
            debug!("phase transition detected");
            self.cc.estimated_bdp = self.estimate_bdp();
            self.cc.ssthresh = self.cc.estimated_bdp.max(16.0);
            if self.cc.cwnd < self.cc.ssthresh {
                self.cc.in_slow_start = true;
            }
        }

        if self.cc.in_slow_start {
            let increment = (self.cc.estimated_bdp / self.cc.cwnd.max(1.0)).clamp(1.0, 2.0);
            self.cc.cwnd += increment;
            if self.cc.cwnd >= self.cc.ssthresh {
                self.cc.in_slow_start = false;
            } else if self.cc.rtt_gradient > RTT_GRADIENT_THRESHOLD && self.cc.base_rtt.is_some() {
                self.cc.ssthresh = self.cc.cwnd.max(self.cc.ssthresh);
                self.cc.in_slow_start = false;
            }
        } else {
            self.cc.cwnd += CA_INCREMENT / self.cc.cwnd;
        }

        if self.cc.rtt_gradient > 1.15 && !self.cc.in_slow_start {
            self.cc.cwnd = (self.cc.cwnd * DELAY_REDUCTION_FACTOR).max(1.0);
        }
    }

    fn handle_loss(&mut self, is_timeout: bool) {
        if is_timeout {
            self.cc.ssthresh = (self.cc.cwnd / 2.0).max(2.0);
            self.cc.cwnd = self.cc.ssthresh.max(INITIAL_WINDOW);
            self.cc.in_slow_start = false;
            self.cc.in_fast_recovery = false;
        } else {
            self.cc.ssthresh = (self.cc.cwnd / 2.0).max(2.0);
            self.cc.cwnd = self.cc.ssthresh + 3.0;
            self.cc.in_fast_recovery = true;
        }
    }

    fn handle_timeout(&mut self) -> Result<(), SenderError> {
        let seq = match self.smallest_in_flight_seq() {
            Some(seq) => seq,
            None => {
                if self.packets_acked >= self.total_packets {
                    return Ok(());
                }
                warn!("timeout with no packets in flight; retrying");
                return Ok(());
            }
        };

        let (retrans_count, seq_len) = {
            let entry = self.in_flight.get(&seq).unwrap();
            (entry.retrans_count, entry.bytes.len() as i32)
        };

        if retrans_count >= MAX_RETRANSMISSIONS_BEFORE_STALE_CHECK
            && self.cc.highest_acked >= seq + seq_len
        {
            self.in_flight.remove(&seq);
            self.packets_acked += 1;
            warn!(seq, "dropping stale in-flight entry already covered by ACK");
            return Ok(());
        }

        let bytes = self.in_flight.get(&seq).unwrap().bytes.clone();
        self.send_segment(seq, bytes, retrans_count + 1)?;
        self.handle_loss(true);
        warn!(seq, retry = retrans_count + 1, cwnd = self.cc.cwnd, "timeout retransmit");
        Ok(())
    }

    fn respond_fin(&mut self, ack_id: i32) -> Result<(), SenderError> {
        let packet = packet::encode(ack_id, b"FIN/ACK");
        self.transport.send(&packet)?;
        info!(ack_id, "sent FIN/ACK");
        Ok(())
    }

    fn send_eof_and_await_fin(&mut self) -> Result<(), SenderError> {
        let eof_seq = self.payload_len as i32;
        let now = Instant::now();
        self.transport.send(&packet::encode(eof_seq, b""))?;
        self.metrics.record_send(0, now);
        info!(seq = eof_seq, "sent EOF marker");

        match self.transport.receive(Some(FIN_WAIT)) {
            Ok(bytes) => match packet::decode_ack(&bytes) {
                Ok((ack_id, message)) if message.starts_with("fin") => self.respond_fin(ack_id),
                Ok(_) => Ok(()),
                Err(SenderError::MalformedPacket) => Ok(()),
                Err(e) => Err(e),
            },
            Err(SenderError::Timeout) => {
                warn!("timeout waiting for FIN");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;

    fn ack(ack_id: i32, message: &str) -> Vec<u8> {
        packet::encode(ack_id, message.as_bytes())
    }

    #[test]
    fn one_packet_transfer_sends_data_eof_and_finack() {
        let mut transport = RecordingTransport::new();
        transport.push_inbound(ack(100, ""));
        transport.push_inbound(ack(100, "fin"));

        let mut engine = Engine::new(transport, &vec![b'x'; 100]);
        engine.run().unwrap();

        let outbound = engine.transport.outbound.borrow();
        assert_eq!(outbound.len(), 3);
        assert_eq!(&outbound[0][..4], &0i32.to_be_bytes());
        assert_eq!(&outbound[1][..4], &100i32.to_be_bytes());
        assert!(outbound[1].len() == 4); // empty EOF payload
        assert_eq!(&outbound[2][..4], &100i32.to_be_bytes());
        assert_eq!(&outbound[2][4..], b"FIN/ACK");
        assert_eq!(engine.packets_acked, 1);
    }

    #[test]
    fn triple_duplicate_ack_triggers_fast_retransmit_and_recovery() {
        let mut transport = RecordingTransport::new();
        let mss = MSS as i32;
        transport.push_inbound(ack(mss, ""));
        transport.push_inbound(ack(mss, ""));
        transport.push_inbound(ack(mss, ""));
        transport.push_inbound(ack(mss, ""));
        transport.push_inbound(ack(10 * mss, ""));
        transport.push_inbound(ack(10 * mss, "fin"));

        let payload = vec![b'y'; 10 * MSS];
        let mut engine = Engine::new(transport, &payload);
        engine.run().unwrap();

        assert!(engine.cc.ssthresh >= 2.0);
        assert!(!engine.cc.in_fast_recovery);
        assert_eq!(engine.packets_acked, 10);
    }

    #[test]
    fn timeout_retransmission_updates_window_without_slow_start() {
        struct OneTimeoutThenAck {
            inner: RecordingTransport,
            timeouts_left: u32,
        }
        impl Transport for OneTimeoutThenAck {
            fn send(&self, bytes: &[u8]) -> Result<(), SenderError> {
                self.inner.send(bytes)
            }
            fn receive(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, SenderError> {
                if self.timeouts_left > 0 {
                    self.timeouts_left -= 1;
                    return Err(SenderError::Timeout);
                }
                self.inner.receive(timeout)
            }
            fn set_default_timeout(&mut self, timeout: Duration) {
                self.inner.set_default_timeout(timeout)
            }
        }

        let mut inner = RecordingTransport::new();
        let mss = MSS as i32;
        inner.push_inbound(ack(2 * mss, ""));
        inner.push_inbound(ack(2 * mss, "fin"));
        let transport = OneTimeoutThenAck {
            inner,
            timeouts_left: 1,
        };

        let payload = vec![b'z'; 2 * MSS];
        let mut engine = Engine::new(transport, &payload);
        engine.run().unwrap();

        assert!(!engine.cc.in_slow_start);
        assert!(engine.cc.cwnd >= engine.cc.ssthresh);
    }

    #[test]
    fn karns_rule_leaves_srtt_and_rttvar_unchanged_across_a_retransmitted_ack() {
        let mut transport = RecordingTransport::new();
        transport.push_inbound(ack(100, ""));
        transport.push_inbound(ack(100, "fin"));
        let mut engine = Engine::new(transport, &vec![b'a'; 100]);

        engine.rtt.update(0.05, false);
        let (srtt_before, rttvar_before) = (engine.rtt.srtt(), engine.rtt.rttvar());

        // Force the in-flight entry to look retransmitted before the ACK lands.
        engine.fill_window().unwrap();
        if let Some(entry) = engine.in_flight.get_mut(&0) {
            entry.retrans_count = 1;
        }
        engine.await_and_dispatch_ack().unwrap();

        assert_eq!(engine.rtt.srtt(), srtt_before);
        assert_eq!(engine.rtt.rttvar(), rttvar_before);
    }

    #[test]
    fn cwnd_never_drops_below_one() {
        let mut cc = CongestionState::new();
        cc.cwnd = 1.0;
        cc.in_slow_start = false;
        cc.rtt_gradient = 5.0;
        let transport = RecordingTransport::new();
        let mut engine = Engine::new(transport, &vec![b'a'; 10]);
        engine.cc = cc;
        engine.update_window();
        assert!(engine.cc.cwnd >= 1.0);
    }

    #[test]
    fn phase_change_reestimates_bdp_and_ssthresh() {
        let transport = RecordingTransport::new();
        let mut engine = Engine::new(transport, &vec![b'a'; 10]);
        for rtt in [0.05, 0.05, 0.05] {
            engine.update_rtt_signals(rtt);
        }
        engine.cc.throughput_history.extend([1000.0, 1000.0, 1000.0]);
        engine.cc.throughput_history.pop_front();
        engine.cc.throughput_history.pop_front();
        engine.cc.throughput_history.push_back(500.0);
        engine.cc.throughput_history.push_back(500.0);
        // throughput_history is now [1000.0, 500.0, 500.0] -> 40%+ swing from [0]
        engine.cc.cwnd = 5.0;
        engine.update_window();
        assert!(engine.cc.ssthresh >= 16.0);
    }
}
