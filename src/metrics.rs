//! Throughput/delay/jitter/score accumulator.
//!
//! Mirrors the reference `TransferMetrics`: throughput counts every byte
//! placed on the wire, including retransmissions, so the score stays
//! goodput-biased rather than unique-bytes-biased.

use std::time::Instant;

pub struct Metrics {
    start: Option<Instant>,
    end: Option<Instant>,
    total_bytes: u64,
    last_send_time: Option<Instant>,
    inter_send_times: Vec<f64>,
    ack_delays: Vec<f64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start: None,
            end: None,
            total_bytes: 0,
            last_send_time: None,
            inter_send_times: Vec::new(),
            ack_delays: Vec::new(),
        }
    }

    pub fn start_transfer(&mut self) {
        self.start = Some(Instant::now());
    }

    pub fn end_transfer(&mut self) {
        self.end = Some(Instant::now());
    }

    /// Records a send event: payload bytes (retransmissions included) and
    /// the inter-send gap used for jitter.
    pub fn record_send(&mut self, bytes_sent: usize, send_time: Instant) {
        self.total_bytes += bytes_sent as u64;
        if let Some(last) = self.last_send_time {
            self.inter_send_times
                .push(send_time.saturating_duration_since(last).as_secs_f64());
        }
        self.last_send_time = Some(send_time);
    }

    pub fn record_ack(&mut self, send_time: Instant, ack_time: Instant) {
        self.ack_delays
            .push(ack_time.saturating_duration_since(send_time).as_secs_f64());
    }

    /// Elapsed time since `start_transfer()`. Before `end_transfer()` is
    /// called, "now" stands in for the end so the engine can query a live
    /// throughput figure mid-transfer for phase detection; the final
    /// figure uses the timestamp frozen by `end_transfer()`.
    pub fn duration(&self) -> f64 {
        match self.start {
            Some(start) => {
                let end = self.end.unwrap_or_else(Instant::now);
                end.saturating_duration_since(start).as_secs_f64().max(1e-6)
            }
            None => 1e-6,
        }
    }

    /// Total payload bytes transmitted divided by elapsed wall-clock time.
    pub fn throughput(&self) -> f64 {
        self.total_bytes as f64 / self.duration()
    }

    pub fn avg_delay(&self) -> f64 {
        if self.ack_delays.is_empty() {
            return 0.0;
        }
        self.ack_delays.iter().sum::<f64>() / self.ack_delays.len() as f64
    }

    /// Population standard deviation of inter-send gaps; zero below two sends.
    pub fn avg_jitter(&self) -> f64 {
        if self.inter_send_times.len() < 2 {
            return 0.0;
        }
        let mean = self.inter_send_times.iter().sum::<f64>() / self.inter_send_times.len() as f64;
        let variance = self
            .inter_send_times
            .iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>()
            / self.inter_send_times.len() as f64;
        variance.sqrt()
    }

    /// `throughput/2000 + 15/jitter (if jitter>0) + 35/delay (if delay>0)`.
    /// Each inverse term is omitted, not treated as infinite, when its
    /// denominator is zero.
    pub fn score(&self) -> f64 {
        let mut score = self.throughput() / 2000.0;
        let jitter = self.avg_jitter();
        if jitter > 0.0 {
            score += 15.0 / jitter;
        }
        let delay = self.avg_delay();
        if delay > 0.0 {
            score += 35.0 / delay;
        }
        score
    }

    /// `throughput,avg_delay,avg_jitter,score`, each to 7 decimal places.
    pub fn format_csv(&self) -> String {
        format!(
            "{:.7},{:.7},{:.7},{:.7}",
            self.throughput(),
            self.avg_delay(),
            self.avg_jitter(),
            self.score()
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn avg_jitter_is_zero_for_fewer_than_two_sends() {
        let mut m = Metrics::new();
        m.record_send(10, Instant::now());
        assert_eq!(m.avg_jitter(), 0.0);
    }

    #[test]
    fn duration_floors_at_epsilon_when_pathologically_fast() {
        let mut m = Metrics::new();
        let t = Instant::now();
        m.start = Some(t);
        m.end = Some(t);
        assert!(m.duration() >= 1e-6);
    }

    #[test]
    fn throughput_counts_retransmitted_bytes_too() {
        let mut m = Metrics::new();
        m.start_transfer();
        m.record_send(100, Instant::now());
        m.record_send(100, Instant::now()); // a retransmission of the same segment
        m.end_transfer();
        assert_eq!(m.total_bytes, 200);
    }

    #[test]
    fn score_omits_jitter_term_when_jitter_is_zero() {
        let mut m = Metrics::new();
        m.start_transfer();
        let send_time = Instant::now();
        m.record_send(2000, send_time);
        sleep(Duration::from_millis(5));
        m.record_ack(send_time, Instant::now());
        m.end_transfer();
        let expected = m.throughput() / 2000.0 + 35.0 / m.avg_delay();
        assert!((m.score() - expected).abs() < 1e-9);
    }
}
