//! RTT / clock-offset estimation over the heartbeat stream, RFC 6298 style:
//! exponentially smoothed RTT, smoothed jitter, and a median-of-samples clock
//! offset that is robust to the occasional delayed ping.

const RTT_ALPHA: f64 = 0.125;
const JITTER_BETA: f64 = 0.25;

/// Offset samples kept for the median. Old samples age out FIFO.
const OFFSET_WINDOW: usize = 32;

#[derive(Debug, Default, Clone)]
pub struct ClockSync {
    srtt: Option<f64>,
    jitter: f64,
    offsets: Vec<i64>,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one measured round-trip time in milliseconds.
    pub fn observe_rtt(&mut self, rtt_ms: f64) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt_ms);
                self.jitter = rtt_ms / 2.0;
            }
            Some(srtt) => {
                self.jitter = (1.0 - JITTER_BETA) * self.jitter + JITTER_BETA * (srtt - rtt_ms).abs();
                self.srtt = Some((1.0 - RTT_ALPHA) * srtt + RTT_ALPHA * rtt_ms);
            }
        }
    }

    /// Feed one clock-offset sample (server clock minus client clock, ms).
    pub fn observe_offset(&mut self, offset_ms: i64) {
        if self.offsets.len() == OFFSET_WINDOW {
            self.offsets.remove(0);
        }
        self.offsets.push(offset_ms);
    }

    pub fn rtt_ms(&self) -> Option<f64> {
        self.srtt
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter
    }

    /// Median of the observed offset samples.
    pub fn offset_ms(&self) -> Option<i64> {
        if self.offsets.is_empty() {
            return None;
        }
        let mut sorted = self.offsets.clone();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            Some((sorted[mid - 1] + sorted[mid]) / 2)
        } else {
            Some(sorted[mid])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_initialises() {
        let mut sync = ClockSync::new();
        sync.observe_rtt(80.0);
        assert_eq!(sync.rtt_ms(), Some(80.0));
        assert_eq!(sync.jitter_ms(), 40.0);
    }

    #[test]
    fn rtt_smooths_toward_new_samples() {
        let mut sync = ClockSync::new();
        sync.observe_rtt(100.0);
        sync.observe_rtt(60.0);
        // 0.875 * 100 + 0.125 * 60
        assert!((sync.rtt_ms().unwrap() - 95.0).abs() < 1e-9);
        assert!(sync.jitter_ms() > 0.0);
    }

    #[test]
    fn offset_is_median_of_samples() {
        let mut sync = ClockSync::new();
        for offset in [5, 7, 500, 6, 4] {
            sync.observe_offset(offset);
        }
        // The one delayed outlier does not drag the estimate.
        assert_eq!(sync.offset_ms(), Some(6));
    }

    #[test]
    fn offset_window_is_bounded() {
        let mut sync = ClockSync::new();
        for i in 0..100 {
            sync.observe_offset(i);
        }
        assert_eq!(sync.offsets.len(), OFFSET_WINDOW);
    }
}
