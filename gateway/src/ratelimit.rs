//! Per-connection token bucket. The bucket lives inside the session struct
//! and dies with the socket; there is no shared limiter state to clean up.

use std::time::Instant;

use common_match::consts::{RATE_LIMIT_BURST, RATE_LIMIT_REFILL_PER_SEC};

#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    /// Bucket sized for inbound websocket frames.
    pub fn for_frames() -> Self {
        Self::new(RATE_LIMIT_BURST, RATE_LIMIT_REFILL_PER_SEC)
    }

    /// Take one token if available. Refills lazily from elapsed wall time.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    fn try_acquire_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_is_bounded_by_capacity() {
        let mut bucket = TokenBucket::new(30.0, 10.0);
        let start = Instant::now();
        let accepted = (0..100).filter(|_| bucket.try_acquire_at(start)).count();
        assert_eq!(accepted, 30);
    }

    #[test]
    fn refills_at_configured_rate() {
        let mut bucket = TokenBucket::new(30.0, 10.0);
        let start = Instant::now();
        while bucket.try_acquire_at(start) {}

        // One second later exactly ten more frames fit.
        let later = start + Duration::from_secs(1);
        let accepted = (0..100).filter(|_| bucket.try_acquire_at(later)).count();
        assert_eq!(accepted, 10);
    }

    #[test]
    fn refill_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new(30.0, 10.0);
        let start = Instant::now();
        while bucket.try_acquire_at(start) {}

        let much_later = start + Duration::from_secs(3_600);
        let accepted = (0..100).filter(|_| bucket.try_acquire_at(much_later)).count();
        assert_eq!(accepted, 30);
    }
}
