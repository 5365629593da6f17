use std::time::Instant;

// ---------------------------------------------------------------------------
// TokenBucket
// ---------------------------------------------------------------------------

/// Per-client token bucket, denominated in bits.
///
/// Tokens refill in proportion to elapsed wall time at the configured rate.
/// Capacity is one second's worth of tokens so a long idle period cannot
/// build up an unbounded burst allowance.  A fresh bucket starts empty; the
/// first grant is paid for by the refill since construction.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    // ---
    /// Bits per second ceiling; also the bucket capacity in bits.
    rate_bits_per_sec: u64,

    /// Available tokens (bits), fractional to avoid rounding drift.
    tokens: f64,

    last_refill: Instant,
}

// ---

impl TokenBucket {
    // ---
    pub fn new(rate_bits_per_sec: u64) -> Self {
        Self::new_at(rate_bits_per_sec, Instant::now())
    }

    pub fn new_at(rate_bits_per_sec: u64, now: Instant) -> Self {
        // ---
        Self {
            rate_bits_per_sec,
            tokens: 0.0,
            last_refill: now,
        }
    }

    // ---

    pub fn capacity_bits(&self) -> f64 {
        self.rate_bits_per_sec as f64
    }

    // ---

    /// Refill from time elapsed since the previous refill, capped at
    /// capacity.
    pub fn refill(&mut self, now: Instant) {
        // ---
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rate_bits_per_sec as f64).min(self.capacity_bits());
    }

    // ---

    /// Remaining tokens in bits.  May be fractional.
    pub fn tokens_bits(&self) -> f64 {
        self.tokens
    }

    /// Whole bytes that may be sent right now.
    pub fn available_bytes(&self) -> u64 {
        // ---
        if self.tokens <= 0.0 {
            return 0;
        }
        (self.tokens / 8.0).floor() as u64
    }

    // ---

    /// Charge `bytes` that were actually delivered.
    ///
    /// Never drops below zero: callers only charge what `available_bytes`
    /// granted, so a negative balance would mean double charging.
    pub fn consume_bytes(&mut self, bytes: u64) {
        self.tokens = (self.tokens - (bytes as f64) * 8.0).max(0.0);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::time::{Duration, Instant};

    use super::TokenBucket;

    /// Bucket starts empty; refill is proportional to elapsed time.
    #[test]
    fn starts_empty_and_refills_proportionally() {
        // ---
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new_at(8_000_000, t0); // 1 MB/s

        bucket.refill(t0);
        assert_eq!(bucket.available_bytes(), 0, "fresh bucket grants nothing");

        bucket.refill(t0 + Duration::from_millis(100));
        assert_eq!(bucket.available_bytes(), 100_000);
    }

    // ---

    /// Burst accumulation is capped at one second's worth.
    #[test]
    fn caps_burst_at_one_second() {
        // ---
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new_at(4_000_000, t0);

        bucket.refill(t0 + Duration::from_secs(10));
        assert_eq!(bucket.tokens_bits(), 4_000_000.0);
        assert_eq!(bucket.available_bytes(), 500_000);
    }

    // ---

    #[test]
    fn consume_charges_eight_bits_per_byte_and_floors_at_zero() {
        // ---
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new_at(8_000, t0);
        bucket.refill(t0 + Duration::from_secs(1));

        bucket.consume_bytes(600);
        assert_eq!(bucket.tokens_bits(), 3_200.0);

        bucket.consume_bytes(10_000);
        assert_eq!(bucket.tokens_bits(), 0.0);
        assert_eq!(bucket.available_bytes(), 0);
    }
}
