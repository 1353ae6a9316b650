use std::time::Instant;

/// Token-bucket rate limiter for one UDP endpoint. The bucket holds bits;
/// one Mb/s conveniently refills one bit per microsecond. A send is
/// admitted whenever the bucket is non-negative, and `record_send` may
/// drive it negative, which is what paces bursts.
pub struct Pacer {
    rate_mbps: u64,
    bucket_bits: i64,
    burst_bits: i64,
    last_refill: Instant,
}

impl Pacer {
    /// Burst window the bucket can accumulate while idle
    const BURST_MICROS: u64 = 10_000;

    pub fn new(rate_mbps: u64, now: Instant) -> Self {
        let burst_bits = (rate_mbps * Self::BURST_MICROS) as i64;
        Self {
            rate_mbps,
            bucket_bits: burst_bits,
            burst_bits,
            last_refill: now,
        }
    }

    pub fn rate_mbps(&self) -> u64 {
        self.rate_mbps
    }

    pub fn set_rate(&mut self, rate_mbps: u64, now: Instant) {
        self.refill(now);
        self.rate_mbps = rate_mbps;
        self.burst_bits = (rate_mbps * Self::BURST_MICROS) as i64;
        self.bucket_bits = self.bucket_bits.min(self.burst_bits);
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_us = now.saturating_duration_since(self.last_refill).as_micros() as i64;
        if elapsed_us == 0 {
            return;
        }
        self.last_refill = now;
        self.bucket_bits = self
            .bucket_bits
            .saturating_add(elapsed_us.saturating_mul(self.rate_mbps as i64))
            .min(self.burst_bits);
    }

    pub fn within_pace(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.bucket_bits >= 0
    }

    /// Microseconds until the bucket refills to zero; 0 when already within
    /// pace. The event loop turns this into its poll timeout.
    pub fn micros_ahead_of_pace(&mut self, now: Instant) -> i64 {
        self.refill(now);
        if self.bucket_bits >= 0 || self.rate_mbps == 0 {
            return 0;
        }
        let deficit = -self.bucket_bits;
        (deficit + self.rate_mbps as i64 - 1) / self.rate_mbps as i64
    }

    pub fn record_send(&mut self, bytes: usize) {
        self.bucket_bits -= (bytes as i64) * 8;
    }
}
