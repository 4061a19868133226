use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter, used for socket reconnects and for
/// retrying REST fetches (depth snapshots, listen keys, account reads).
///
/// Delay for attempt `n` is `min(max_delay, base * 2^n)` with a random
/// jitter of `±jitter_factor` of that delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
    jitter_factor: f64,
    attempt: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 0.1)
    }
}

impl ExponentialBackoff {
    /// Negative `jitter_factor` is clamped to 0.
    pub fn new(base: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            max_delay,
            jitter_factor: jitter_factor.max(0.0),
            attempt: 0,
        }
    }

    /// Short-fuse schedule for snapshot fetches: the book is unavailable
    /// until one succeeds, so retries start fast and cap early.
    pub fn for_snapshot_retries() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(15), 0.2)
    }

    /// Schedule for account reads (balances, open orders). The dispatch loop
    /// is paused while these run, so the cap stays low.
    pub fn for_fetch_retries() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(2), 0.2)
    }

    /// Returns the delay for the current attempt and advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let capped = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max_delay);

        let spread = capped.as_secs_f64() * self.jitter_factor;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };

        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64((capped.as_secs_f64() + jitter).max(0.0))
    }

    /// Call after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(base_ms: u64, max_ms: u64) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(base_ms),
            Duration::from_millis(max_ms),
            0.0,
        )
    }

    #[test]
    fn test_delay_doubles_each_attempt() {
        let mut backoff = no_jitter(1000, 60_000);
        let delays: Vec<_> = (0..4).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
    }

    #[test]
    fn test_delay_is_capped() {
        let mut backoff = no_jitter(1000, 10_000);
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = no_jitter(1000, 60_000);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(60), 0.2);
        let secs = backoff.next_delay().as_secs_f64();
        assert!((8.0..=12.0).contains(&secs), "delay was {}", secs);
    }

    #[test]
    fn test_negative_jitter_clamped() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), -0.5);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_snapshot_schedule_starts_fast() {
        let mut backoff = ExponentialBackoff::for_snapshot_retries();
        assert!(backoff.next_delay() <= Duration::from_millis(300));
    }

    #[test]
    fn test_fetch_schedule_caps_low() {
        let mut backoff = ExponentialBackoff::for_fetch_retries();
        for _ in 0..10 {
            assert!(backoff.next_delay() <= Duration::from_millis(2400));
        }
    }
}
