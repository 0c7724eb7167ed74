//! Exponential reconnect backoff.

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Delay schedule for follower reconnection attempts.
///
/// The n-th failure waits `base * multiplier^n`, capped at `max`. There is no
/// attempt limit; a successful connection resets the schedule.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: f64,
    multiplier: f64,
    max_ms: f64,
    attempt: u32,
}

impl Backoff {
    #[allow(clippy::cast_precision_loss)]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            base_ms: config.base_delay_ms as f64,
            multiplier: config.multiplier.max(1.0),
            max_ms: config.max_delay_ms as f64,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; advances the schedule.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn next_delay(&mut self) -> Duration {
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let raw = self.base_ms * self.multiplier.powi(exponent);
        let ms = if raw.is_finite() {
            raw.min(self.max_ms)
        } else {
            self.max_ms
        };
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(ms.max(0.0).round() as u64)
    }

    /// Failures since the last success.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> Backoff {
        Backoff::new(&ReconnectConfig::default())
    }

    #[test]
    fn grows_by_multiplier() {
        let mut b = backoff();
        let delays: Vec<u64> = (0..4)
            .map(|_| u64::try_from(b.next_delay().as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![1000, 1500, 2250, 3375]);
        assert_eq!(b.attempt(), 4);
    }

    #[test]
    fn caps_at_max_and_never_gives_up() {
        let mut b = backoff();
        let mut last = Duration::ZERO;
        for _ in 0..200 {
            last = b.next_delay();
            assert!(last <= Duration::from_secs(60));
        }
        assert_eq!(last, Duration::from_secs(60));
    }

    #[test]
    fn reset_starts_over() {
        let mut b = backoff();
        for _ in 0..5 {
            b.next_delay();
        }
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn honours_custom_schedule() {
        let mut b = Backoff::new(&ReconnectConfig {
            base_delay_ms: 200,
            multiplier: 2.0,
            max_delay_ms: 1000,
            ..ReconnectConfig::default()
        });
        let delays: Vec<Duration> = (0..5).map(|_| b.next_delay()).collect();
        assert_eq!(
            delays,
            [200, 400, 800, 1000, 1000]
                .into_iter()
                .map(Duration::from_millis)
                .collect::<Vec<_>>()
        );
    }
}
