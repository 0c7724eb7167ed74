//! Clock offset estimation between a follower and its host.
//!
//! A follower sends `clockPing { t1 }`, the host answers
//! `clockPong { t1, serverNow }` and the follower, at local time `t4`, derives
//!
//! ```text
//! rtt    = t4 - t1
//! offset = t4 - (serverNow + rtt / 2)        // local - host
//! ```
//!
//! Samples go into a small ring buffer. Once enough samples exist, a sample
//! whose RTT is far above the buffer's median RTT is discarded: a congested
//! probe says little about the clocks. The offset handed to the rest of the
//! engine is the median of the buffered offsets, never the latest sample.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ClockConfig;

/// Wall-clock source in milliseconds.
pub trait TimeSource: Send + Sync + 'static {
    fn now_ms(&self) -> i64;
}

/// Milliseconds since the Unix epoch, advanced by tokio's monotonic clock.
///
/// Anchoring once and then counting with [`tokio::time::Instant`] keeps the
/// clock monotonic and lets tests pause and advance it.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    anchor_ms: i64,
    started: tokio::time::Instant,
    skew_ms: i64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        let anchor_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Self::anchored(anchor_ms)
    }

    /// A clock reading `anchor_ms` right now.
    pub fn anchored(anchor_ms: i64) -> Self {
        Self {
            anchor_ms,
            started: tokio::time::Instant::now(),
            skew_ms: 0,
        }
    }

    /// Shift every reading by `skew_ms`.
    #[must_use]
    pub fn with_skew(mut self, skew_ms: i64) -> Self {
        self.skew_ms = skew_ms;
        self
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.anchor_ms
            .saturating_add(elapsed)
            .saturating_add(self.skew_ms)
    }
}

/// One accepted probe/echo exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSample {
    pub rtt_ms: f64,
    pub offset_ms: f64,
    /// Local time the reply arrived.
    pub at_ms: i64,
}

/// What happened to a measured sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    Accepted { offset_ms: f64 },
    Rejected { rtt_ms: f64, median_rtt_ms: f64 },
}

/// Follower-side offset estimator.
#[derive(Debug, Clone)]
pub struct ClockSync {
    capacity: usize,
    outlier_factor: f64,
    min_samples: usize,
    samples: VecDeque<ClockSample>,
    baseline: Option<f64>,
    effective: Option<f64>,
}

impl ClockSync {
    pub fn new(config: &ClockConfig) -> Self {
        let capacity = config.buffer_size.max(1);
        Self {
            capacity,
            outlier_factor: config.outlier_factor,
            min_samples: config.min_samples.max(1),
            samples: VecDeque::with_capacity(capacity),
            baseline: None,
            effective: None,
        }
    }

    /// Seed the estimate from the host's onboarding prime.
    ///
    /// Only used until the first real sample is accepted.
    pub fn prime(&mut self, server_now: i64, latency_ms: f64, local_now: i64) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let baseline = local_now as f64 - (server_now as f64 + latency_ms);
        self.baseline = Some(baseline);
        baseline
    }

    /// Feed one completed exchange.
    #[allow(clippy::cast_precision_loss)]
    pub fn record(&mut self, t1: i64, server_now: i64, t4: i64) -> SampleOutcome {
        let rtt_ms = t4.saturating_sub(t1).max(0) as f64;
        let offset_ms = t4 as f64 - (server_now as f64 + rtt_ms / 2.0);

        if self.samples.len() >= self.min_samples {
            if let Some(median_rtt_ms) = self.median_rtt() {
                if rtt_ms > self.outlier_factor * median_rtt_ms {
                    return SampleOutcome::Rejected {
                        rtt_ms,
                        median_rtt_ms,
                    };
                }
            }
        }

        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(ClockSample {
            rtt_ms,
            offset_ms,
            at_ms: t4,
        });
        let effective = median(self.samples.iter().map(|s| s.offset_ms)).unwrap_or(offset_ms);
        self.effective = Some(effective);
        SampleOutcome::Accepted {
            offset_ms: effective,
        }
    }

    /// Current `local - host` estimate, if any.
    pub fn offset_ms(&self) -> Option<f64> {
        self.effective.or(self.baseline)
    }

    pub fn median_rtt(&self) -> Option<f64> {
        median(self.samples.iter().map(|s| s.rtt_ms))
    }

    pub fn samples(&self) -> impl Iterator<Item = &ClockSample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Translate an instant on the host clock onto the local clock.
    #[allow(clippy::cast_possible_truncation)]
    pub fn to_local(&self, host_ms: i64) -> i64 {
        host_ms.saturating_add(self.offset_ms().unwrap_or(0.0).round() as i64)
    }
}

/// Median of a set of values; the mean of the two middle values when even.
pub fn median(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut sorted: Vec<f64> = values.into_iter().collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync() -> ClockSync {
        ClockSync::new(&ClockConfig::default())
    }

    /// Exchange against a host whose clock is `local - offset`.
    fn exchange(clock: &mut ClockSync, t1: i64, rtt: i64, offset: i64) -> SampleOutcome {
        let t4 = t1 + rtt;
        let server_now = t1 + rtt / 2 - offset;
        clock.record(t1, server_now, t4)
    }

    #[test]
    fn median_handles_odd_and_even() {
        assert_eq!(median([3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median([4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(std::iter::empty()), None);
    }

    #[test]
    fn single_sample_sets_offset() {
        let mut clock = sync();
        assert_eq!(clock.offset_ms(), None);
        let outcome = exchange(&mut clock, 1_000, 40, 250);
        assert_eq!(outcome, SampleOutcome::Accepted { offset_ms: 250.0 });
        assert_eq!(clock.to_local(10_000), 10_250);
        assert_eq!(clock.to_local(i64::MAX), i64::MAX);
    }

    #[test]
    fn zero_min_samples_still_accepts_first_sample() {
        let mut clock = ClockSync::new(&ClockConfig {
            min_samples: 0,
            ..ClockConfig::default()
        });
        assert!(matches!(
            exchange(&mut clock, 0, 30, 100),
            SampleOutcome::Accepted { .. }
        ));
        assert!(matches!(
            exchange(&mut clock, 100, 40, 100),
            SampleOutcome::Accepted { .. }
        ));
        assert_eq!(clock.offset_ms(), Some(100.0));
    }

    #[test]
    fn effective_offset_is_median_not_latest() {
        let mut clock = sync();
        exchange(&mut clock, 0, 20, 100);
        exchange(&mut clock, 100, 20, 300);
        exchange(&mut clock, 200, 20, 110);
        exchange(&mut clock, 300, 20, 105);
        // offsets {100, 300, 110, 105} -> (105 + 110) / 2
        assert_eq!(clock.offset_ms(), Some(107.5));
    }

    #[test]
    fn outliers_are_rejected_once_three_samples_exist() {
        let mut clock = sync();
        // Before three samples, even a slow probe counts.
        exchange(&mut clock, 0, 20, 100);
        exchange(&mut clock, 100, 200, 100);
        exchange(&mut clock, 200, 20, 100);
        assert_eq!(clock.len(), 3);
        assert_eq!(clock.median_rtt(), Some(20.0));

        let before = clock.offset_ms();
        let outcome = exchange(&mut clock, 300, 51, 900);
        assert_eq!(
            outcome,
            SampleOutcome::Rejected {
                rtt_ms: 51.0,
                median_rtt_ms: 20.0
            }
        );
        assert_eq!(clock.len(), 3);
        assert_eq!(clock.offset_ms(), before);

        // Exactly 2.5x the median is still accepted.
        assert!(matches!(
            exchange(&mut clock, 400, 50, 100),
            SampleOutcome::Accepted { .. }
        ));
    }

    #[test]
    fn buffer_evicts_oldest() {
        let mut clock = sync();
        for i in 0..10 {
            exchange(&mut clock, i * 1_000, 20, i * 10);
        }
        assert_eq!(clock.len(), 7);
        let offsets: Vec<f64> = clock.samples().map(|s| s.offset_ms).collect();
        assert_eq!(offsets, vec![30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0]);
        assert_eq!(clock.offset_ms(), Some(60.0));
    }

    #[test]
    fn prime_is_a_fallback_until_first_sample() {
        let mut clock = sync();
        let baseline = clock.prime(5_000, 25.0, 8_000);
        assert!((baseline - 2_975.0).abs() < f64::EPSILON);
        assert_eq!(clock.offset_ms(), Some(2_975.0));

        exchange(&mut clock, 9_000, 10, 3_000);
        assert_eq!(clock.offset_ms(), Some(3_000.0));
    }

    #[tokio::test(start_paused = true)]
    async fn monotonic_clock_follows_tokio_time() {
        let clock = MonotonicClock::anchored(1_000).with_skew(500);
        assert_eq!(clock.now_ms(), 1_500);
        tokio::time::advance(std::time::Duration::from_millis(250)).await;
        assert_eq!(clock.now_ms(), 1_750);
    }
}
