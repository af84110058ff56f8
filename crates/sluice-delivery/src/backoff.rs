//! Reconnect backoff and log rate limiting.
//!
//! Reconnect delays come from an attempt-indexed table clamped to its last
//! entry, optionally spread with jitter. During long outages the same failure
//! repeats every few seconds, so the supervisor passes each failure through a
//! [`ReconnectLogLimiter`] before logging it.

use std::time::{Duration, Instant};

use rand::Rng;

/// Attempt-indexed reconnect delays.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectBackoff {
    delays: Vec<Duration>,
    jitter_factor: f64,
}

impl ReconnectBackoff {
    /// Creates a backoff from a delay table. An empty table means no delay.
    pub fn new(delays: Vec<Duration>, jitter_factor: f64) -> Self {
        Self { delays, jitter_factor: jitter_factor.clamp(0.0, 1.0) }
    }

    /// Delay before retrying after failed attempt number `attempt`
    /// (one-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = usize::try_from(attempt.saturating_sub(1)).unwrap_or(usize::MAX);
        let base = self
            .delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::ZERO);
        apply_jitter(base, self.jitter_factor)
    }
}

/// Spreads `duration` by up to ±`jitter_factor` of itself.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let spread = duration.as_secs_f64() * jitter_factor;
    let offset = rand::rng().random_range(-spread..=spread);
    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

/// Outcome of passing a reconnect failure through the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDecision {
    /// Log this failure. `suppressed` identical failures were swallowed since
    /// the previous log line.
    Log {
        /// Failures swallowed since the last logged one
        suppressed: u32,
    },
    /// Stay quiet.
    Suppress,
}

/// Suppresses repeats of the same reconnect failure inside a time window.
#[derive(Debug, Clone)]
pub struct ReconnectLogLimiter {
    minimal: bool,
    interval: Duration,
    last: Option<(String, Instant)>,
    suppressed: u32,
}

impl ReconnectLogLimiter {
    /// Creates a limiter. With `minimal` unset every failure is logged.
    pub fn new(minimal: bool, interval: Duration) -> Self {
        Self { minimal, interval, last: None, suppressed: 0 }
    }

    /// Decides whether the failure described by `message` should be logged.
    pub fn check(&mut self, message: &str, now: Instant) -> LogDecision {
        if !self.minimal {
            return LogDecision::Log { suppressed: 0 };
        }

        if let Some((last_message, logged_at)) = &self.last {
            if last_message == message && now.duration_since(*logged_at) < self.interval {
                self.suppressed = self.suppressed.saturating_add(1);
                return LogDecision::Suppress;
            }
        }

        self.last = Some((message.to_string(), now));
        LogDecision::Log { suppressed: std::mem::take(&mut self.suppressed) }
    }

    /// Forgets history after a successful connect.
    pub fn reset(&mut self) {
        self.last = None;
        self.suppressed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ReconnectBackoff {
        ReconnectBackoff::new([1, 2, 5, 5, 10].map(Duration::from_secs).to_vec(), 0.0)
    }

    #[test]
    fn delays_follow_table_then_clamp() {
        let backoff = table();
        let delays: Vec<_> = (1..=8).map(|attempt| backoff.delay_for(attempt).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 5, 5, 10, 10, 10, 10]);
    }

    #[test]
    fn attempt_zero_uses_first_entry() {
        assert_eq!(table().delay_for(0), Duration::from_secs(1));
    }

    #[test]
    fn empty_table_means_no_delay() {
        assert_eq!(ReconnectBackoff::new(Vec::new(), 0.5).delay_for(3), Duration::ZERO);
    }

    #[test]
    fn jitter_stays_within_spread() {
        let backoff = ReconnectBackoff::new(vec![Duration::from_secs(10)], 0.2);
        for _ in 0..200 {
            let delay = backoff.delay_for(1);
            assert!(delay >= Duration::from_millis(7_999) && delay <= Duration::from_millis(12_001));
        }
    }

    #[test]
    fn verbose_limiter_logs_everything() {
        let mut limiter = ReconnectLogLimiter::new(false, Duration::from_secs(60));
        let now = Instant::now();
        assert_eq!(limiter.check("refused", now), LogDecision::Log { suppressed: 0 });
        assert_eq!(limiter.check("refused", now), LogDecision::Log { suppressed: 0 });
    }

    #[test]
    fn minimal_limiter_suppresses_repeats_within_window() {
        let mut limiter = ReconnectLogLimiter::new(true, Duration::from_secs(60));
        let start = Instant::now();

        assert_eq!(limiter.check("refused", start), LogDecision::Log { suppressed: 0 });
        assert_eq!(limiter.check("refused", start + Duration::from_secs(1)), LogDecision::Suppress);
        assert_eq!(limiter.check("refused", start + Duration::from_secs(2)), LogDecision::Suppress);
        assert_eq!(
            limiter.check("refused", start + Duration::from_secs(61)),
            LogDecision::Log { suppressed: 2 }
        );
    }

    #[test]
    fn minimal_limiter_logs_changed_failures() {
        let mut limiter = ReconnectLogLimiter::new(true, Duration::from_secs(60));
        let now = Instant::now();

        limiter.check("refused", now);
        assert_eq!(limiter.check("refused", now), LogDecision::Suppress);
        assert_eq!(limiter.check("auth failed", now), LogDecision::Log { suppressed: 1 });

        limiter.reset();
        assert_eq!(limiter.check("auth failed", now), LogDecision::Log { suppressed: 0 });
    }
}
