//! Time source abstraction.
//!
//! Backoff tables, endpoint-creation deadlines and poison-message delays all
//! read time through [`Clock`] so tests can substitute a manual clock.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};

/// Source of monotonic and wall-clock time.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for deadlines.
    fn now(&self) -> Instant;

    /// Wall-clock time for timestamps.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Suspends the caller for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Clock backed by the system and the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Creates a system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually advanced clock.
///
/// `sleep` advances the clock by the requested duration and yields once, so
/// retry loops run to completion without real waiting.
#[derive(Debug, Clone)]
pub struct ManualClock {
    offset_ns: Arc<AtomicU64>,
    origin: Instant,
    wall_origin: DateTime<Utc>,
}

impl ManualClock {
    /// Creates a clock anchored at the current time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a clock whose wall time starts at `wall_origin`.
    pub fn starting_at(wall_origin: DateTime<Utc>) -> Self {
        Self { offset_ns: Arc::new(AtomicU64::new(0)), origin: Instant::now(), wall_origin }
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.offset_ns.fetch_add(ns, Ordering::AcqRel);
    }

    /// Total time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::Acquire))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.elapsed())
            .ok()
            .and_then(|elapsed| self.wall_origin.checked_add_signed(elapsed))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn manual_clock_moves_both_time_bases() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("valid date");
        let clock = ManualClock::starting_at(start);
        let before = clock.now();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now().duration_since(before), Duration::from_secs(90));
        assert_eq!(clock.now_utc(), start + chrono::Duration::seconds(90));
    }

    #[tokio::test]
    async fn manual_sleep_returns_immediately() {
        let clock = ManualClock::new();
        let started = Instant::now();

        clock.sleep(Duration::from_secs(3600)).await;

        assert_eq!(clock.elapsed(), Duration::from_secs(3600));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
