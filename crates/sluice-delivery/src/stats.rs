//! Delivery counters exposed through the management surface.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::poison::PoisonStatsSnapshot;

/// How one message delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    /// The callback ran and succeeded.
    Delivered,
    /// The message was moved or deleted without calling the endpoint.
    Bypassed,
    /// The callback or the poison action failed.
    Failed,
}

/// Counters shared by every strategy instance of an activation.
#[derive(Debug)]
pub struct DeliveryStats {
    endpoints_active: AtomicU64,
    endpoints_created: AtomicU64,
    endpoints_released: AtomicU64,
    messages_started: AtomicU64,
    messages_delivered: AtomicU64,
    messages_bypassed: AtomicU64,
    messages_failed: AtomicU64,
    since: Mutex<DateTime<Utc>>,
}

impl Default for DeliveryStats {
    fn default() -> Self {
        Self {
            endpoints_active: AtomicU64::new(0),
            endpoints_created: AtomicU64::new(0),
            endpoints_released: AtomicU64::new(0),
            messages_started: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            messages_bypassed: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            since: Mutex::new(Utc::now()),
        }
    }
}

impl DeliveryStats {
    pub(crate) fn endpoint_created(&self) {
        self.endpoints_created.fetch_add(1, Ordering::Relaxed);
        self.endpoints_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn endpoint_released(&self) {
        self.endpoints_released.fetch_add(1, Ordering::Relaxed);
        let _ = self.endpoints_active.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
            Some(n.saturating_sub(1))
        });
    }

    pub(crate) fn delivery_started(&self) {
        self.messages_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn delivery_ended(&self, result: DeliveryResult) {
        let counter = match result {
            DeliveryResult::Delivered => &self.messages_delivered,
            DeliveryResult::Bypassed => &self.messages_bypassed,
            DeliveryResult::Failed => &self.messages_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Endpoints currently leased.
    pub fn endpoints_active(&self) -> u64 {
        self.endpoints_active.load(Ordering::Relaxed)
    }

    /// Returns the current counter values together with poison counters.
    pub fn snapshot(&self, poison: PoisonStatsSnapshot) -> StatsSnapshot {
        StatsSnapshot {
            endpoints_active: self.endpoints_active.load(Ordering::Relaxed),
            endpoints_created: self.endpoints_created.load(Ordering::Relaxed),
            endpoints_released: self.endpoints_released.load(Ordering::Relaxed),
            messages_started: self.messages_started.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            messages_bypassed: self.messages_bypassed.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            poison,
            since: *self.since.lock(),
        }
    }

    /// Zeroes the cumulative counters. The active-endpoint gauge is kept.
    pub fn reset(&self, now: DateTime<Utc>) {
        self.endpoints_created.store(0, Ordering::Relaxed);
        self.endpoints_released.store(0, Ordering::Relaxed);
        self.messages_started.store(0, Ordering::Relaxed);
        self.messages_delivered.store(0, Ordering::Relaxed);
        self.messages_bypassed.store(0, Ordering::Relaxed);
        self.messages_failed.store(0, Ordering::Relaxed);
        *self.since.lock() = now;
    }
}

/// Point-in-time statistics for one activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Endpoints currently leased.
    pub endpoints_active: u64,
    /// Endpoints created since the last reset.
    pub endpoints_created: u64,
    /// Endpoints released since the last reset.
    pub endpoints_released: u64,
    /// Deliveries started.
    pub messages_started: u64,
    /// Deliveries that reached the callback successfully.
    pub messages_delivered: u64,
    /// Deliveries consumed by a move or delete.
    pub messages_bypassed: u64,
    /// Deliveries that failed.
    pub messages_failed: u64,
    /// Poison-message counters.
    pub poison: PoisonStatsSnapshot,
    /// When counting started.
    pub since: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_gauge_never_underflows() {
        let stats = DeliveryStats::default();
        stats.endpoint_released();
        stats.endpoint_created();

        let snapshot = stats.snapshot(PoisonStatsSnapshot::default());
        assert_eq!(snapshot.endpoints_active, 1);
        assert_eq!(snapshot.endpoints_released, 1);
    }

    #[test]
    fn reset_keeps_active_gauge() {
        let stats = DeliveryStats::default();
        stats.endpoint_created();
        stats.delivery_started();
        stats.delivery_ended(DeliveryResult::Failed);

        let now = Utc::now();
        stats.reset(now);
        let snapshot = stats.snapshot(PoisonStatsSnapshot::default());

        assert_eq!(snapshot.endpoints_active, 1);
        assert_eq!(snapshot.messages_failed, 0);
        assert_eq!(snapshot.messages_started, 0);
        assert_eq!(snapshot.since, now);
    }
}
