//! Shared setup for delivery integration tests.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use sluice_core::{Destination, SystemClock, TaskScheduler, TokioScheduler};
use sluice_delivery::{
    poison::PoisonMessageTracker, ActivationConfig, Collaborators, ConnectionSupervisor,
    DeliveryError, DeliveryMode, DeliveryStats, DistressSink, StrategyContext,
};
use sluice_testing::{MemoryBroker, MockContainer, RecordingEventHandler};

pub fn orders() -> Destination {
    Destination::queue("orders")
}

/// Configuration with every timer shortened for tests.
pub fn fast_config(mode: DeliveryMode) -> ActivationConfig {
    ActivationConfig {
        delivery_mode: mode,
        endpoint_pool_max_size: 2,
        reconnect_delays_ms: vec![20, 40],
        connect_grace_period_ms: 20,
        receive_timeout_ms: 50,
        batch_receive_timeout_ms: 10,
        endpoint_creation_timeout_ms: 2_000,
        endpoint_retry_delay_ms: 20,
        shutdown_poll_interval_ms: 20,
        ..ActivationConfig::for_destination(orders())
    }
}

/// Distress sink that only records what it receives.
#[derive(Default)]
pub struct RecordingSink {
    pub distress: Mutex<Vec<DeliveryError>>,
    pub stop_requests: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn distress_count(&self) -> usize {
        self.distress.lock().len()
    }
}

impl DistressSink for RecordingSink {
    fn distress(&self, error: DeliveryError) {
        self.distress.lock().push(error);
    }

    fn stop_by_endpoint_request(&self, reason: String) {
        self.stop_requests.lock().push(reason);
    }
}

/// Broker, container and event recorder wired together.
pub struct Harness {
    pub broker: MemoryBroker,
    pub container: MockContainer,
    pub events: Arc<RecordingEventHandler>,
    pub two_phase: bool,
}

impl Harness {
    /// Local transactions only.
    pub fn local() -> Self {
        Self {
            broker: MemoryBroker::new(),
            container: MockContainer::new(),
            events: Arc::new(RecordingEventHandler::new()),
            two_phase: false,
        }
    }

    /// Two-phase broker with a transacted container.
    pub fn two_phase() -> Self {
        Self {
            broker: MemoryBroker::two_phase(),
            container: MockContainer::transacted(),
            events: Arc::new(RecordingEventHandler::new()),
            two_phase: true,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        self.collaborators_with(Arc::new(TokioScheduler::current().expect("inside runtime")))
    }

    pub fn collaborators_with(&self, scheduler: Arc<dyn TaskScheduler>) -> Collaborators {
        Collaborators {
            driver: Arc::new(self.broker.clone()),
            endpoints: Arc::new(self.container.clone()),
            transactions: self
                .two_phase
                .then(|| Arc::new(self.container.clone()) as Arc<dyn sluice_core::TransactionManager>),
            scheduler,
            events: self.events.clone(),
            clock: Arc::new(SystemClock::new()),
        }
    }

    pub fn supervisor(&self, config: ActivationConfig) -> ConnectionSupervisor {
        ConnectionSupervisor::new(config, self.collaborators())
    }

    /// Strategy context reporting into `sink` instead of a supervisor.
    pub fn context(
        &self,
        config: ActivationConfig,
        collaborators: Collaborators,
        sink: Arc<RecordingSink>,
    ) -> StrategyContext {
        let tracker = Arc::new(PoisonMessageTracker::new(
            config.destination(),
            config.action_table().expect("valid action table"),
            config.tracker_settings(),
            collaborators.clock.clone(),
            collaborators.events.clone(),
        ));
        StrategyContext {
            config: Arc::new(config),
            collaborators,
            tracker,
            stats: Arc::new(DeliveryStats::default()),
            sink,
        }
    }
}

/// Polls `condition` every few milliseconds until it holds.
///
/// Panics after `timeout`.
pub async fn eventually(timeout: Duration, condition: impl Fn() -> bool) {
    let result = tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not met within {timeout:?}");
}
