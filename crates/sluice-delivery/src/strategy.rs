//! Delivery strategy contract and construction.

use std::sync::Arc;

use async_trait::async_trait;
use sluice_core::{
    BrokerDriver, Clock, CoreError, Domain, EndpointFactory, EventHandler, ExceptionListener,
    TaskScheduler, TransactionManager,
};
use tracing::debug;

use crate::{
    concurrent::ConcurrentPullDelivery,
    config::{ActivationConfig, DeliveryMode},
    coordinator::BatchCoordinator,
    endpoint::EndpointLeaser,
    error::{DeliveryError, Result},
    poison::PoisonMessageTracker,
    polled::PolledWorkerDelivery,
    stats::DeliveryStats,
    transaction::{BatchSettings, MoveConnection, TransactionalDelivery},
};

/// Receives failures that require the supervisor's attention.
///
/// Both methods must return promptly; they are called from delivery tasks
/// and broker callbacks.
pub trait DistressSink: Send + Sync {
    /// Reports a failure that invalidates the current connection.
    fn distress(&self, error: DeliveryError);

    /// Asks for the activation to stop, on behalf of a callback running
    /// inside its own delivery.
    fn stop_by_endpoint_request(&self, reason: String);
}

/// Pulls messages from the broker and dispatches them to endpoints.
///
/// An instance is started at most once and deactivated exactly once before
/// it is dropped.
#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Connects to the broker and begins delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if any part of the connection could not be set up.
    /// The caller must still call [`deactivate`](Self::deactivate).
    async fn start(&self) -> Result<()>;

    /// Stops delivery and waits until no delivery is in flight, then closes
    /// every broker resource.
    async fn deactivate(&self);
}

/// External systems an activation works against.
#[derive(Clone)]
pub struct Collaborators {
    /// Broker client.
    pub driver: Arc<dyn BrokerDriver>,
    /// Endpoint factory of the hosting container.
    pub endpoints: Arc<dyn EndpointFactory>,
    /// Transaction manager, required for two-phase delivery.
    pub transactions: Option<Arc<dyn TransactionManager>>,
    /// Host scheduler for concurrent-pull work.
    pub scheduler: Arc<dyn TaskScheduler>,
    /// Lifecycle event sink.
    pub events: Arc<dyn EventHandler>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Everything a strategy instance needs, shared across connect attempts.
#[derive(Clone)]
pub struct StrategyContext {
    /// Validated configuration.
    pub config: Arc<ActivationConfig>,
    /// External collaborators.
    pub collaborators: Collaborators,
    /// Poison tracker shared by every attempt of the activation.
    pub tracker: Arc<PoisonMessageTracker>,
    /// Delivery counters.
    pub stats: Arc<DeliveryStats>,
    /// Where failures are reported.
    pub sink: Arc<dyn DistressSink>,
}

impl StrategyContext {
    /// Resolves the messaging domain: two-phase only when the broker
    /// supports it, the endpoint requires it and a transaction manager is
    /// present.
    pub fn resolve_domain(&self) -> Domain {
        let two_phase = self.collaborators.driver.capabilities().two_phase
            && self.collaborators.endpoints.is_delivery_transacted()
            && self.collaborators.transactions.is_some();
        Domain::resolve(self.config.destination_type, two_phase)
    }

    pub(crate) fn leaser(&self) -> EndpointLeaser {
        EndpointLeaser::new(
            self.collaborators.endpoints.clone(),
            self.stats.clone(),
            self.config.same_rm_policy,
            self.config.endpoint_creation_timeout(),
            self.config.endpoint_retry_delay(),
            self.collaborators.clock.clone(),
        )
    }

    pub(crate) fn delivery_core(&self, domain: Domain) -> TransactionalDelivery {
        TransactionalDelivery::new(
            domain,
            self.config.destination(),
            BatchSettings {
                batch_size: self.config.batch_size,
                coordinator: BatchCoordinator::new(self.config.hold_until_ack),
                poll_interval: self.config.shutdown_poll_interval(),
            },
            self.tracker.clone(),
            self.stats.clone(),
            self.collaborators.transactions.clone(),
            self.collaborators.clock.clone(),
        )
    }

    pub(crate) fn move_connection(&self) -> MoveConnection {
        MoveConnection::new(
            self.collaborators.driver.clone(),
            self.config.connect_options(),
            self.config.delayed_move_commit,
        )
    }

    pub(crate) fn exception_listener(&self) -> Arc<dyn ExceptionListener> {
        Arc::new(DistressListener { sink: self.sink.clone() })
    }
}

/// Forwards asynchronous broker failures to the supervisor.
struct DistressListener {
    sink: Arc<dyn DistressSink>,
}

impl ExceptionListener for DistressListener {
    fn on_exception(&self, error: CoreError) {
        debug!(error = %error, "broker reported connection failure");
        self.sink.distress(DeliveryError::connect(error.to_string()));
    }
}

/// Builds the strategy for the configured delivery mode.
///
/// Serial, multi-receiver and sync-poll modes all run polled workers and
/// differ only in the number of pollers.
pub fn create_strategy(context: StrategyContext) -> Arc<dyn DeliveryStrategy> {
    match context.config.delivery_mode {
        DeliveryMode::ConcurrentPull => Arc::new(ConcurrentPullDelivery::new(context)),
        DeliveryMode::Serial | DeliveryMode::MultiReceiver | DeliveryMode::SyncPoll => {
            Arc::new(PolledWorkerDelivery::new(context))
        },
    }
}

pub(crate) fn to_core_error(error: &DeliveryError) -> CoreError {
    if error.is_shutdown() {
        CoreError::ShuttingDown
    } else {
        CoreError::broker(error.to_string())
    }
}
