//! Transactional delivery of messages to a leased endpoint.
//!
//! A batch is delivered inside one [`DeliveryWindow`]. When the activation
//! demarcates transactions the window is opened with `before_delivery` and
//! closed with `after_delivery`, leaving commit to the container. Otherwise
//! the broker session is committed or rolled back directly once the window
//! closes.
//!
//! Each attempt gets a fresh window and returns a [`BatchOutcome`] by value.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use sluice_core::{
    properties, BrokerConnection, BrokerDriver, BrokerSession, Clock, ConnectOptions, ContextId,
    Destination, Domain, Message, MessageProducer, PropertyValue, TransactionManager,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    coordinator::{AckLatch, AckWait, BatchCoordinator},
    endpoint::EndpointHandle,
    error::DeliveryError,
    poison::{MessageMover, PoisonMessageTracker},
    stats::{DeliveryResult, DeliveryStats},
};

/// How the broker session is finished after a window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The container completed the transaction in `after_delivery`.
    ContainerManaged,
    /// Commit the session.
    Commit,
    /// Roll the session back so the broker redelivers.
    Rollback,
}

/// Accumulates the state of one delivery attempt.
#[derive(Debug)]
pub struct DeliveryWindow {
    context: ContextId,
    demarcated: bool,
    opened: bool,
    callbacks: usize,
    delivered: usize,
    bypassed: usize,
    rollback_only: bool,
    discard_endpoint: bool,
    failure: Option<DeliveryError>,
    stop_request: Option<String>,
}

impl DeliveryWindow {
    fn new(demarcated: bool) -> Self {
        Self {
            context: ContextId::new(),
            demarcated,
            opened: false,
            callbacks: 0,
            delivered: 0,
            bypassed: 0,
            rollback_only: false,
            discard_endpoint: false,
            failure: None,
            stop_request: None,
        }
    }

    /// Transaction context of this attempt.
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Whether more messages may be delivered in this window.
    pub fn accepts_deliveries(&self) -> bool {
        self.opened && !self.rollback_only
    }

    /// Messages handed to the endpoint callback.
    pub fn delivered(&self) -> usize {
        self.delivered
    }

    /// Messages consumed by a move or delete.
    pub fn bypassed(&self) -> usize {
        self.bypassed
    }

    fn record_failure(&mut self, error: DeliveryError) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }
}

/// Result of delivering one batch.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Messages received for the batch.
    pub received: usize,
    /// Messages handed to the endpoint callback.
    pub delivered: usize,
    /// Messages consumed by a move or delete.
    pub bypassed: usize,
    /// Whether the batch's work was committed.
    pub committed: bool,
    /// The endpoint must not be reused.
    pub discard_endpoint: bool,
    /// First failure of the attempt.
    pub failure: Option<DeliveryError>,
    /// Failure finishing the broker session; the caller should treat the
    /// connection as broken.
    pub session_failure: Option<DeliveryError>,
    /// Reason given by a callback asking to stop the activation.
    pub stop_request: Option<String>,
}

/// Timing and batching knobs for [`TransactionalDelivery`].
#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Maximum messages per batch.
    pub batch_size: usize,
    /// Completion coordinator.
    pub coordinator: BatchCoordinator,
    /// Re-check interval while waiting for acknowledgements.
    pub poll_interval: Duration,
}

/// Delivers messages to endpoints under transactional control.
pub struct TransactionalDelivery {
    domain: Domain,
    destination: Destination,
    settings: BatchSettings,
    tracker: Arc<PoisonMessageTracker>,
    stats: Arc<DeliveryStats>,
    transactions: Option<Arc<dyn TransactionManager>>,
    clock: Arc<dyn Clock>,
}

impl TransactionalDelivery {
    /// Creates the delivery core for one strategy instance.
    pub fn new(
        domain: Domain,
        destination: Destination,
        settings: BatchSettings,
        tracker: Arc<PoisonMessageTracker>,
        stats: Arc<DeliveryStats>,
        transactions: Option<Arc<dyn TransactionManager>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { domain, destination, settings, tracker, stats, transactions, clock }
    }

    /// Resolved messaging domain.
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Maximum messages per batch.
    pub fn batch_size(&self) -> usize {
        self.settings.batch_size
    }

    fn demarcated(&self) -> bool {
        self.domain.is_two_phase() && self.transactions.is_some()
    }

    /// Delivers `messages` as one transaction and settles the session.
    pub async fn deliver_batch(
        &self,
        endpoint: &EndpointHandle,
        session: &Arc<dyn BrokerSession>,
        mover: &mut MoveConnection,
        messages: Vec<Message>,
        stopping: &CancellationToken,
    ) -> BatchOutcome {
        if messages.is_empty() {
            return BatchOutcome::default();
        }
        let received = messages.len();
        let batching = self.settings.batch_size > 1;
        let latch = self.settings.coordinator.begin_batch();

        let mut window = self.begin(endpoint).await;
        for (index, mut message) in messages.into_iter().enumerate() {
            if !window.accepts_deliveries() {
                debug!(remaining = received - index, "ending batch early");
                break;
            }
            if batching {
                message.set_property(properties::BATCH_INDEX, as_property_int(index));
                message.set_property(properties::BATCH_SIZE, as_property_int(received));
            }
            if let Some(latch) = &latch {
                message.set_acknowledger(latch.token());
            }
            self.deliver(&mut window, endpoint, mover, message, stopping).await;
        }

        if batching && window.accepts_deliveries() {
            let marker = Message::end_of_batch(self.destination.clone(), self.clock.now_utc());
            self.deliver_marker(&mut window, endpoint, marker).await;
        }

        if let Some(latch) = &latch {
            if window.delivered > 0 && window.accepts_deliveries() {
                self.await_acknowledgements(&mut window, latch, stopping).await;
            }
        }

        let settlement = self.complete(&mut window, endpoint).await;
        let mut outcome = BatchOutcome {
            received,
            delivered: window.delivered,
            bypassed: window.bypassed,
            committed: false,
            discard_endpoint: window.discard_endpoint,
            failure: window.failure.take(),
            session_failure: None,
            stop_request: window.stop_request.take(),
        };

        outcome.committed = match settlement {
            Settlement::ContainerManaged => !window.rollback_only,
            Settlement::Commit => match session.commit().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "session commit failed");
                    outcome.session_failure = Some(e.into());
                    false
                },
            },
            Settlement::Rollback => {
                if let Err(e) = session.rollback().await {
                    warn!(error = %e, "session rollback failed");
                    outcome.session_failure = Some(e.into());
                }
                false
            },
        };

        mover.finish(outcome.committed).await;
        outcome
    }

    /// Opens a delivery window on `endpoint`.
    ///
    /// A `before_delivery` failure leaves the window closed: nothing is
    /// delivered, `after_delivery` is skipped and the endpoint is discarded.
    pub async fn begin(&self, endpoint: &EndpointHandle) -> DeliveryWindow {
        let mut window = DeliveryWindow::new(self.demarcated());
        if !window.demarcated {
            window.opened = true;
            return window;
        }

        match endpoint.endpoint().before_delivery(window.context).await {
            Ok(()) => window.opened = true,
            Err(e) => {
                warn!(context = %window.context, error = %e, "before_delivery failed");
                window.discard_endpoint = true;
                window.rollback_only = true;
                window.record_failure(DeliveryError::before_delivery(e.to_string()));
            },
        }
        window
    }

    /// Delivers one message inside `window`.
    ///
    /// The poison tracker runs first and may consume the message instead.
    /// Callback errors are recorded on the window, never returned.
    pub async fn deliver(
        &self,
        window: &mut DeliveryWindow,
        endpoint: &EndpointHandle,
        mover: &mut MoveConnection,
        mut message: Message,
        stopping: &CancellationToken,
    ) -> DeliveryResult {
        self.stats.delivery_started();

        let result = match self.tracker.should_deliver(mover, &mut message, stopping).await {
            Ok(false) => {
                window.bypassed += 1;
                DeliveryResult::Bypassed
            },
            Ok(true) => {
                window.callbacks += 1;
                window.delivered += 1;
                let result = match endpoint.endpoint().on_message(&mut message).await {
                    Ok(()) => DeliveryResult::Delivered,
                    Err(e) => {
                        warn!(message_id = %message.id, error = %e, "endpoint callback failed");
                        self.mark_rollback_only(window, DeliveryError::from(e));
                        DeliveryResult::Failed
                    },
                };
                self.tracker.absorb_callback_properties(&message);
                if message.property(properties::STOP_CONNECTOR).is_some_and(PropertyValue::is_truthy)
                {
                    window.stop_request = Some(format!("requested by message {}", message.id));
                }
                result
            },
            Err(e) => {
                error!(message_id = %message.id, error = %e, "poison handling failed");
                self.mark_rollback_only(window, e);
                DeliveryResult::Failed
            },
        };

        self.stats.delivery_ended(result);
        result
    }

    async fn deliver_marker(
        &self,
        window: &mut DeliveryWindow,
        endpoint: &EndpointHandle,
        mut marker: Message,
    ) {
        window.callbacks += 1;
        if let Err(e) = endpoint.endpoint().on_message(&mut marker).await {
            warn!(error = %e, "end-of-batch callback failed");
            self.mark_rollback_only(window, DeliveryError::from(e));
        }
    }

    async fn await_acknowledgements(
        &self,
        window: &mut DeliveryWindow,
        latch: &AckLatch,
        stopping: &CancellationToken,
    ) {
        let suspended = match (&self.transactions, window.demarcated) {
            (Some(transactions), true) => match transactions.suspend(window.context) {
                Ok(transaction) => transaction,
                Err(e) => {
                    warn!(context = %window.context, error = %e, "suspending transaction failed");
                    None
                },
            },
            _ => None,
        };

        let wait = latch
            .wait(window.delivered, stopping, self.settings.poll_interval, self.clock.as_ref())
            .await;

        if let (Some(transactions), Some(transaction)) = (&self.transactions, suspended) {
            if let Err(e) = transactions.resume(window.context, transaction) {
                warn!(context = %window.context, error = %e, "resuming transaction failed");
            }
        }

        if wait == AckWait::Interrupted {
            debug!(
                context = %window.context,
                expected = window.delivered,
                received = latch.received(),
                "rolling back unacknowledged batch"
            );
            self.mark_rollback_only(window, DeliveryError::ShuttingDown);
        }
    }

    /// Marks the window's transaction for rollback.
    pub fn mark_rollback_only(&self, window: &mut DeliveryWindow, cause: DeliveryError) {
        window.rollback_only = true;
        window.record_failure(cause);
        if window.demarcated && window.opened {
            if let Some(transactions) = &self.transactions {
                if let Err(e) = transactions.set_rollback_only(window.context) {
                    warn!(context = %window.context, error = %e, "set_rollback_only failed");
                }
            }
        }
    }

    /// Closes `window` and says how the session must be finished.
    pub async fn complete(&self, window: &mut DeliveryWindow, endpoint: &EndpointHandle) -> Settlement {
        if !window.demarcated {
            return if window.rollback_only { Settlement::Rollback } else { Settlement::Commit };
        }
        if !window.opened {
            return Settlement::Rollback;
        }

        if window.callbacks == 0 {
            // No on_message ran, so after_delivery is not allowed. Finish the
            // transaction through the manager and retire the endpoint.
            window.discard_endpoint = true;
            if let Err(e) = self.commit_without_callback(window, endpoint).await {
                warn!(context = %window.context, error = %e, "completing bypassed delivery failed");
                window.rollback_only = true;
                window.record_failure(e);
            }
            return Settlement::ContainerManaged;
        }

        if let Err(e) = endpoint.endpoint().after_delivery(window.context).await {
            warn!(context = %window.context, error = %e, "after_delivery failed");
            window.discard_endpoint = true;
            window.rollback_only = true;
            window.record_failure(DeliveryError::after_delivery(e.to_string()));
        }
        Settlement::ContainerManaged
    }

    async fn commit_without_callback(
        &self,
        window: &DeliveryWindow,
        endpoint: &EndpointHandle,
    ) -> crate::error::Result<()> {
        let Some(transactions) = &self.transactions else {
            return Err(DeliveryError::internal("demarcated delivery without transaction manager"));
        };
        if let Some(resource) = endpoint.resource() {
            transactions.delist(window.context, resource)?;
        }
        transactions.commit(window.context).await?;
        Ok(())
    }
}

struct MoveResources {
    connection: Arc<dyn BrokerConnection>,
    session: Arc<dyn BrokerSession>,
    producer: Box<dyn MessageProducer>,
}

/// Connection used by the poison tracker to move messages.
///
/// Created lazily on first use. In immediate mode every send is committed
/// straight away; in delayed mode sends stay pending until [`finish`] is
/// called with the outcome of the consuming transaction.
///
/// [`finish`]: MoveConnection::finish
pub struct MoveConnection {
    driver: Arc<dyn BrokerDriver>,
    options: ConnectOptions,
    delayed_commit: bool,
    resources: Option<MoveResources>,
    pending: usize,
}

impl MoveConnection {
    /// Creates an unconnected move connection.
    pub fn new(driver: Arc<dyn BrokerDriver>, options: ConnectOptions, delayed_commit: bool) -> Self {
        Self { driver, options, delayed_commit, resources: None, pending: 0 }
    }

    /// Whether the broker connection has been opened.
    pub fn is_connected(&self) -> bool {
        self.resources.is_some()
    }

    /// Sends that still await [`finish`](Self::finish).
    pub fn pending(&self) -> usize {
        self.pending
    }

    async fn resources(&mut self, target: &Destination) -> sluice_core::Result<&mut MoveResources> {
        if self.resources.is_none() {
            let connection = self.driver.connect(&self.options).await?;
            let session = match connection.create_session(Domain::resolve(target.kind, false)).await {
                Ok(session) => session,
                Err(e) => {
                    let _ = connection.close().await;
                    return Err(e);
                },
            };
            let producer = match session.create_producer().await {
                Ok(producer) => producer,
                Err(e) => {
                    let _ = session.close().await;
                    let _ = connection.close().await;
                    return Err(e);
                },
            };
            debug!(target = %target, "opened move connection");
            self.resources = Some(MoveResources { connection, session, producer });
        }
        self.resources.as_mut().ok_or_else(|| sluice_core::CoreError::closed("move connection"))
    }

    async fn send(&mut self, target: &Destination, message: Message) -> sluice_core::Result<()> {
        let delayed = self.delayed_commit;
        let resources = self.resources(target).await?;
        resources.producer.send(target, message).await?;
        if delayed {
            self.pending += 1;
        } else {
            resources.session.commit().await?;
        }
        Ok(())
    }

    /// Commits or rolls back pending moves together with the consuming
    /// transaction.
    pub async fn finish(&mut self, committed: bool) {
        if self.pending == 0 {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        let Some(resources) = &self.resources else {
            return;
        };
        let result = if committed {
            resources.session.commit().await
        } else {
            resources.session.rollback().await
        };
        if let Err(e) = result {
            warn!(pending, committed, error = %e, "finishing pending moves failed");
        }
    }

    /// Closes the broker connection, rolling back anything pending.
    pub async fn close(&mut self) {
        if self.pending > 0 {
            self.finish(false).await;
        }
        if let Some(resources) = self.resources.take() {
            if let Err(e) = resources.session.close().await {
                debug!(error = %e, "closing move session failed");
            }
            if let Err(e) = resources.connection.close().await {
                debug!(error = %e, "closing move connection failed");
            }
        }
    }
}

fn as_property_int(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn apply_stamp(message: &mut Message, stamp: &BTreeMap<String, PropertyValue>) {
    for (name, value) in stamp {
        message.set_property(name.clone(), value.clone());
    }
}

#[async_trait]
impl MessageMover for MoveConnection {
    async fn copy_and_send(
        &mut self,
        original: &Message,
        target: &Destination,
        stamp: &BTreeMap<String, PropertyValue>,
    ) -> sluice_core::Result<()> {
        let mut copy = self.resources(target).await?.session.copy_message(original)?;
        apply_stamp(&mut copy, stamp);
        self.send(target, copy).await
    }

    async fn redirect(
        &mut self,
        original: &Message,
        target: &Destination,
        stamp: &BTreeMap<String, PropertyValue>,
    ) -> sluice_core::Result<()> {
        let mut message = original.clone();
        apply_stamp(&mut message, stamp);
        self.send(target, message).await
    }
}
