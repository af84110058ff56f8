//! Polled-worker delivery.
//!
//! Dedicated poller tasks each own a session and consumer and run a
//! receive-process-commit loop. Deactivation stops the connection so pending
//! receives return empty, then waits for every poller to report that it is no
//! longer running before closing anything.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use sluice_core::{BrokerConnection, BrokerSession, Domain, Message, MessageConsumer};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    endpoint::{EndpointHandle, EndpointLeaser},
    error::{DeliveryError, Result},
    strategy::{DeliveryStrategy, StrategyContext},
    transaction::{MoveConnection, TransactionalDelivery},
};

/// Deactivation logs progress every this many polls.
const PROGRESS_LOG_EVERY: u32 = 10;

struct PolledInner {
    context: StrategyContext,
    domain: Domain,
    core: TransactionalDelivery,
    leaser: EndpointLeaser,
    stopping: CancellationToken,
    receive_timeout: Duration,
    batch_receive_timeout: Duration,
}

/// Resources a poller hands back when it exits.
struct PollerResources {
    session: Arc<dyn BrokerSession>,
    consumer: Box<dyn MessageConsumer>,
    mover: MoveConnection,
}

struct Poller {
    id: usize,
    running: Arc<AtomicBool>,
    task: JoinHandle<PollerResources>,
}

/// Strategy running N dedicated pollers.
pub struct PolledWorkerDelivery {
    inner: Arc<PolledInner>,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    pollers: Mutex<Vec<Poller>>,
}

impl PolledWorkerDelivery {
    /// Creates an unstarted strategy instance.
    pub fn new(context: StrategyContext) -> Self {
        let domain = context.resolve_domain();
        let inner = PolledInner {
            core: context.delivery_core(domain),
            leaser: context.leaser(),
            receive_timeout: context.config.receive_timeout(),
            batch_receive_timeout: context.config.batch_receive_timeout(),
            domain,
            context,
            stopping: CancellationToken::new(),
        };
        Self {
            inner: Arc::new(inner),
            connection: Mutex::new(None),
            pollers: Mutex::new(Vec::new()),
        }
    }

    /// Pollers still inside their loop.
    pub fn running_pollers(&self) -> usize {
        self.pollers.lock().iter().filter(|poller| poller.running.load(Ordering::Acquire)).count()
    }

    async fn open_connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        let context = &self.inner.context;
        let connection = context
            .collaborators
            .driver
            .connect(&context.config.connect_options())
            .await
            .map_err(|e| DeliveryError::connect(e.to_string()))?;
        connection.set_exception_listener(context.exception_listener());
        *self.connection.lock() = Some(connection.clone());
        Ok(connection)
    }

    async fn spawn_poller(&self, id: usize, connection: &Arc<dyn BrokerConnection>) -> Result<()> {
        let session = connection.create_session(self.inner.domain).await?;
        let consumer = match session.create_consumer(&self.inner.context.config.consumer_spec()).await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                let _ = session.close().await;
                return Err(e.into());
            },
        };

        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(run_poller(
            self.inner.clone(),
            id,
            session,
            consumer,
            running.clone(),
        ));
        self.pollers.lock().push(Poller { id, running, task });
        Ok(())
    }
}

#[async_trait]
impl DeliveryStrategy for PolledWorkerDelivery {
    fn name(&self) -> &'static str {
        self.inner.context.config.delivery_mode.as_str()
    }

    async fn start(&self) -> Result<()> {
        let connection = self.open_connection().await?;
        let count = self.inner.context.config.poller_count();
        for id in 0..count {
            self.spawn_poller(id, &connection).await?;
        }

        connection
            .start()
            .await
            .map_err(|e| DeliveryError::connect(format!("starting connection: {e}")))?;

        info!(
            destination = %self.inner.context.config.destination(),
            pollers = count,
            batch_size = self.inner.core.batch_size(),
            hold_until_ack = self.inner.context.config.hold_until_ack,
            tx_mode = ?self.inner.domain.tx_mode,
            "polled delivery started"
        );
        Ok(())
    }

    async fn deactivate(&self) {
        self.inner.stopping.cancel();

        let connection = self.connection.lock().clone();
        if let Some(connection) = &connection {
            if let Err(e) = connection.stop().await {
                debug!(error = %e, "stopping connection failed");
            }
        }

        let poll = self.inner.context.config.shutdown_poll_interval();
        let mut polls = 0_u32;
        loop {
            let running = self.running_pollers();
            if running == 0 {
                break;
            }
            if polls % PROGRESS_LOG_EVERY == 0 {
                info!(running, "waiting for pollers to exit");
            }
            polls = polls.saturating_add(1);
            self.inner.context.collaborators.clock.sleep(poll).await;
        }

        let pollers = std::mem::take(&mut *self.pollers.lock());
        for poller in pollers {
            match poller.task.await {
                Ok(mut resources) => {
                    if let Err(e) = resources.consumer.close().await {
                        debug!(poller = poller.id, error = %e, "closing consumer failed");
                    }
                    resources.mover.close().await;
                    if let Err(e) = resources.session.close().await {
                        debug!(poller = poller.id, error = %e, "closing session failed");
                    }
                },
                Err(e) => warn!(poller = poller.id, error = %e, "poller task ended abnormally"),
            }
        }

        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "closing connection failed");
            }
        }
        info!("polled delivery deactivated");
    }
}

/// Clears a poller's running flag when its task ends, including by panic.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn run_poller(
    inner: Arc<PolledInner>,
    id: usize,
    session: Arc<dyn BrokerSession>,
    mut consumer: Box<dyn MessageConsumer>,
    running: Arc<AtomicBool>,
) -> PollerResources {
    let _running = RunningGuard(running);
    let mut mover = inner.context.move_connection();
    let mut endpoint: Option<EndpointHandle> = None;
    debug!(poller = id, "poller started");

    while !inner.stopping.is_cancelled() {
        let handle = match endpoint.take() {
            Some(handle) => handle,
            None => match inner.leaser.lease(session.xa_resource(), &inner.stopping).await {
                Ok(Some(handle)) => handle,
                Ok(None) => break,
                Err(e) => {
                    error!(poller = id, error = %e, "could not lease endpoint");
                    inner.context.sink.distress(e);
                    break;
                },
            },
        };

        let messages = match receive_batch(&inner, &session, consumer.as_mut()).await {
            Ok(messages) => messages,
            Err(e) => {
                handle.release();
                if !inner.stopping.is_cancelled() && !e.is_shutdown() {
                    error!(poller = id, error = %e, "receive failed");
                    inner.context.sink.distress(e);
                }
                break;
            },
        };
        if messages.is_empty() {
            endpoint = Some(handle);
            continue;
        }

        let outcome =
            inner.core.deliver_batch(&handle, &session, &mut mover, messages, &inner.stopping).await;

        if outcome.discard_endpoint {
            handle.release();
        } else {
            endpoint = Some(handle);
        }
        if let Some(reason) = outcome.stop_request {
            inner.context.sink.stop_by_endpoint_request(reason);
        }
        if let Some(e) = outcome.session_failure {
            if !inner.stopping.is_cancelled() && !e.is_shutdown() {
                error!(poller = id, error = %e, "session failed");
                inner.context.sink.distress(e);
            }
            break;
        }
    }

    if let Some(handle) = endpoint.take() {
        handle.release();
    }
    debug!(poller = id, "poller exited");
    PollerResources { session, consumer, mover }
}

/// Receives the first message with the regular timeout, then tops the batch
/// up with the shorter inter-message timeout.
///
/// A failure after the first message rolls the session back, so the partial
/// batch returns to the broker right away.
async fn receive_batch(
    inner: &PolledInner,
    session: &Arc<dyn BrokerSession>,
    consumer: &mut dyn MessageConsumer,
) -> Result<Vec<Message>> {
    let Some(first) = consumer.receive(inner.receive_timeout).await? else {
        return Ok(Vec::new());
    };

    let batch_size = inner.core.batch_size();
    let mut batch = Vec::with_capacity(batch_size);
    batch.push(first);
    while batch.len() < batch_size && !inner.stopping.is_cancelled() {
        match consumer.receive(inner.batch_receive_timeout).await {
            Ok(Some(message)) => batch.push(message),
            Ok(None) => break,
            Err(e) => {
                warn!(received = batch.len(), error = %e, "receive failed mid-batch, rolling back");
                if let Err(rollback) = session.rollback().await {
                    debug!(error = %rollback, "rolling back partial batch failed");
                }
                return Err(e.into());
            },
        }
    }
    Ok(batch)
}
