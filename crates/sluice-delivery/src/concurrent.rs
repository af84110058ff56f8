//! Concurrent-pull delivery.
//!
//! The broker's connection consumer pulls server sessions from a bounded,
//! growable pool of [`WorkUnit`]s and loads messages into them; each loaded
//! unit is handed to the host scheduler. A semaphore whose permits equal the
//! number of idle units provides the backpressure: when every unit is busy
//! the broker's pump blocks in [`ServerSessionPool::server_session`].

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use sluice_core::{
    BrokerConnection, BrokerSession, ConnectionConsumer, CoreError, Domain, Message,
    ServerSession, ServerSessionPool, Work,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    endpoint::EndpointLeaser,
    error::{DeliveryError, Result},
    strategy::{to_core_error, DeliveryStrategy, StrategyContext},
    transaction::{BatchOutcome, TransactionalDelivery},
    work_unit::{DestroyRequest, WorkUnit, WorkUnitControl},
};

/// Deactivation logs progress every this many polls.
const PROGRESS_LOG_EVERY: u32 = 10;

#[derive(Default)]
struct PoolState {
    units: Vec<(Arc<WorkUnitControl>, Arc<dyn BrokerSession>)>,
    idle: VecDeque<WorkUnit>,
}

struct ConcurrentInner {
    context: StrategyContext,
    domain: Domain,
    core: TransactionalDelivery,
    leaser: EndpointLeaser,
    max_units: usize,
    poll_interval: Duration,
    stopping: CancellationToken,
    stopped: CancellationToken,
    growth: tokio::sync::Mutex<()>,
    pool: Mutex<PoolState>,
    available: Semaphore,
    next_id: AtomicU64,
    connection: Mutex<Option<Arc<dyn BrokerConnection>>>,
    consumer: Mutex<Option<Box<dyn ConnectionConsumer>>>,
}

/// Strategy delivering through a broker-driven pool of work units.
pub struct ConcurrentPullDelivery {
    inner: Arc<ConcurrentInner>,
}

impl ConcurrentPullDelivery {
    /// Creates an unstarted strategy instance.
    pub fn new(context: StrategyContext) -> Self {
        let domain = context.resolve_domain();
        let inner = ConcurrentInner {
            core: context.delivery_core(domain),
            leaser: context.leaser(),
            max_units: context.config.endpoint_pool_max_size,
            poll_interval: context.config.shutdown_poll_interval(),
            domain,
            context,
            stopping: CancellationToken::new(),
            stopped: CancellationToken::new(),
            growth: tokio::sync::Mutex::new(()),
            pool: Mutex::new(PoolState::default()),
            available: Semaphore::new(0),
            next_id: AtomicU64::new(1),
            connection: Mutex::new(None),
            consumer: Mutex::new(None),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Session pool handed to the broker's connection consumer.
    pub fn session_pool(&self) -> Arc<dyn ServerSessionPool> {
        Arc::new(SessionPool { inner: self.inner.clone() })
    }

    /// Units created and not yet torn down.
    pub fn pool_size(&self) -> usize {
        self.inner.pool.lock().units.len()
    }

    /// Units waiting in the idle pool.
    pub fn idle_count(&self) -> usize {
        self.inner.pool.lock().idle.len()
    }

    /// Opens the broker connection without starting the pump. Used when the
    /// session pool is driven directly.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        self.inner.connect().await
    }
}

#[async_trait]
impl DeliveryStrategy for ConcurrentPullDelivery {
    fn name(&self) -> &'static str {
        "concurrent-pull"
    }

    async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let connection = inner.connect().await?;

        let consumer = connection
            .create_connection_consumer(
                &inner.context.config.consumer_spec(),
                self.session_pool(),
                inner.context.config.batch_size,
            )
            .await
            .map_err(|e| DeliveryError::connect(format!("creating connection consumer: {e}")))?;
        *inner.consumer.lock() = Some(consumer);

        connection
            .start()
            .await
            .map_err(|e| DeliveryError::connect(format!("starting connection: {e}")))?;

        info!(
            destination = %inner.context.config.destination(),
            max_units = inner.max_units,
            tx_mode = ?inner.domain.tx_mode,
            "concurrent-pull delivery started"
        );
        Ok(())
    }

    async fn deactivate(&self) {
        self.inner.deactivate().await;
    }
}

impl ConcurrentInner {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>> {
        if let Some(connection) = self.connection.lock().clone() {
            return Ok(connection);
        }
        let connection = self
            .context
            .collaborators
            .driver
            .connect(&self.context.config.connect_options())
            .await
            .map_err(|e| DeliveryError::connect(e.to_string()))?;
        connection.set_exception_listener(self.context.exception_listener());
        *self.connection.lock() = Some(connection.clone());
        Ok(connection)
    }

    async fn server_session(self: &Arc<Self>) -> sluice_core::Result<Box<dyn ServerSession>> {
        if self.stopping.is_cancelled() {
            return Err(self.wait_until_stopped().await);
        }

        match self.try_grow().await {
            Ok(Some(unit)) => return Ok(self.hand_out(unit)),
            Ok(None) => {},
            Err(e) => return Err(self.fail(e).await),
        }

        loop {
            tokio::select! {
                permit = self.available.acquire() => match permit {
                    Ok(permit) => permit.forget(),
                    Err(_) => return Err(CoreError::ShuttingDown),
                },
                () = self.context.collaborators.clock.sleep(self.poll_interval) => {
                    if self.stopping.is_cancelled() {
                        return Err(self.wait_until_stopped().await);
                    }
                    continue;
                },
            }

            if self.stopping.is_cancelled() {
                return Err(self.wait_until_stopped().await);
            }

            let unit = {
                let mut pool = self.pool.lock();
                match pool.idle.pop_front() {
                    Some(unit) if unit.control().try_dispatch() => Some(unit),
                    Some(unit) => {
                        pool.idle.push_back(unit);
                        None
                    },
                    None => None,
                }
            };
            let Some(mut unit) = unit else {
                continue;
            };

            if unit.needs_endpoint() {
                match self.leaser.lease(unit.session().xa_resource(), &self.stopping).await {
                    Ok(Some(endpoint)) => unit.set_endpoint(endpoint),
                    Ok(None) => {
                        self.work_done(unit).await;
                        return Err(self.wait_until_stopped().await);
                    },
                    Err(e) => {
                        self.work_done(unit).await;
                        return Err(self.fail(e).await);
                    },
                }
            }
            return Ok(self.hand_out(unit));
        }
    }

    /// Grows the pool by one unit if it has no idle unit and room to grow.
    /// The new unit is handed straight to the caller.
    async fn try_grow(&self) -> Result<Option<WorkUnit>> {
        let _growth = self.growth.lock().await;
        {
            let pool = self.pool.lock();
            if !pool.idle.is_empty()
                || pool.units.len() >= self.max_units
                || self.available.available_permits() > 0
            {
                return Ok(None);
            }
        }

        let unit = self.create_unit().await?;
        let admitted = {
            let mut pool = self.pool.lock();
            if self.stopping.is_cancelled() {
                false
            } else {
                pool.units.push((unit.control().clone(), unit.session().clone()));
                unit.control().try_dispatch()
            }
        };
        if !admitted {
            let session = unit.session().clone();
            unit.destroy().await;
            if let Err(e) = session.close().await {
                debug!(error = %e, "closing session of rejected unit failed");
            }
            return Err(DeliveryError::ShuttingDown);
        }

        debug!(unit = unit.control().id(), pool_size = self.pool.lock().units.len(), "work unit created");
        Ok(Some(unit))
    }

    async fn create_unit(&self) -> Result<WorkUnit> {
        let connection = self
            .connection
            .lock()
            .clone()
            .ok_or(DeliveryError::ShuttingDown)?;
        let session = connection.create_session(self.domain).await?;

        match self.leaser.lease(session.xa_resource(), &self.stopping).await {
            Ok(Some(endpoint)) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                Ok(WorkUnit::new(id, session, endpoint, self.context.move_connection()))
            },
            Ok(None) => {
                let _ = session.close().await;
                Err(DeliveryError::ShuttingDown)
            },
            Err(e) => {
                let _ = session.close().await;
                Err(e)
            },
        }
    }

    fn hand_out(self: &Arc<Self>, unit: WorkUnit) -> Box<dyn ServerSession> {
        Box::new(UnitSession { inner: self.clone(), session: unit.session().clone(), unit: Some(unit) })
    }

    async fn fail(&self, error: DeliveryError) -> CoreError {
        if error.is_shutdown() || self.stopping.is_cancelled() {
            return self.wait_until_stopped().await;
        }
        warn!(error = %error, "could not provide a server session");
        self.context.sink.distress(error.clone());
        to_core_error(&error)
    }

    async fn wait_until_stopped(&self) -> CoreError {
        self.stopped.cancelled().await;
        CoreError::ShuttingDown
    }

    async fn run_unit(self: Arc<Self>, mut unit: WorkUnit, messages: Vec<Message>) {
        let outcome = unit.run(&self.core, messages, &self.stopping).await;
        self.handle_outcome(outcome);
        self.work_done(unit).await;
    }

    fn handle_outcome(&self, outcome: BatchOutcome) {
        if let Some(reason) = outcome.stop_request {
            self.context.sink.stop_by_endpoint_request(reason);
        }
        if let Some(error) = outcome.session_failure {
            if !self.stopping.is_cancelled() && !error.is_shutdown() {
                self.context.sink.distress(error);
            }
        }
    }

    /// Returns a unit to the idle pool, or hands it back when a destroy was
    /// requested while it ran.
    fn return_to_pool(&self, unit: WorkUnit) -> Option<WorkUnit> {
        let mut pool = self.pool.lock();
        if unit.control().finish_run() {
            pool.idle.push_back(unit);
            self.available.add_permits(1);
            None
        } else {
            Some(unit)
        }
    }

    async fn work_done(&self, unit: WorkUnit) {
        if let Some(unit) = self.return_to_pool(unit) {
            unit.destroy().await;
        }
    }

    fn reclaim(&self, unit: WorkUnit) {
        if let Some(unit) = self.return_to_pool(unit) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(unit.destroy());
                },
                Err(_) => warn!(unit = unit.control().id(), "no runtime to destroy work unit"),
            }
        }
    }

    async fn deactivate(&self) {
        self.stopping.cancel();

        let consumer = self.consumer.lock().take();
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.close().await {
                debug!(error = %e, "closing connection consumer failed");
            }
        }

        let idle: Vec<WorkUnit> = {
            let mut pool = self.pool.lock();
            for (control, _) in &pool.units {
                if control.request_destroy() == DestroyRequest::Deferred {
                    debug!(unit = control.id(), "destroy deferred until delivery completes");
                }
            }
            pool.idle.drain(..).collect()
        };
        for unit in idle {
            unit.destroy().await;
        }

        let mut polls = 0_u32;
        loop {
            let remaining =
                self.pool.lock().units.iter().filter(|(control, _)| !control.is_destroyed()).count();
            if remaining == 0 {
                break;
            }
            if polls % PROGRESS_LOG_EVERY == 0 {
                info!(remaining, "waiting for work units to finish");
            }
            polls = polls.saturating_add(1);
            self.context.collaborators.clock.sleep(self.poll_interval).await;
        }

        let sessions: Vec<Arc<dyn BrokerSession>> =
            self.pool.lock().units.drain(..).map(|(_, session)| session).collect();
        for session in sessions {
            if let Err(e) = session.close().await {
                debug!(error = %e, "closing work unit session failed");
            }
        }

        self.stopped.cancel();

        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "closing connection failed");
            }
        }
        info!("concurrent-pull delivery deactivated");
    }
}

struct SessionPool {
    inner: Arc<ConcurrentInner>,
}

#[async_trait]
impl ServerSessionPool for SessionPool {
    async fn server_session(&self) -> sluice_core::Result<Box<dyn ServerSession>> {
        self.inner.server_session().await
    }
}

/// A dispatched unit waiting for the broker to load messages into it.
struct UnitSession {
    inner: Arc<ConcurrentInner>,
    session: Arc<dyn BrokerSession>,
    unit: Option<WorkUnit>,
}

impl ServerSession for UnitSession {
    fn session(&self) -> Arc<dyn BrokerSession> {
        self.session.clone()
    }

    fn start(mut self: Box<Self>, messages: Vec<Message>) -> sluice_core::Result<()> {
        let Some(unit) = self.unit.take() else {
            return Err(CoreError::closed("server session"));
        };

        let slot = Arc::new(Mutex::new(Some(unit)));
        let work_slot = slot.clone();
        let inner = self.inner.clone();
        let work: Work = Box::pin(async move {
            let unit = work_slot.lock().take();
            if let Some(unit) = unit {
                inner.run_unit(unit, messages).await;
            }
        });

        if let Err(e) = self.inner.context.collaborators.scheduler.schedule(work) {
            warn!(error = %e, "host scheduler refused work");
            self.unit = slot.lock().take();
            self.inner.context.sink.distress(DeliveryError::from(e.clone()));
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for UnitSession {
    fn drop(&mut self) {
        if let Some(unit) = self.unit.take() {
            self.inner.reclaim(unit);
        }
    }
}
