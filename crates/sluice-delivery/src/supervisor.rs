//! Connection lifecycle supervision.
//!
//! The supervisor owns the delivery strategy of one activation and drives it
//! through four states:
//!
//! ```text
//!   Disconnected ──start──▶ Connecting ──connected──▶ Connected
//!        ▲                     │   ▲                      │
//!        └──────interrupt──────┘   │                 distress/stop
//!        │                         │                      ▼
//!        └─────────deactivated─────┴──reconnect──── Disconnecting
//! ```
//!
//! Connecting and reconnecting happen on a background task. Management
//! callers block in [`ConnectionSupervisor::stop`] until the state settles
//! at `Disconnected`. Every state change happens under one lock and wakes
//! all waiters.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sluice_core::{ActivationEvent, ConnectionState};
use tokio::{runtime::Handle, sync::Notify};
use tracing::{debug, error, info, warn};

use crate::{
    backoff::{LogDecision, ReconnectBackoff, ReconnectLogLimiter},
    config::ActivationConfig,
    error::{DeliveryError, Result},
    poison::PoisonMessageTracker,
    stats::DeliveryStats,
    strategy::{create_strategy, Collaborators, DeliveryStrategy, DistressSink, StrategyContext},
};

struct SupervisorState {
    connection: ConnectionState,
    interrupt_requested: bool,
    failure_at_start: Option<DeliveryError>,
    last_error: Option<DeliveryError>,
    strategy: Option<Arc<dyn DeliveryStrategy>>,
    tracker: Option<Arc<PoisonMessageTracker>>,
    runtime: Option<Handle>,
}

struct SupervisorInner {
    label: String,
    config: Arc<ActivationConfig>,
    collaborators: Collaborators,
    stats: Arc<DeliveryStats>,
    backoff: ReconnectBackoff,
    limiter: Mutex<ReconnectLogLimiter>,
    state: Mutex<SupervisorState>,
    changed: Notify,
    interrupt: Notify,
    stop_requested: AtomicBool,
}

enum StopStep {
    Wait,
    Deactivate(Option<Arc<dyn DeliveryStrategy>>),
}

enum AttemptOutcome {
    Connected,
    Interrupted,
    Failed(DeliveryError),
}

/// Supervises the broker connection of one activation.
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ConnectionSupervisor {
    /// Creates a supervisor in the `Disconnected` state.
    pub fn new(config: ActivationConfig, collaborators: Collaborators) -> Self {
        let backoff =
            ReconnectBackoff::new(config.reconnect_delays(), config.reconnect_jitter_factor);
        let limiter = ReconnectLogLimiter::new(
            config.minimal_reconnect_logging,
            config.reconnect_log_interval(),
        );
        let inner = SupervisorInner {
            label: config.destination().to_string(),
            config: Arc::new(config),
            collaborators,
            stats: Arc::new(DeliveryStats::default()),
            backoff,
            limiter: Mutex::new(limiter),
            state: Mutex::new(SupervisorState {
                connection: ConnectionState::Disconnected,
                interrupt_requested: false,
                failure_at_start: None,
                last_error: None,
                strategy: None,
                tracker: None,
                runtime: None,
            }),
            changed: Notify::new(),
            interrupt: Notify::new(),
            stop_requested: AtomicBool::new(false),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Validates the configuration, builds the poison tracker and starts
    /// connecting.
    ///
    /// Must be called from within a tokio runtime; background tasks are
    /// spawned onto it.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Configuration`] for invalid configuration or
    /// an unresolvable listener. Nothing is started in that case.
    pub fn activate(&self) -> Result<()> {
        let inner = &self.inner;
        inner.config.validate()?;
        inner.collaborators.endpoints.resolve_listener().map_err(|e| {
            DeliveryError::configuration(format!("message listener cannot be resolved: {e}"))
        })?;
        let table = inner.config.action_table()?;
        let runtime = Handle::try_current().map_err(|e| {
            DeliveryError::internal(format!("activation requires a tokio runtime: {e}"))
        })?;

        let tracker = Arc::new(PoisonMessageTracker::new(
            inner.config.destination(),
            table,
            inner.config.tracker_settings(),
            inner.collaborators.clock.clone(),
            inner.collaborators.events.clone(),
        ));
        {
            let mut state = inner.state.lock();
            state.tracker = Some(tracker);
            state.runtime = Some(runtime);
        }

        info!(
            activation = %inner.label,
            mode = inner.config.delivery_mode.as_str(),
            redelivery_handling = %inner.config.redelivery_handling,
            "activation configured"
        );
        self.start()
    }

    /// Starts connecting in the background. Returns with the state at
    /// `Connecting` or `Connected`.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::InvalidTransition`] while disconnecting or
    /// before [`activate`](Self::activate).
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let current = state.connection;
        match current {
            ConnectionState::Disconnected => {
                let runtime = state
                    .runtime
                    .clone()
                    .ok_or_else(|| DeliveryError::invalid_transition("start", "not activated"))?;
                state.failure_at_start = None;
                inner.transition(&mut state, ConnectionState::Connecting);
                drop(state);
                runtime.spawn(SupervisorInner::connect_loop(inner.clone(), false));
                Ok(())
            },
            ConnectionState::Connecting | ConnectionState::Connected => Ok(()),
            ConnectionState::Disconnecting => {
                Err(DeliveryError::invalid_transition("start", ConnectionState::Disconnecting))
            },
        }
    }

    /// Stops delivery and waits until the state is `Disconnected`.
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Stops, then starts again.
    ///
    /// # Errors
    ///
    /// Returns the error of [`start`](Self::start).
    pub async fn restart(&self) -> Result<()> {
        self.stop().await;
        self.start()
    }

    /// Reports a failure of the current connection. Never blocks.
    pub fn distress(&self, error: DeliveryError) {
        self.inner.distress(error);
    }

    /// Stops the activation on behalf of a callback running inside one of
    /// its own deliveries. Returns immediately; concurrent requests collapse
    /// into one stop.
    pub fn stop_by_endpoint_request(&self, reason: impl Into<String>) {
        self.inner.stop_by_endpoint_request(reason.into());
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    /// Most recent failure seen by the supervisor.
    pub fn last_error(&self) -> Option<DeliveryError> {
        self.inner.state.lock().last_error.clone()
    }

    /// Activation configuration.
    pub fn config(&self) -> &ActivationConfig {
        &self.inner.config
    }

    pub(crate) fn delivery_stats(&self) -> &Arc<DeliveryStats> {
        &self.inner.stats
    }

    pub(crate) fn now_utc(&self) -> DateTime<Utc> {
        self.inner.collaborators.clock.now_utc()
    }

    /// Poison tracker, available once activated.
    pub fn tracker(&self) -> Option<Arc<PoisonMessageTracker>> {
        self.inner.state.lock().tracker.clone()
    }
}

impl SupervisorInner {
    /// Applies a state change, emits it and wakes every waiter. Callers hold
    /// the state lock.
    fn transition(&self, state: &mut SupervisorState, to: ConnectionState) {
        let from = state.connection;
        if !from.can_transition_to(to) {
            error!(activation = %self.label, %from, %to, "illegal state transition");
        }
        state.connection = to;
        if to == ConnectionState::Disconnected {
            state.interrupt_requested = false;
        }
        info!(activation = %self.label, %from, %to, "activation state changed");
        self.collaborators.events.handle_event(&ActivationEvent::StateChanged { from, to });
        self.changed.notify_waiters();
    }

    async fn stop(self: &Arc<Self>) {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let step = {
                let mut state = self.state.lock();
                let current = state.connection;
                match current {
                    ConnectionState::Disconnected => return,
                    ConnectionState::Connecting => {
                        if !state.interrupt_requested {
                            debug!(activation = %self.label, "interrupting connect attempt");
                        }
                        state.interrupt_requested = true;
                        self.interrupt.notify_waiters();
                        StopStep::Wait
                    },
                    ConnectionState::Connected => {
                        let strategy = state.strategy.clone();
                        self.transition(&mut state, ConnectionState::Disconnecting);
                        StopStep::Deactivate(strategy)
                    },
                    ConnectionState::Disconnecting => {
                        // A reconnect in progress must settle at Disconnected.
                        state.interrupt_requested = true;
                        StopStep::Wait
                    },
                }
            };

            match step {
                StopStep::Wait => changed.await,
                StopStep::Deactivate(strategy) => self.teardown(strategy).await,
            }
        }
    }

    /// Deactivates `strategy` and settles at `Disconnected`. Runs on the
    /// activation's runtime so the transition happens even if the caller
    /// stops waiting.
    async fn teardown(self: &Arc<Self>, strategy: Option<Arc<dyn DeliveryStrategy>>) {
        let inner = self.clone();
        let task = async move {
            if let Some(strategy) = strategy {
                strategy.deactivate().await;
            }
            let mut state = inner.state.lock();
            state.strategy = None;
            inner.transition(&mut state, ConnectionState::Disconnected);
        };

        let runtime = self.state.lock().runtime.clone();
        let Some(runtime) = runtime else {
            task.await;
            return;
        };
        if let Err(e) = runtime.spawn(task).await {
            error!(activation = %self.label, error = %e, "deactivation task failed");
            let mut state = self.state.lock();
            if state.connection == ConnectionState::Disconnecting {
                state.strategy = None;
                self.transition(&mut state, ConnectionState::Disconnected);
            }
        }
    }

    fn distress(self: &Arc<Self>, error: DeliveryError) {
        let mut state = self.state.lock();
        let current = state.connection;
        match current {
            ConnectionState::Disconnected => {
                warn!(activation = %self.label, error = %error, "distress while disconnected, ignoring");
            },
            ConnectionState::Connecting => {
                debug!(activation = %self.label, error = %error, "failure during connect attempt");
                if state.failure_at_start.is_none() {
                    state.failure_at_start = Some(error.clone());
                }
                state.last_error = Some(error);
            },
            ConnectionState::Connected => {
                warn!(activation = %self.label, error = %error, "connection failed, reconnecting");
                state.last_error = Some(error);
                self.transition(&mut state, ConnectionState::Disconnecting);
                match state.runtime.clone() {
                    Some(runtime) => {
                        drop(state);
                        runtime.spawn(Self::connect_loop(self.clone(), true));
                    },
                    None => error!(activation = %self.label, "no runtime to reconnect on"),
                }
            },
            ConnectionState::Disconnecting => {
                debug!(activation = %self.label, error = %error, "distress while disconnecting");
            },
        }
    }

    fn stop_by_endpoint_request(self: &Arc<Self>, reason: String) {
        if self.stop_requested.swap(true, Ordering::AcqRel) {
            debug!(activation = %self.label, reason = %reason, "stop already requested");
            return;
        }
        info!(activation = %self.label, reason = %reason, "endpoint requested stop");

        let runtime = self.state.lock().runtime.clone();
        let Some(runtime) = runtime else {
            self.stop_requested.store(false, Ordering::Release);
            return;
        };
        let inner = self.clone();
        runtime.spawn(async move {
            inner.stop().await;
            inner.stop_requested.store(false, Ordering::Release);
        });
    }

    fn strategy_context(self: &Arc<Self>, tracker: Arc<PoisonMessageTracker>) -> StrategyContext {
        StrategyContext {
            config: self.config.clone(),
            collaborators: self.collaborators.clone(),
            tracker,
            stats: self.stats.clone(),
            sink: Arc::new(SupervisorSink { inner: Arc::downgrade(self) }),
        }
    }

    async fn connect_loop(self: Arc<Self>, from_disconnecting: bool) {
        if from_disconnecting {
            let strategy = self.state.lock().strategy.take();
            if let Some(strategy) = strategy {
                strategy.deactivate().await;
            }
            let mut state = self.state.lock();
            state.failure_at_start = None;
            let stop_pending = state.interrupt_requested;
            self.transition(&mut state, ConnectionState::Disconnected);
            if stop_pending {
                debug!(activation = %self.label, "stop requested during teardown, not reconnecting");
                return;
            }
            self.transition(&mut state, ConnectionState::Connecting);
        }

        let mut attempt = 0_u32;
        loop {
            let tracker = {
                let mut state = self.state.lock();
                if state.interrupt_requested {
                    self.transition(&mut state, ConnectionState::Disconnected);
                    return;
                }
                state.failure_at_start = None;
                state.tracker.clone()
            };
            let Some(tracker) = tracker else {
                error!(activation = %self.label, "connect loop started before activation");
                let mut state = self.state.lock();
                self.transition(&mut state, ConnectionState::Disconnected);
                return;
            };

            attempt = attempt.saturating_add(1);
            let strategy = create_strategy(self.strategy_context(tracker));
            self.state.lock().strategy = Some(strategy.clone());
            debug!(activation = %self.label, attempt, strategy = strategy.name(), "connecting");

            match self.attempt(&strategy).await {
                AttemptOutcome::Connected => return,
                AttemptOutcome::Interrupted => {
                    strategy.deactivate().await;
                    let mut state = self.state.lock();
                    state.strategy = None;
                    self.transition(&mut state, ConnectionState::Disconnected);
                    return;
                },
                AttemptOutcome::Failed(e) => {
                    strategy.deactivate().await;
                    {
                        let mut state = self.state.lock();
                        state.strategy = None;
                        state.last_error = Some(e.clone());
                    }
                    self.back_off(attempt, &e).await;
                },
            }
        }
    }

    async fn attempt(&self, strategy: &Arc<dyn DeliveryStrategy>) -> AttemptOutcome {
        if let Err(e) = strategy.start().await {
            return AttemptOutcome::Failed(e);
        }
        self.interruptible_sleep(self.config.connect_grace_period()).await;

        let mut state = self.state.lock();
        if state.interrupt_requested {
            return AttemptOutcome::Interrupted;
        }
        if let Some(e) = state.failure_at_start.take() {
            return AttemptOutcome::Failed(e);
        }
        self.transition(&mut state, ConnectionState::Connected);
        drop(state);

        self.limiter.lock().reset();
        info!(activation = %self.label, strategy = strategy.name(), "connected");
        AttemptOutcome::Connected
    }

    async fn back_off(&self, attempt: u32, error: &DeliveryError) {
        let delay = self.backoff.delay_for(attempt);
        let message = error.to_string();
        let decision = self.limiter.lock().check(&message, self.collaborators.clock.now());
        let retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        match decision {
            LogDecision::Log { suppressed } => warn!(
                activation = %self.label,
                attempt,
                retry_in_ms,
                suppressed,
                error = %message,
                "connect attempt failed"
            ),
            LogDecision::Suppress => debug!(
                activation = %self.label,
                attempt,
                retry_in_ms,
                "connect attempt failed again"
            ),
        }
        self.collaborators.events.handle_event(&ActivationEvent::ReconnectFailed {
            attempt,
            retry_in: delay,
            error: message,
        });

        if self.interruptible_sleep(delay).await {
            debug!(activation = %self.label, "backoff interrupted");
        }
    }

    /// Sleeps for `duration` unless an interrupt is or becomes pending.
    /// Returns true when interrupted.
    async fn interruptible_sleep(&self, duration: std::time::Duration) -> bool {
        let interrupted = self.interrupt.notified();
        tokio::pin!(interrupted);
        interrupted.as_mut().enable();
        if self.state.lock().interrupt_requested {
            return true;
        }

        tokio::select! {
            () = self.collaborators.clock.sleep(duration) => false,
            () = interrupted => true,
        }
    }
}

/// Routes strategy failures back to the supervisor without keeping it alive.
struct SupervisorSink {
    inner: Weak<SupervisorInner>,
}

impl DistressSink for SupervisorSink {
    fn distress(&self, error: DeliveryError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.distress(error);
        }
    }

    fn stop_by_endpoint_request(&self, reason: String) {
        if let Some(inner) = self.inner.upgrade() {
            inner.stop_by_endpoint_request(reason);
        }
    }
}
