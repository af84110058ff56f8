//! Contracts the hosting container provides to the delivery core.
//!
//! Endpoints wrap the application's message callback. The container creates
//! them, owns their transactional demarcation and runs scheduled work on its
//! own threads.

use std::{fmt, future::Future, pin::Pin, sync::Arc};

use async_trait::async_trait;
use tokio::runtime::Handle;

use crate::{
    broker::XaResource,
    error::{CoreError, Result},
    models::{ContextId, Message, TransactionId},
};

/// A leased callback target.
#[async_trait]
pub trait MessageEndpoint: Send + Sync {
    /// Opens the delivery window for `context`. The container begins a
    /// transaction and enlists the endpoint's resource.
    async fn before_delivery(&self, context: ContextId) -> Result<()>;

    /// Invokes the application callback.
    ///
    /// The callback may set properties on the message to influence
    /// redelivery handling.
    async fn on_message(&self, message: &mut Message) -> Result<()>;

    /// Closes the delivery window, completing the container's transaction.
    async fn after_delivery(&self, context: ContextId) -> Result<()>;

    /// Returns the endpoint to the container.
    fn release(&self);
}

/// Creates endpoints on behalf of an activation.
#[async_trait]
pub trait EndpointFactory: Send + Sync {
    /// Creates an endpoint, optionally bound to a two-phase resource.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EndpointUnavailable`] while the application is
    /// being redeployed.
    async fn create_endpoint(
        &self,
        resource: Option<Arc<dyn XaResource>>,
    ) -> Result<Arc<dyn MessageEndpoint>>;

    /// Whether deliveries must be demarcated by a container transaction.
    fn is_delivery_transacted(&self) -> bool;

    /// Checks that the application's callback can be located.
    ///
    /// # Errors
    ///
    /// Returns an error when the callback method cannot be resolved.
    fn resolve_listener(&self) -> Result<()>;
}

/// Transaction manager access used for thread-association handoff.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Returns the transaction associated with `context`, if any.
    fn transaction(&self, context: ContextId) -> Option<TransactionId>;

    /// Marks the transaction associated with `context` for rollback.
    fn set_rollback_only(&self, context: ContextId) -> Result<()>;

    /// Dissociates the transaction from `context` so it can be resumed later.
    fn suspend(&self, context: ContextId) -> Result<Option<TransactionId>>;

    /// Reassociates a suspended transaction with `context`.
    fn resume(&self, context: ContextId, transaction: TransactionId) -> Result<()>;

    /// Ends the association between `resource` and the transaction.
    fn delist(&self, context: ContextId, resource: &Arc<dyn XaResource>) -> Result<()>;

    /// Completes the transaction associated with `context`. Rolls back
    /// instead when it has been marked rollback-only.
    async fn commit(&self, context: ContextId) -> Result<()>;
}

/// Boxed unit of work handed to a [`TaskScheduler`].
pub type Work = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs work on threads owned by the host.
pub trait TaskScheduler: Send + Sync {
    /// Schedules `work` for execution.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Scheduling`] when the host refuses the work.
    fn schedule(&self, work: Work) -> Result<()>;
}

/// Scheduler backed by a tokio runtime.
#[derive(Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Creates a scheduler for an explicit runtime handle.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Creates a scheduler for the runtime the caller is running on.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Scheduling`] outside a tokio runtime.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| CoreError::scheduling(format!("no tokio runtime: {e}")))
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler").finish_non_exhaustive()
    }
}

impl TaskScheduler for TokioScheduler {
    fn schedule(&self, work: Work) -> Result<()> {
        self.handle.spawn(work);
        Ok(())
    }
}
