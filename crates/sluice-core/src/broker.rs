//! Broker-side contracts consumed by the delivery core.
//!
//! The core never constructs broker objects itself. A [`BrokerDriver`]
//! produces connections, connections produce sessions, and sessions produce
//! consumers and producers. For the concurrent-pull strategy the broker drives
//! delivery through a [`ConnectionConsumer`] that repeatedly asks a
//! [`ServerSessionPool`] for a session, loads messages into it and starts it.
//!
//! ```text
//!  BrokerDriver ──connect──▶ BrokerConnection ──create_session──▶ BrokerSession
//!                                  │                                 │
//!                                  │ create_connection_consumer       ├─ create_consumer ─▶ MessageConsumer
//!                                  ▼                                 └─ create_producer ─▶ MessageProducer
//!                          ConnectionConsumer
//!                                  │ server_session()
//!                                  ▼
//!                          ServerSessionPool ──▶ ServerSession::start(messages)
//! ```

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    error::{CoreError, Result},
    models::{Destination, Domain, Message},
};

/// What the broker client library supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Sessions can expose a two-phase transactional resource.
    pub two_phase: bool,
}

/// Parameters for opening a broker connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Broker url, if the driver needs one.
    pub url: Option<String>,
    /// Client identifier for durable subscriptions.
    pub client_id: Option<String>,
}

/// Describes what a consumer subscribes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    /// Destination to consume from.
    pub destination: Destination,
    /// Optional broker-side selector expression.
    pub selector: Option<String>,
    /// Durable subscription name (topics only).
    pub durable_name: Option<String>,
}

/// Entry point into a broker client library.
#[async_trait]
pub trait BrokerDriver: Send + Sync {
    /// Reports the client library's capabilities.
    fn capabilities(&self) -> Capabilities;

    /// Opens a new, not yet started, connection.
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn BrokerConnection>>;
}

/// Callback for asynchronous connection failures.
pub trait ExceptionListener: Send + Sync {
    /// Invoked from the broker's notification context when the connection
    /// fails outside of any call made by the core.
    fn on_exception(&self, error: CoreError);
}

/// A physical connection to the broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Creates a session in the given domain.
    async fn create_session(&self, domain: Domain) -> Result<Arc<dyn BrokerSession>>;

    /// Creates a broker-driven consumer that pulls server sessions from
    /// `pool` and loads up to `max_messages` into each.
    async fn create_connection_consumer(
        &self,
        spec: &ConsumerSpec,
        pool: Arc<dyn ServerSessionPool>,
        max_messages: usize,
    ) -> Result<Box<dyn ConnectionConsumer>>;

    /// Registers the listener for asynchronous failures.
    fn set_exception_listener(&self, listener: Arc<dyn ExceptionListener>);

    /// Starts message flow.
    async fn start(&self) -> Result<()>;

    /// Pauses message flow; pending receives return `None`.
    async fn stop(&self) -> Result<()>;

    /// Closes the connection and everything created from it.
    async fn close(&self) -> Result<()>;
}

/// A transacted broker session.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Creates a synchronous consumer bound to this session.
    async fn create_consumer(&self, spec: &ConsumerSpec) -> Result<Box<dyn MessageConsumer>>;

    /// Creates a producer bound to this session.
    async fn create_producer(&self) -> Result<Box<dyn MessageProducer>>;

    /// Produces a fresh, sendable copy of a consumed message.
    fn copy_message(&self, message: &Message) -> Result<Message>;

    /// Returns the session's two-phase resource, if it has one.
    fn xa_resource(&self) -> Option<Arc<dyn XaResource>>;

    /// Commits consumed and produced messages.
    async fn commit(&self) -> Result<()>;

    /// Rolls back; consumed messages become eligible for redelivery.
    async fn rollback(&self) -> Result<()>;

    /// Closes the session, rolling back uncommitted work.
    async fn close(&self) -> Result<()>;
}

/// Synchronous message receiver.
#[async_trait]
pub trait MessageConsumer: Send {
    /// Waits up to `timeout` for a message. Returns `None` on timeout or when
    /// the connection is stopped.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Message>>;

    /// Closes the consumer.
    async fn close(&mut self) -> Result<()>;
}

/// Message sender.
#[async_trait]
pub trait MessageProducer: Send {
    /// Sends within the producing session's transaction.
    async fn send(&mut self, destination: &Destination, message: Message) -> Result<()>;
}

/// Broker-driven delivery pump created by
/// [`BrokerConnection::create_connection_consumer`].
#[async_trait]
pub trait ConnectionConsumer: Send + Sync {
    /// Stops pulling server sessions.
    async fn close(&self) -> Result<()>;
}

/// Supplies sessions to a [`ConnectionConsumer`].
#[async_trait]
pub trait ServerSessionPool: Send + Sync {
    /// Returns a session ready to receive messages, waiting for one to become
    /// available if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ShuttingDown`] once the pool has been torn down.
    async fn server_session(&self) -> Result<Box<dyn ServerSession>>;
}

/// A session handed out by a [`ServerSessionPool`].
pub trait ServerSession: Send {
    /// Session the broker loads messages into.
    fn session(&self) -> Arc<dyn BrokerSession>;

    /// Hands the loaded messages over for asynchronous processing.
    ///
    /// # Errors
    ///
    /// Returns an error if the work cannot be scheduled.
    fn start(self: Box<Self>, messages: Vec<Message>) -> Result<()>;
}

/// A resource that can take part in two-phase commit.
#[async_trait]
pub trait XaResource: Send + Sync + fmt::Debug {
    /// Identifies the resource manager behind this resource.
    fn resource_manager_id(&self) -> &str;

    /// Whether both resources belong to the same resource manager.
    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        self.resource_manager_id() == other.resource_manager_id()
    }

    /// Commits the branch.
    async fn commit(&self) -> Result<()>;

    /// Rolls back the branch.
    async fn rollback(&self) -> Result<()>;
}
