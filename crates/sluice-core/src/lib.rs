//! Message model and collaborator contracts for the sluice delivery core.
//!
//! Everything the delivery core consumes from the outside world is defined
//! here as a trait: the broker client, the container that creates endpoints
//! and owns transactions, and the host scheduler. Other crates depend on
//! these types only, so any broker or container can be plugged in.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod container;
pub mod error;
pub mod events;
pub mod models;
pub mod time;

pub use broker::{
    BrokerConnection, BrokerDriver, BrokerSession, Capabilities, ConnectOptions,
    ConnectionConsumer, ConsumerSpec, ExceptionListener, MessageConsumer, MessageProducer,
    ServerSession, ServerSessionPool, XaResource,
};
pub use container::{
    EndpointFactory, MessageEndpoint, TaskScheduler, TokioScheduler, TransactionManager, Work,
};
pub use error::{CoreError, Result};
pub use events::{
    ActivationEvent, ConnectionState, EventHandler, MulticastEventHandler, NoOpEventHandler,
};
pub use models::{
    properties, Acknowledger, ContextId, Destination, DestinationKind, Domain, Message, MessageId,
    PropertyValue, TransactionId, TxMode,
};
pub use time::{Clock, ManualClock, SystemClock};
