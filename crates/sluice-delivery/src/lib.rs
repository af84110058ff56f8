//! Inbound message delivery with supervised reconnect and poison-message
//! handling.
//!
//! This crate pulls messages from a broker destination and hands them to
//! container-managed endpoints, optionally inside two-phase transactions. It
//! keeps the activation connected across broker failures and stops messages
//! that keep failing from looping forever.
//!
//! # Architecture
//!
//! Each activation is owned by a [`ConnectionSupervisor`]. On every connect
//! attempt the supervisor builds a fresh [`DeliveryStrategy`] that does the
//! actual message pulling:
//!
//! 1. **Connect** - Strategy opens a connection, sessions and consumers
//! 2. **Lease Endpoint** - Endpoint is leased from the container, retrying
//!    while the container reports it unavailable
//! 3. **Deliver Batch** - Messages run through the poison tracker and the
//!    endpoint inside one delivery window
//! 4. **Settle** - Window commits or rolls back, moved messages are committed
//!    together with it
//!
//! Failures anywhere in the chain are reported to the supervisor, which tears
//! the strategy down and reconnects with backoff.
//!
//! # Key Features
//!
//! - **Two Strategies** - Broker-driven pull into a pool of work units, or
//!   dedicated polling tasks
//! - **Poison Handling** - Redelivery action table with delay, move and
//!   delete actions
//! - **Hold Until Ack** - Batch transactions stay open until every message
//!   is acknowledged
//! - **Graceful Shutdown** - Deactivation waits for in-flight deliveries
//!   before closing anything
//!
//! # Example
//!
//! ```no_run
//! use sluice_delivery::{ActivationConfig, Collaborators, ConnectionSupervisor, DeliveryError};
//!
//! # async fn example(collaborators: Collaborators) -> std::result::Result<(), DeliveryError> {
//! let config = ActivationConfig::load()?;
//! let supervisor = ConnectionSupervisor::new(config, collaborators);
//!
//! // Validate and begin connecting in the background
//! supervisor.activate()?;
//!
//! // Later, block until delivery has fully stopped
//! supervisor.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod concurrent;
pub mod config;
pub mod coordinator;
pub mod endpoint;
pub mod error;
pub mod management;
pub mod poison;
pub mod polled;
pub mod registry;
pub mod stats;
pub mod strategy;
pub mod supervisor;
pub mod transaction;
pub mod work_unit;

// Re-export main public API
pub use config::{ActivationConfig, DeliveryMode, Durability, SameRmPolicy};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use management::{ActivationProperties, ActivationStatus};
pub use poison::{ActionTable, PoisonMessageTracker, RedeliveryAction};
pub use registry::{ActivationId, ActivationRegistry};
pub use stats::{DeliveryStats, StatsSnapshot};
pub use strategy::{Collaborators, DeliveryStrategy, DistressSink, StrategyContext};
pub use supervisor::ConnectionSupervisor;

/// Default maximum number of concurrent endpoints.
pub const DEFAULT_POOL_MAX_SIZE: usize = 15;

/// Default number of redelivered messages remembered by the poison tracker.
pub const DEFAULT_LOOKBACK_SIZE: usize = 5000;
