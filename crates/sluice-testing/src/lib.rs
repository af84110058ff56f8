//! Test infrastructure for the sluice delivery core.
//!
//! Provides an in-memory broker, a mock container that doubles as
//! transaction manager, event recording and message builders. Waiting helpers
//! use bounded timeouts and panic instead of hanging.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::time::Duration;

pub mod broker;
pub mod container;
pub mod events;
pub mod fixtures;

pub use broker::MemoryBroker;
pub use container::{Invocation, MessageHandler, MockContainer, RejectingScheduler, TransactionCounts};
pub use events::RecordingEventHandler;
pub use fixtures::MessageBuilder;

/// Upper bound for every waiting helper in this crate.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
