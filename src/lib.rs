//! Inbound message delivery core.
//!
//! `sluice` pulls messages from a broker and hands them to container-managed
//! endpoints. A [`ConnectionSupervisor`] owns one activation: it connects,
//! reconnects with backoff when the broker connection fails, and drives one of
//! two delivery strategies. A poison-message tracker watches redeliveries and
//! delays, moves or deletes messages that keep failing.
//!
//! This crate re-exports the collaborator contracts from `sluice-core` and the
//! delivery machinery from `sluice-delivery`, and offers [`init_tracing`] for
//! hosts that do not install their own subscriber.
//!
//! # Example
//!
//! ```no_run
//! # fn collaborators() -> sluice::Collaborators { unimplemented!() }
//! # async fn run() -> anyhow::Result<()> {
//! sluice::init_tracing()?;
//!
//! let config = sluice::ActivationConfig::load()?;
//! let supervisor = sluice::ConnectionSupervisor::new(config, collaborators());
//! supervisor.activate()?;
//!
//! let registry = sluice::ActivationRegistry::new();
//! registry.register(supervisor);
//!
//! tokio::signal::ctrl_c().await?;
//! registry.stop_all().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub use sluice_core as core;
pub use sluice_core::{
    properties, ActivationEvent, BrokerDriver, Clock, ConnectionState, CoreError, Destination,
    DestinationKind, EndpointFactory, EventHandler, Message, MessageEndpoint, MessageId,
    PropertyValue, SystemClock, TaskScheduler, TokioScheduler, TransactionManager,
};
pub use sluice_delivery as delivery;
pub use sluice_delivery::{
    ActionTable, ActivationConfig, ActivationId, ActivationProperties, ActivationRegistry,
    ActivationStatus, Collaborators, ConnectionSupervisor, DeliveryError, DeliveryMode,
    Durability, ErrorCategory, PoisonMessageTracker, RedeliveryAction, SameRmPolicy,
    StatsSnapshot,
};

/// Installs a global `tracing` subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info,sluice=debug`.
///
/// # Errors
///
/// Fails when `RUST_LOG` cannot be parsed or a global subscriber is already
/// installed.
pub fn init_tracing() -> anyhow::Result<()> {
    use anyhow::Context;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new("info,sluice=debug").context("invalid default log filter")?,
    };

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    tracing::debug!("tracing initialized");
    Ok(())
}
