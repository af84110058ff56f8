//! Management view of an activation.

use serde::Serialize;
use sluice_core::{ConnectionState, DestinationKind};
use url::Url;

use crate::{
    config::{DeliveryMode, Durability},
    poison::PoisonStatsSnapshot,
    stats::StatsSnapshot,
    supervisor::ConnectionSupervisor,
};

/// Coarse status reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationStatus {
    /// Not connected and not trying to.
    Down,
    /// Delivering.
    Up,
    /// Connecting or waiting to retry.
    Connecting,
    /// Tearing down.
    Disconnecting,
}

impl From<ConnectionState> for ActivationStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Disconnected => Self::Down,
            ConnectionState::Connected => Self::Up,
            ConnectionState::Connecting => Self::Connecting,
            ConnectionState::Disconnecting => Self::Disconnecting,
        }
    }
}

/// Descriptive properties of an activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivationProperties {
    /// Queue or topic.
    pub destination_type: DestinationKind,
    /// Destination name.
    pub destination_name: String,
    /// Durable subscription name.
    pub subscriber_name: Option<String>,
    /// Subscription durability.
    pub durability: Durability,
    /// Delivery strategy.
    pub concurrency: DeliveryMode,
    /// Maximum endpoints.
    pub max_endpoints: usize,
    /// Broker-side selector.
    pub selector: Option<String>,
    /// Broker url as configured.
    pub url: Option<String>,
    /// Host part of the url.
    pub host: Option<String>,
    /// Port of the url, or the scheme's default.
    pub port: Option<u16>,
}

impl ConnectionSupervisor {
    /// Operator-facing status.
    pub fn status(&self) -> ActivationStatus {
        self.state().into()
    }

    /// Descriptive properties.
    pub fn properties(&self) -> ActivationProperties {
        let config = self.config();
        let parsed = config.connection_url.as_deref().and_then(|url| Url::parse(url).ok());
        ActivationProperties {
            destination_type: config.destination_type,
            destination_name: config.destination_name.clone(),
            subscriber_name: config.subscription_name.clone(),
            durability: config.subscription_durability,
            concurrency: config.delivery_mode,
            max_endpoints: config.endpoint_pool_max_size,
            selector: config.message_selector.clone(),
            url: config.connection_url.clone(),
            host: parsed.as_ref().and_then(|url| url.host_str().map(str::to_string)),
            port: parsed.as_ref().and_then(Url::port_or_known_default),
        }
    }

    /// Endpoint, message and poison counters.
    pub fn stats(&self) -> StatsSnapshot {
        let poison = self
            .tracker()
            .map(|tracker| tracker.stats().snapshot())
            .unwrap_or_else(PoisonStatsSnapshot::default);
        self.delivery_stats().snapshot(poison)
    }

    /// Zeroes the cumulative counters.
    pub fn reset_stats(&self) {
        self.delivery_stats().reset(self.now_utc());
        if let Some(tracker) = self.tracker() {
            tracker.stats().reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_follows_connection_state() {
        assert_eq!(ActivationStatus::from(ConnectionState::Disconnected), ActivationStatus::Down);
        assert_eq!(ActivationStatus::from(ConnectionState::Connected), ActivationStatus::Up);
        assert_eq!(
            ActivationStatus::from(ConnectionState::Disconnecting),
            ActivationStatus::Disconnecting
        );
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&ActivationStatus::Connecting).unwrap();
        assert_eq!(json, "\"connecting\"");
    }
}
