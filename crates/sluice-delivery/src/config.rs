//! Activation configuration.

use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use sluice_core::{ConnectOptions, ConsumerSpec, Destination, DestinationKind};

use crate::{
    error::{DeliveryError, Result},
    poison::{ActionTable, TrackerSettings},
};

const CONFIG_FILE: &str = "sluice.toml";
const ENV_PREFIX: &str = "SLUICE_";

/// How messages are pulled from the broker and dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryMode {
    /// One poller, one message at a time.
    Serial,
    /// Broker-driven pull into a pool of work units.
    #[default]
    ConcurrentPull,
    /// Several pollers receiving concurrently.
    MultiReceiver,
    /// Dedicated pollers doing synchronous receive-process-commit loops.
    SyncPoll,
}

impl DeliveryMode {
    /// Short name used in logs and management properties.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::ConcurrentPull => "concurrent-pull",
            Self::MultiReceiver => "multi-receiver",
            Self::SyncPoll => "sync-poll",
        }
    }
}

/// Topic subscription durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Durability {
    /// Messages published while disconnected are lost.
    #[default]
    NonDurable,
    /// The broker retains messages for the named subscription.
    Durable,
}

/// Whether two-phase resources handed to the endpoint factory keep their
/// own resource-manager identity comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SameRmPolicy {
    /// Use the resource's own comparison.
    #[default]
    Delegate,
    /// Report every other resource as a different resource manager.
    NeverSame,
}

/// Bound configuration for one destination subscription.
///
/// Loaded in priority order:
/// 1. Environment variables prefixed `SLUICE_` (highest priority)
/// 2. Configuration file (`sluice.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use sluice_delivery::ActivationConfig;
///
/// let config = ActivationConfig::load().expect("valid activation configuration");
/// println!("consuming from {}", config.destination());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationConfig {
    // Destination
    /// Queue or topic.
    #[serde(default)]
    pub destination_type: DestinationKind,
    /// Destination name.
    #[serde(default)]
    pub destination_name: String,
    /// Topic subscription durability.
    #[serde(default)]
    pub subscription_durability: Durability,
    /// Durable subscription name.
    #[serde(default)]
    pub subscription_name: Option<String>,
    /// Client identifier for durable subscriptions.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Broker-side selector.
    #[serde(default)]
    pub message_selector: Option<String>,
    /// Broker url.
    #[serde(default)]
    pub connection_url: Option<String>,

    // Concurrency
    /// Delivery strategy.
    #[serde(default)]
    pub delivery_mode: DeliveryMode,
    /// Maximum number of endpoints (work units or pollers).
    #[serde(default = "default_pool_max_size")]
    pub endpoint_pool_max_size: usize,
    /// Messages delivered per transaction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Keep the transaction open until the endpoint acknowledges.
    #[serde(default)]
    pub hold_until_ack: bool,

    // Redelivery
    /// Redelivery action table, e.g. `5:1000; 10:move(queue:dlq$)`.
    #[serde(default)]
    pub redelivery_handling: String,
    /// Re-send the original instead of a copy when moving.
    #[serde(default)]
    pub redirect_on_move: bool,
    /// Commit moved messages together with the consuming transaction.
    #[serde(default = "default_true")]
    pub delayed_move_commit: bool,
    /// Approximate number of redelivered messages remembered.
    #[serde(default = "default_lookback_size")]
    pub lookback_size: usize,
    /// Name stamped on moved messages.
    #[serde(default = "default_context_name")]
    pub context_name: String,

    // Reconnect
    /// Rate-limit repeated reconnect failure logs.
    #[serde(default)]
    pub minimal_reconnect_logging: bool,
    /// Window in which identical reconnect failures are suppressed.
    #[serde(default = "default_reconnect_log_interval_ms")]
    pub reconnect_log_interval_ms: u64,
    /// Delay table indexed by attempt, clamped to the last entry.
    #[serde(default = "default_reconnect_delays_ms")]
    pub reconnect_delays_ms: Vec<u64>,
    /// Random spread applied to reconnect delays (0.0 to 1.0).
    #[serde(default)]
    pub reconnect_jitter_factor: f64,
    /// Window after a successful start in which asynchronous failures still
    /// count against the attempt.
    #[serde(default = "default_connect_grace_period_ms")]
    pub connect_grace_period_ms: u64,

    // Timing
    /// First receive timeout of a poll.
    #[serde(default = "default_receive_timeout_ms")]
    pub receive_timeout_ms: u64,
    /// Receive timeout while filling a batch.
    #[serde(default = "default_batch_receive_timeout_ms")]
    pub batch_receive_timeout_ms: u64,
    /// Maximum time spent retrying an unavailable endpoint factory.
    #[serde(default = "default_endpoint_creation_timeout_ms")]
    pub endpoint_creation_timeout_ms: u64,
    /// Pause between endpoint creation retries.
    #[serde(default = "default_endpoint_retry_delay_ms")]
    pub endpoint_retry_delay_ms: u64,
    /// How often blocked waits re-check for shutdown.
    #[serde(default = "default_shutdown_poll_interval_ms")]
    pub shutdown_poll_interval_ms: u64,

    // Transactions
    /// Resource-manager identity policy.
    #[serde(default)]
    pub same_rm_policy: SameRmPolicy,
}

fn default_pool_max_size() -> usize {
    crate::DEFAULT_POOL_MAX_SIZE
}

fn default_batch_size() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_lookback_size() -> usize {
    crate::DEFAULT_LOOKBACK_SIZE
}

fn default_context_name() -> String {
    "sluice".to_string()
}

fn default_reconnect_log_interval_ms() -> u64 {
    60_000
}

fn default_reconnect_delays_ms() -> Vec<u64> {
    vec![1_000, 2_000, 5_000, 5_000, 10_000]
}

fn default_connect_grace_period_ms() -> u64 {
    500
}

fn default_receive_timeout_ms() -> u64 {
    1_000
}

fn default_batch_receive_timeout_ms() -> u64 {
    100
}

fn default_endpoint_creation_timeout_ms() -> u64 {
    20_000
}

fn default_endpoint_retry_delay_ms() -> u64 {
    1_000
}

fn default_shutdown_poll_interval_ms() -> u64 {
    1_000
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            destination_type: DestinationKind::Queue,
            destination_name: String::new(),
            subscription_durability: Durability::NonDurable,
            subscription_name: None,
            client_id: None,
            message_selector: None,
            connection_url: None,
            delivery_mode: DeliveryMode::default(),
            endpoint_pool_max_size: default_pool_max_size(),
            batch_size: default_batch_size(),
            hold_until_ack: false,
            redelivery_handling: String::new(),
            redirect_on_move: false,
            delayed_move_commit: true,
            lookback_size: default_lookback_size(),
            context_name: default_context_name(),
            minimal_reconnect_logging: false,
            reconnect_log_interval_ms: default_reconnect_log_interval_ms(),
            reconnect_delays_ms: default_reconnect_delays_ms(),
            reconnect_jitter_factor: 0.0,
            connect_grace_period_ms: default_connect_grace_period_ms(),
            receive_timeout_ms: default_receive_timeout_ms(),
            batch_receive_timeout_ms: default_batch_receive_timeout_ms(),
            endpoint_creation_timeout_ms: default_endpoint_creation_timeout_ms(),
            endpoint_retry_delay_ms: default_endpoint_retry_delay_ms(),
            shutdown_poll_interval_ms: default_shutdown_poll_interval_ms(),
            same_rm_policy: SameRmPolicy::Delegate,
        }
    }
}

impl ActivationConfig {
    /// Default configuration bound to `destination`.
    pub fn for_destination(destination: Destination) -> Self {
        Self {
            destination_type: destination.kind,
            destination_name: destination.name,
            ..Self::default()
        }
    }

    /// Loads configuration from defaults, `sluice.toml` and `SLUICE_`
    /// environment variables, then validates it.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Configuration`] if extraction or validation
    /// fails.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    /// Extracts and validates configuration from an explicit figment.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Configuration`] if extraction or validation
    /// fails.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment
            .extract()
            .map_err(|e| DeliveryError::configuration(format!("failed to load: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that can never work.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Configuration`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.destination_name.trim().is_empty() {
            return Err(DeliveryError::configuration("destination name must be set"));
        }
        if self.endpoint_pool_max_size == 0 {
            return Err(DeliveryError::configuration("endpoint pool max size must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(DeliveryError::configuration("batch size must be at least 1"));
        }
        if self.lookback_size == 0 {
            return Err(DeliveryError::configuration("lookback size must be at least 1"));
        }
        if self.reconnect_delays_ms.is_empty() {
            return Err(DeliveryError::configuration("reconnect delay table must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.reconnect_jitter_factor) {
            return Err(DeliveryError::configuration(
                "reconnect jitter factor must be between 0.0 and 1.0",
            ));
        }
        if self.subscription_durability == Durability::Durable {
            if self.destination_type != DestinationKind::Topic {
                return Err(DeliveryError::configuration(
                    "durable subscriptions require a topic",
                ));
            }
            if self.subscription_name.as_deref().map_or(true, |name| name.trim().is_empty()) {
                return Err(DeliveryError::configuration(
                    "durable subscriptions require a subscription name",
                ));
            }
        }
        self.action_table()?;
        Ok(())
    }

    /// Destination this activation consumes from.
    pub fn destination(&self) -> Destination {
        Destination::new(self.destination_type, self.destination_name.clone())
    }

    /// Parsed redelivery action table.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Configuration`] on grammar errors.
    pub fn action_table(&self) -> Result<ActionTable> {
        ActionTable::parse(&self.redelivery_handling, &self.destination()).map_err(|e| {
            DeliveryError::configuration(format!(
                "redelivery handling '{}': {e}",
                self.redelivery_handling
            ))
        })
    }

    /// Consumer description for sessions of this activation.
    pub fn consumer_spec(&self) -> ConsumerSpec {
        let durable_name = match self.subscription_durability {
            Durability::Durable => self.subscription_name.clone(),
            Durability::NonDurable => None,
        };
        ConsumerSpec {
            destination: self.destination(),
            selector: self.message_selector.clone(),
            durable_name,
        }
    }

    /// Options for opening broker connections.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions { url: self.connection_url.clone(), client_id: self.client_id.clone() }
    }

    /// Poison tracker tuning.
    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            lookback: self.lookback_size,
            redirect: self.redirect_on_move,
            subscriber_name: self.subscription_name.clone(),
            context_name: self.context_name.clone(),
        }
    }

    /// Number of pollers for the polled strategies: one for serial delivery
    /// and for topics, otherwise the endpoint pool size.
    pub fn poller_count(&self) -> usize {
        if self.delivery_mode == DeliveryMode::Serial
            || self.destination_type == DestinationKind::Topic
        {
            1
        } else {
            self.endpoint_pool_max_size
        }
    }

    /// Reconnect delay table.
    pub fn reconnect_delays(&self) -> Vec<Duration> {
        self.reconnect_delays_ms.iter().copied().map(Duration::from_millis).collect()
    }

    /// Reconnect log suppression window.
    pub fn reconnect_log_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_log_interval_ms)
    }

    /// Post-start grace period.
    pub fn connect_grace_period(&self) -> Duration {
        Duration::from_millis(self.connect_grace_period_ms)
    }

    /// First receive timeout of a poll.
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Receive timeout while filling a batch.
    pub fn batch_receive_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_receive_timeout_ms)
    }

    /// Endpoint creation deadline.
    pub fn endpoint_creation_timeout(&self) -> Duration {
        Duration::from_millis(self.endpoint_creation_timeout_ms)
    }

    /// Pause between endpoint creation retries.
    pub fn endpoint_retry_delay(&self) -> Duration {
        Duration::from_millis(self.endpoint_retry_delay_ms)
    }

    /// Shutdown re-check interval for blocked waits.
    pub fn shutdown_poll_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ActivationConfig {
        ActivationConfig::for_destination(Destination::queue("orders"))
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ActivationConfig::default();
        assert_eq!(config.lookback_size, 5000);
        assert_eq!(config.endpoint_creation_timeout(), Duration::from_secs(20));
        assert_eq!(config.endpoint_retry_delay(), Duration::from_secs(1));
        assert_eq!(config.connect_grace_period(), Duration::from_millis(500));
        assert_eq!(config.shutdown_poll_interval(), Duration::from_secs(1));
        assert_eq!(
            config.reconnect_delays(),
            [1, 2, 5, 5, 10].map(Duration::from_secs).to_vec()
        );
    }

    #[test]
    fn default_config_requires_destination() {
        assert!(matches!(
            ActivationConfig::default().validate(),
            Err(DeliveryError::Configuration { .. })
        ));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_invalid_pool_sizes() {
        let config = ActivationConfig { endpoint_pool_max_size: 0, ..valid() };
        assert!(config.validate().is_err());
        let config = ActivationConfig { batch_size: 0, ..valid() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_redelivery_grammar() {
        let config = ActivationConfig { redelivery_handling: "3:delete; 5:100".into(), ..valid() };
        let error = config.validate().unwrap_err();
        assert!(error.to_string().contains("terminal action"), "{error}");
    }

    #[test]
    fn durable_subscription_needs_topic_and_name() {
        let config =
            ActivationConfig { subscription_durability: Durability::Durable, ..valid() };
        assert!(config.validate().is_err());

        let config = ActivationConfig {
            destination_type: DestinationKind::Topic,
            subscription_durability: Durability::Durable,
            subscription_name: Some("audit".into()),
            ..valid()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.consumer_spec().durable_name.as_deref(), Some("audit"));
    }

    #[test]
    fn poller_count_depends_on_mode_and_domain() {
        let config = ActivationConfig {
            delivery_mode: DeliveryMode::SyncPoll,
            endpoint_pool_max_size: 4,
            ..valid()
        };
        assert_eq!(config.poller_count(), 4);

        let serial = ActivationConfig { delivery_mode: DeliveryMode::Serial, ..config.clone() };
        assert_eq!(serial.poller_count(), 1);

        let topic = ActivationConfig { destination_type: DestinationKind::Topic, ..config };
        assert_eq!(topic.poller_count(), 1);
    }

    #[test]
    fn loads_file_and_environment_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "sluice.toml",
                r#"
                destination_name = "orders"
                delivery_mode = "sync-poll"
                batch_size = 5
                "#,
            )?;
            jail.set_env("SLUICE_BATCH_SIZE", "8");
            jail.set_env("SLUICE_REDELIVERY_HANDLING", "3:move(queue:dlq$)");

            let config = ActivationConfig::load().map_err(|e| e.to_string())?;
            assert_eq!(config.destination_name, "orders");
            assert_eq!(config.delivery_mode, DeliveryMode::SyncPoll);
            assert_eq!(config.batch_size, 8);
            assert_eq!(config.action_table().map_err(|e| e.to_string())?.len(), 2);
            Ok(())
        });
    }
}
