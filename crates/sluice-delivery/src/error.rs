//! Error types for inbound delivery.
//!
//! The taxonomy separates failures by how they propagate. Connect errors
//! stay inside the supervisor's backoff loop. Demarcation and callback
//! errors end one delivery attempt. Poison-action errors are logged and fail
//! open. Shutdown races have their own variant so teardown noise can be told
//! apart from real faults.

use std::{fmt, time::Duration};

use sluice_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Failures raised by the delivery core.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Establishing or starting the broker connection failed.
    #[error("connect failed: {message}")]
    Connect {
        /// Failure detail
        message: String,
    },

    /// `before_delivery` or `after_delivery` failed.
    #[error("{phase} failed: {message}")]
    Demarcation {
        /// Which side of the delivery window failed
        phase: &'static str,
        /// Failure detail
        message: String,
    },

    /// The endpoint callback raised an error.
    #[error("endpoint callback failed: {message}")]
    EndpointCallback {
        /// Error reported by the callback
        message: String,
    },

    /// Moving a poison message failed on both the copy and redirect paths.
    #[error("poison action failed for message {message_id}: {message}")]
    PoisonAction {
        /// Message being handled
        message_id: String,
        /// Failure detail
        message: String,
    },

    /// The operation raced with an orderly shutdown.
    #[error("activation is shutting down")]
    ShuttingDown,

    /// Invalid activation configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error detail
        message: String,
    },

    /// The endpoint factory stayed unavailable past the creation deadline.
    #[error("endpoint creation timed out after {waited:?}")]
    EndpointCreationTimeout {
        /// How long creation was retried
        waited: Duration,
    },

    /// A lifecycle operation was requested from a state that forbids it.
    #[error("cannot {operation} while {state}")]
    InvalidTransition {
        /// Requested operation
        operation: &'static str,
        /// State the supervisor was in
        state: String,
    },

    /// A broker operation failed after the connection was established.
    #[error("broker error: {message}")]
    Broker {
        /// Broker-supplied detail
        message: String,
    },

    /// The host scheduler refused work.
    #[error("work scheduling failed: {message}")]
    Scheduling {
        /// Reason given by the scheduler
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a connect error.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::Connect { message: message.into() }
    }

    /// Creates a demarcation error for `before_delivery`.
    pub fn before_delivery(message: impl Into<String>) -> Self {
        Self::Demarcation { phase: "before_delivery", message: message.into() }
    }

    /// Creates a demarcation error for `after_delivery`.
    pub fn after_delivery(message: impl Into<String>) -> Self {
        Self::Demarcation { phase: "after_delivery", message: message.into() }
    }

    /// Creates an endpoint callback error.
    pub fn endpoint_callback(message: impl Into<String>) -> Self {
        Self::EndpointCallback { message: message.into() }
    }

    /// Creates a poison-action error.
    pub fn poison_action(message_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PoisonAction { message_id: message_id.into(), message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an invalid-transition error.
    pub fn invalid_transition(operation: &'static str, state: impl fmt::Display) -> Self {
        Self::InvalidTransition { operation, state: state.to_string() }
    }

    /// Creates a broker error.
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker { message: message.into() }
    }

    /// Creates a scheduling error.
    pub fn scheduling(message: impl Into<String>) -> Self {
        Self::Scheduling { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Whether the supervisor should retry after this error.
    ///
    /// Configuration problems and invalid transitions need operator action;
    /// everything else may clear up on reconnect.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect { .. }
            | Self::Demarcation { .. }
            | Self::EndpointCallback { .. }
            | Self::PoisonAction { .. }
            | Self::EndpointCreationTimeout { .. }
            | Self::Broker { .. }
            | Self::Scheduling { .. }
            | Self::Internal { .. } => true,

            Self::ShuttingDown | Self::Configuration { .. } | Self::InvalidTransition { .. } => {
                false
            },
        }
    }

    /// Whether the error only reflects an orderly shutdown.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::ShuttingDown)
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::ShuttingDown | CoreError::Closed { .. } => Self::ShuttingDown,
            CoreError::Endpoint { message } => Self::EndpointCallback { message },
            CoreError::Scheduling { message } => Self::Scheduling { message },
            CoreError::Broker { message } | CoreError::Transaction { message } => {
                Self::Broker { message }
            },
            CoreError::EndpointUnavailable { message } => {
                Self::Broker { message: format!("endpoint unavailable: {message}") }
            },
        }
    }
}

/// Category of delivery error for logs and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection establishment.
    Connect,
    /// Transaction demarcation.
    Transaction,
    /// Application callback.
    Endpoint,
    /// Poison-message remediation.
    Poison,
    /// Expected teardown noise.
    Shutdown,
    /// Operator configuration.
    Configuration,
    /// Broker or scheduler runtime faults.
    Runtime,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::Connect { .. } => Self::Connect,
            DeliveryError::Demarcation { .. } => Self::Transaction,
            DeliveryError::EndpointCallback { .. }
            | DeliveryError::EndpointCreationTimeout { .. } => Self::Endpoint,
            DeliveryError::PoisonAction { .. } => Self::Poison,
            DeliveryError::ShuttingDown => Self::Shutdown,
            DeliveryError::Configuration { .. } | DeliveryError::InvalidTransition { .. } => {
                Self::Configuration
            },
            DeliveryError::Broker { .. }
            | DeliveryError::Scheduling { .. }
            | DeliveryError::Internal { .. } => Self::Runtime,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Transaction => write!(f, "transaction"),
            Self::Endpoint => write!(f, "endpoint"),
            Self::Poison => write!(f, "poison"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Configuration => write!(f, "configuration"),
            Self::Runtime => write!(f, "runtime"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_is_not_retryable_noise() {
        let error = DeliveryError::ShuttingDown;
        assert!(error.is_shutdown());
        assert!(!error.is_retryable());
        assert_eq!(ErrorCategory::from(&error), ErrorCategory::Shutdown);
    }

    #[test]
    fn configuration_errors_need_operator() {
        let error = DeliveryError::configuration("batch size must be at least 1");
        assert!(!error.is_retryable());
        assert_eq!(error.to_string(), "invalid configuration: batch size must be at least 1");
    }

    #[test]
    fn core_errors_map_onto_taxonomy() {
        assert!(DeliveryError::from(CoreError::closed("session")).is_shutdown());
        assert!(matches!(
            DeliveryError::from(CoreError::endpoint("boom")),
            DeliveryError::EndpointCallback { .. }
        ));
        assert!(matches!(
            DeliveryError::from(CoreError::scheduling("full")),
            DeliveryError::Scheduling { .. }
        ));
    }

    #[test]
    fn demarcation_message_names_phase() {
        let error = DeliveryError::before_delivery("no transaction");
        assert_eq!(error.to_string(), "before_delivery failed: no transaction");
        assert_eq!(ErrorCategory::from(&error).to_string(), "transaction");
    }

    #[test]
    fn invalid_transition_reports_state() {
        let error = DeliveryError::invalid_transition("start", "disconnecting");
        assert_eq!(error.to_string(), "cannot start while disconnecting");
    }
}
