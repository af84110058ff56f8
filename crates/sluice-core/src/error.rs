//! Errors raised by collaborators at the delivery core's boundary.
//!
//! Brokers, endpoint factories, transaction managers and schedulers all report
//! failures through [`CoreError`]. The delivery crate maps these onto its own
//! taxonomy when deciding whether to retry, roll back or reconnect.

use thiserror::Error;

/// Result type alias for collaborator operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Failures reported by external collaborators.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// The endpoint factory cannot create an endpoint right now.
    ///
    /// Raised during redeploy races; callers retry until a deadline.
    #[error("endpoint temporarily unavailable: {message}")]
    EndpointUnavailable {
        /// Detail supplied by the factory
        message: String,
    },

    /// The broker rejected an operation or the link to it failed.
    #[error("broker error: {message}")]
    Broker {
        /// Broker-supplied detail
        message: String,
    },

    /// A transaction manager or transactional resource failed.
    #[error("transaction error: {message}")]
    Transaction {
        /// Transaction failure detail
        message: String,
    },

    /// The endpoint callback raised an error.
    #[error("endpoint error: {message}")]
    Endpoint {
        /// Error reported by the callback
        message: String,
    },

    /// The host scheduler refused a unit of work.
    #[error("scheduling rejected: {message}")]
    Scheduling {
        /// Reason given by the scheduler
        message: String,
    },

    /// The object was used after being closed.
    #[error("{resource} is closed")]
    Closed {
        /// Kind of resource that was closed
        resource: &'static str,
    },

    /// The operation raced with an orderly shutdown.
    #[error("shutting down")]
    ShuttingDown,
}

impl CoreError {
    /// Creates an endpoint-unavailable error.
    pub fn endpoint_unavailable(message: impl Into<String>) -> Self {
        Self::EndpointUnavailable { message: message.into() }
    }

    /// Creates a broker error.
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker { message: message.into() }
    }

    /// Creates a transaction error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction { message: message.into() }
    }

    /// Creates an endpoint callback error.
    pub fn endpoint(message: impl Into<String>) -> Self {
        Self::Endpoint { message: message.into() }
    }

    /// Creates a scheduling error.
    pub fn scheduling(message: impl Into<String>) -> Self {
        Self::Scheduling { message: message.into() }
    }

    /// Creates a closed-resource error.
    pub fn closed(resource: &'static str) -> Self {
        Self::Closed { resource }
    }

    /// Returns true for the transient endpoint-creation failure.
    pub fn is_endpoint_unavailable(&self) -> bool {
        matches!(self, Self::EndpointUnavailable { .. })
    }

    /// Returns true when the error only reflects an orderly shutdown.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Closed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_unavailable_is_distinguishable() {
        let error = CoreError::endpoint_unavailable("redeploying");
        assert!(error.is_endpoint_unavailable());
        assert!(!CoreError::broker("redeploying").is_endpoint_unavailable());
        assert_eq!(error.to_string(), "endpoint temporarily unavailable: redeploying");
    }

    #[test]
    fn closed_resources_count_as_shutdown_noise() {
        assert!(CoreError::closed("session").is_shutdown());
        assert!(CoreError::ShuttingDown.is_shutdown());
        assert!(!CoreError::transaction("heuristic rollback").is_shutdown());
    }
}
