//! Activation lifecycle events.
//!
//! The supervisor and the poison tracker publish what they do as
//! [`ActivationEvent`]s. Handlers are invoked synchronously from the
//! publishing context and must not call back into the activation.
//!
//! ```text
//!  ConnectionSupervisor ──StateChanged/ReconnectFailed──┐
//!                                                      ▼
//!  PoisonMessageTracker ──Delayed/Moved/Deleted──▶ MulticastEventHandler ──▶ handlers
//! ```

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::models::{Destination, MessageId};

/// Connection lifecycle state of an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection and no delivery strategy.
    Disconnected,
    /// A background task is establishing a connection.
    Connecting,
    /// A delivery strategy is running.
    Connected,
    /// The delivery strategy is being deactivated.
    Disconnecting,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal supervisor transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{Connected, Connecting, Disconnected, Disconnecting};
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// Something observable that happened to an activation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationEvent {
    /// The supervisor changed state.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// A connect attempt failed and will be retried.
    ReconnectFailed {
        /// One-based attempt number.
        attempt: u32,
        /// Delay before the next attempt.
        retry_in: Duration,
        /// Failure description.
        error: String,
    },
    /// A redelivered message was held back before delivery.
    MessageDelayed {
        /// Message identifier.
        message_id: MessageId,
        /// Encounter count that triggered the delay.
        encounter: u32,
        /// Delay applied.
        delay: Duration,
    },
    /// A redelivered message was moved instead of delivered.
    MessageMoved {
        /// Message identifier.
        message_id: MessageId,
        /// Encounter count that triggered the move.
        encounter: u32,
        /// Where the message went.
        target: Destination,
    },
    /// A redelivered message was consumed without delivery.
    MessageDeleted {
        /// Message identifier.
        message_id: MessageId,
        /// Encounter count that triggered the delete.
        encounter: u32,
    },
}

/// Receives activation events.
pub trait EventHandler: Send + Sync {
    /// Handles one event.
    fn handle_event(&self, event: &ActivationEvent);
}

/// Handler that discards events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventHandler;

impl EventHandler for NoOpEventHandler {
    fn handle_event(&self, _event: &ActivationEvent) {}
}

/// Fans events out to several handlers in registration order.
#[derive(Default, Clone)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates an empty multicast handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler.
    pub fn add_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl EventHandler for MulticastEventHandler {
    fn handle_event(&self, event: &ActivationEvent) {
        for handler in &self.handlers {
            handler.handle_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<ActivationEvent>>);

    impl EventHandler for Collect {
        fn handle_event(&self, event: &ActivationEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn legal_transitions_match_state_table() {
        use ConnectionState::*;
        let all = [Disconnected, Connecting, Connected, Disconnecting];
        let legal: Vec<_> = all
            .iter()
            .flat_map(|from| all.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();

        assert_eq!(
            legal,
            vec![
                (Disconnected, Connecting),
                (Connecting, Disconnected),
                (Connecting, Connected),
                (Connected, Disconnecting),
                (Disconnecting, Disconnected),
            ]
        );
        assert!(!Disconnecting.can_transition_to(Connecting));
    }

    #[test]
    fn multicast_delivers_to_every_handler() {
        let first = Arc::new(Collect::default());
        let second = Arc::new(Collect::default());
        let mut multicast = MulticastEventHandler::new();
        multicast.add_handler(first.clone());
        multicast.add_handler(second.clone());

        multicast.handle_event(&ActivationEvent::MessageDeleted {
            message_id: MessageId::from("m-9"),
            encounter: 3,
        });

        assert_eq!(multicast.handler_count(), 2);
        assert_eq!(first.0.lock().unwrap().len(), 1);
        assert_eq!(second.0.lock().unwrap().len(), 1);
    }
}
