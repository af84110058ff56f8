//! Event recording for deterministic lifecycle assertions.

use std::time::Duration;

use parking_lot::Mutex;
use sluice_core::{ActivationEvent, ConnectionState, EventHandler};
use tokio::sync::Notify;

use crate::DEFAULT_WAIT_TIMEOUT;

/// Records every activation event in publication order.
#[derive(Default)]
pub struct RecordingEventHandler {
    events: Mutex<Vec<ActivationEvent>>,
    notify: Notify,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event recorded so far.
    pub fn events(&self) -> Vec<ActivationEvent> {
        self.events.lock().clone()
    }

    /// Target states of every recorded state change.
    pub fn state_trace(&self) -> Vec<ConnectionState> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                ActivationEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    /// Number of recorded events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&ActivationEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }

    /// Number of failed reconnect attempts.
    pub fn reconnect_failures(&self) -> usize {
        self.count(|event| matches!(event, ActivationEvent::ReconnectFailed { .. }))
    }

    /// Number of times `state` was entered.
    pub fn entered(&self, state: ConnectionState) -> usize {
        self.state_trace().into_iter().filter(|to| *to == state).count()
    }

    /// Waits until `state` has been entered at least `times` times.
    ///
    /// Panics after [`DEFAULT_WAIT_TIMEOUT`].
    pub async fn wait_for_state(&self, state: ConnectionState, times: usize) {
        self.wait_until(DEFAULT_WAIT_TIMEOUT, || self.entered(state) >= times).await;
        assert!(self.entered(state) >= times);
    }

    /// Waits until `condition` holds, re-checking on every event.
    ///
    /// Panics when `timeout` elapses first.
    pub async fn wait_until(&self, timeout: Duration, condition: impl Fn() -> bool) {
        let result = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if condition() {
                    return;
                }
                notified.await;
            }
        })
        .await;

        if result.is_err() {
            panic!(
                "Condition not reached in time. Timeout: {:?}, State trace: {:?}",
                timeout,
                self.state_trace()
            );
        }
    }
}

impl EventHandler for RecordingEventHandler {
    fn handle_event(&self, event: &ActivationEvent) {
        self.events.lock().push(event.clone());
        self.notify.notify_waiters();
    }
}
