//! Schedulable delivery units for the concurrent-pull strategy.
//!
//! A [`WorkUnit`] owns one broker session, one endpoint handle and one move
//! connection. The unit body travels by value between the idle pool and the
//! task running it; a shared [`WorkUnitControl`] stays with the pool so
//! deactivation can track units it does not currently hold.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use sluice_core::{BrokerSession, Message};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    endpoint::EndpointHandle,
    transaction::{BatchOutcome, MoveConnection, TransactionalDelivery},
};

/// Lifecycle of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkUnitState {
    /// In the idle pool.
    Idle,
    /// Handed out for delivery.
    Running,
    /// Endpoint released; the unit is gone.
    Destroyed,
}

impl fmt::Display for WorkUnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct ControlState {
    state: WorkUnitState,
    destroy_pending: bool,
}

/// What a destroy request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyRequest {
    /// The unit is idle; the caller holds it and must destroy it now.
    Immediate,
    /// The unit is running; it destroys itself when the run ends.
    Deferred,
    /// The unit was already destroyed or a destroy is already pending.
    AlreadyRequested,
}

/// State shared between a unit body and its pool.
#[derive(Debug)]
pub struct WorkUnitControl {
    id: u64,
    inner: Mutex<ControlState>,
}

impl WorkUnitControl {
    fn new(id: u64) -> Self {
        Self {
            id,
            inner: Mutex::new(ControlState { state: WorkUnitState::Idle, destroy_pending: false }),
        }
    }

    /// Pool-local identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> WorkUnitState {
        self.inner.lock().state
    }

    /// Whether the unit has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.state() == WorkUnitState::Destroyed
    }

    /// Idle to Running. Fails for destroyed units and units with a pending
    /// destroy.
    pub fn try_dispatch(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != WorkUnitState::Idle || inner.destroy_pending {
            return false;
        }
        inner.state = WorkUnitState::Running;
        true
    }

    /// Running to Idle. Returns false when a destroy was requested during
    /// the run; the caller must then destroy the unit.
    pub fn finish_run(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == WorkUnitState::Running {
            inner.state = WorkUnitState::Idle;
        }
        !inner.destroy_pending
    }

    /// Requests destruction. Repeated requests are no-ops.
    pub fn request_destroy(&self) -> DestroyRequest {
        let mut inner = self.inner.lock();
        if inner.destroy_pending || inner.state == WorkUnitState::Destroyed {
            return DestroyRequest::AlreadyRequested;
        }
        inner.destroy_pending = true;
        match inner.state {
            WorkUnitState::Idle => DestroyRequest::Immediate,
            WorkUnitState::Running | WorkUnitState::Destroyed => DestroyRequest::Deferred,
        }
    }

    fn mark_destroyed(&self) {
        let mut inner = self.inner.lock();
        inner.state = WorkUnitState::Destroyed;
        inner.destroy_pending = false;
    }
}

/// Session, endpoint and move connection used for one delivery at a time.
pub struct WorkUnit {
    control: Arc<WorkUnitControl>,
    session: Arc<dyn BrokerSession>,
    endpoint: Option<EndpointHandle>,
    mover: MoveConnection,
}

impl WorkUnit {
    /// Assembles a unit from freshly created resources.
    pub fn new(
        id: u64,
        session: Arc<dyn BrokerSession>,
        endpoint: EndpointHandle,
        mover: MoveConnection,
    ) -> Self {
        Self {
            control: Arc::new(WorkUnitControl::new(id)),
            session,
            endpoint: Some(endpoint),
            mover,
        }
    }

    /// Shared control block.
    pub fn control(&self) -> &Arc<WorkUnitControl> {
        &self.control
    }

    /// The unit's broker session.
    pub fn session(&self) -> &Arc<dyn BrokerSession> {
        &self.session
    }

    /// Whether the endpoint was discarded and must be replaced before the
    /// next delivery.
    pub fn needs_endpoint(&self) -> bool {
        self.endpoint.is_none()
    }

    /// Installs a replacement endpoint.
    pub fn set_endpoint(&mut self, endpoint: EndpointHandle) {
        if let Some(previous) = self.endpoint.replace(endpoint) {
            previous.release();
        }
    }

    /// Releases the current endpoint so it is not reused.
    pub fn discard_endpoint(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            debug!(unit = self.control.id, "discarding endpoint");
            endpoint.release();
        }
    }

    /// Delivers `messages` loaded into this unit's session.
    pub async fn run(
        &mut self,
        core: &TransactionalDelivery,
        messages: Vec<Message>,
        stopping: &CancellationToken,
    ) -> BatchOutcome {
        let Some(endpoint) = &self.endpoint else {
            if let Err(e) = self.session.rollback().await {
                debug!(unit = self.control.id, error = %e, "rollback without endpoint failed");
            }
            return BatchOutcome { received: messages.len(), ..BatchOutcome::default() };
        };

        let outcome =
            core.deliver_batch(endpoint, &self.session, &mut self.mover, messages, stopping).await;
        if outcome.discard_endpoint {
            self.discard_endpoint();
        }
        outcome
    }

    /// Releases the endpoint and closes the move connection. The session is
    /// left to the pool, which closes every session at teardown.
    pub async fn destroy(mut self) {
        self.discard_endpoint();
        self.mover.close().await;
        self.control.mark_destroyed();
        debug!(unit = self.control.id, "work unit destroyed");
    }
}

impl fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkUnit")
            .field("id", &self.control.id)
            .field("state", &self.control.state())
            .field("has_endpoint", &self.endpoint.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_and_finish_cycle() {
        let control = WorkUnitControl::new(1);
        assert!(control.try_dispatch());
        assert_eq!(control.state(), WorkUnitState::Running);
        assert!(!control.try_dispatch());
        assert!(control.finish_run());
        assert_eq!(control.state(), WorkUnitState::Idle);
    }

    #[test]
    fn destroy_while_running_is_deferred() {
        let control = WorkUnitControl::new(1);
        control.try_dispatch();

        assert_eq!(control.request_destroy(), DestroyRequest::Deferred);
        assert_eq!(control.request_destroy(), DestroyRequest::AlreadyRequested);
        assert!(!control.finish_run());

        control.mark_destroyed();
        assert!(control.is_destroyed());
        assert_eq!(control.request_destroy(), DestroyRequest::AlreadyRequested);
    }

    #[test]
    fn idle_unit_is_destroyed_immediately() {
        let control = WorkUnitControl::new(1);
        assert_eq!(control.request_destroy(), DestroyRequest::Immediate);
        assert!(!control.try_dispatch());
    }
}
