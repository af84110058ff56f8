//! Batch completion coordination.
//!
//! In the default mode a batch completes as soon as the last callback
//! returns. With hold-until-ack the transaction stays open until the endpoint
//! has acknowledged every delivered message, possibly from another task.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use sluice_core::{Acknowledger, Clock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Selects how a batch waits before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchCoordinator {
    /// Complete immediately after delivery.
    Immediate,
    /// Hold the transaction until every delivered message is acknowledged.
    HoldUntilAck,
}

impl BatchCoordinator {
    /// Coordinator for the activation's hold-until-ack setting.
    pub fn new(hold_until_ack: bool) -> Self {
        if hold_until_ack {
            Self::HoldUntilAck
        } else {
            Self::Immediate
        }
    }

    /// Starts a batch. Returns a latch only when acknowledgements are
    /// awaited.
    pub fn begin_batch(self) -> Option<AckLatch> {
        match self {
            Self::Immediate => None,
            Self::HoldUntilAck => Some(AckLatch::new()),
        }
    }
}

/// How an acknowledgement wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckWait {
    /// Every expected acknowledgement arrived.
    Complete,
    /// Shutdown was observed first.
    Interrupted,
}

/// Counts acknowledgements for one batch.
#[derive(Debug, Clone)]
pub struct AckLatch {
    acks: Arc<Semaphore>,
}

impl AckLatch {
    fn new() -> Self {
        Self { acks: Arc::new(Semaphore::new(0)) }
    }

    /// Acknowledger attached to one delivered message.
    pub fn token(&self) -> Arc<dyn Acknowledger> {
        Arc::new(AckToken { acks: self.acks.clone(), acknowledged: AtomicBool::new(false) })
    }

    /// Acknowledgements received and not yet consumed by a wait.
    pub fn received(&self) -> usize {
        self.acks.available_permits()
    }

    /// Waits until `expected` acknowledgements arrived, re-checking
    /// `stopping` every `poll`.
    pub async fn wait(
        &self,
        expected: usize,
        stopping: &CancellationToken,
        poll: Duration,
        clock: &dyn Clock,
    ) -> AckWait {
        let Ok(expected) = u32::try_from(expected) else {
            return AckWait::Interrupted;
        };
        if expected == 0 {
            return AckWait::Complete;
        }

        loop {
            tokio::select! {
                permits = self.acks.acquire_many(expected) => {
                    return match permits {
                        Ok(permits) => {
                            permits.forget();
                            AckWait::Complete
                        },
                        Err(_) => AckWait::Interrupted,
                    };
                },
                () = clock.sleep(poll) => {},
            }

            if stopping.is_cancelled() {
                debug!(
                    expected,
                    received = self.received(),
                    "shutdown while waiting for acknowledgements"
                );
                return AckWait::Interrupted;
            }
        }
    }
}

struct AckToken {
    acks: Arc<Semaphore>,
    acknowledged: AtomicBool,
}

impl Acknowledger for AckToken {
    fn acknowledge(&self) {
        if !self.acknowledged.swap(true, Ordering::AcqRel) {
            self.acks.add_permits(1);
        }
    }
}

impl fmt::Debug for AckToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckToken")
            .field("acknowledged", &self.acknowledged.load(Ordering::Acquire))
            .finish()
    }
}
