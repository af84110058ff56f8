//! Endpoint leasing.
//!
//! Endpoints are created through the container's [`EndpointFactory`]. During
//! redeploys the factory briefly reports [`CoreError::EndpointUnavailable`];
//! the leaser retries on a fixed delay until a deadline, giving up early and
//! quietly if the strategy starts stopping.
//!
//! [`CoreError::EndpointUnavailable`]: sluice_core::CoreError::EndpointUnavailable

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use sluice_core::{Clock, EndpointFactory, MessageEndpoint, XaResource};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::SameRmPolicy,
    error::{DeliveryError, Result},
    stats::DeliveryStats,
};

/// An endpoint leased from the container.
///
/// Released at most once, explicitly or on drop.
pub struct EndpointHandle {
    endpoint: Arc<dyn MessageEndpoint>,
    resource: Option<Arc<dyn XaResource>>,
    released: AtomicBool,
    stats: Arc<DeliveryStats>,
}

impl EndpointHandle {
    /// The leased endpoint.
    pub fn endpoint(&self) -> &Arc<dyn MessageEndpoint> {
        &self.endpoint
    }

    /// The session resource the endpoint was created for.
    pub fn resource(&self) -> Option<&Arc<dyn XaResource>> {
        self.resource.as_ref()
    }

    /// Returns the endpoint to the container. Returns false if it had already
    /// been released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.endpoint.release();
        self.stats.endpoint_released();
        true
    }

    /// Whether the endpoint has been released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for EndpointHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointHandle")
            .field("released", &self.is_released())
            .field("has_resource", &self.resource.is_some())
            .finish()
    }
}

/// Resource wrapper that never claims to share a resource manager.
#[derive(Debug)]
struct DistinctRmResource {
    inner: Arc<dyn XaResource>,
}

#[async_trait]
impl XaResource for DistinctRmResource {
    fn resource_manager_id(&self) -> &str {
        self.inner.resource_manager_id()
    }

    fn is_same_rm(&self, _other: &dyn XaResource) -> bool {
        false
    }

    async fn commit(&self) -> sluice_core::Result<()> {
        self.inner.commit().await
    }

    async fn rollback(&self) -> sluice_core::Result<()> {
        self.inner.rollback().await
    }
}

/// Applies the resource-manager identity policy to a session resource.
pub fn apply_same_rm_policy(
    policy: SameRmPolicy,
    resource: Arc<dyn XaResource>,
) -> Arc<dyn XaResource> {
    match policy {
        SameRmPolicy::Delegate => resource,
        SameRmPolicy::NeverSame => Arc::new(DistinctRmResource { inner: resource }),
    }
}

/// Creates endpoint handles, retrying while the factory is unavailable.
pub struct EndpointLeaser {
    factory: Arc<dyn EndpointFactory>,
    stats: Arc<DeliveryStats>,
    policy: SameRmPolicy,
    creation_timeout: Duration,
    retry_delay: Duration,
    clock: Arc<dyn Clock>,
}

impl EndpointLeaser {
    /// Creates a leaser.
    pub fn new(
        factory: Arc<dyn EndpointFactory>,
        stats: Arc<DeliveryStats>,
        policy: SameRmPolicy,
        creation_timeout: Duration,
        retry_delay: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { factory, stats, policy, creation_timeout, retry_delay, clock }
    }

    /// Leases an endpoint bound to `resource`.
    ///
    /// Returns `Ok(None)` only when `stopping` was observed while retrying.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::EndpointCreationTimeout`] when the factory is
    /// still unavailable after the creation deadline, or the factory's error
    /// when it fails for any other reason.
    pub async fn lease(
        &self,
        resource: Option<Arc<dyn XaResource>>,
        stopping: &CancellationToken,
    ) -> Result<Option<EndpointHandle>> {
        let offered = resource.clone().map(|resource| apply_same_rm_policy(self.policy, resource));
        let started = self.clock.now();
        let mut attempts = 0_u32;

        loop {
            if stopping.is_cancelled() {
                return Ok(None);
            }
            attempts += 1;

            match self.factory.create_endpoint(offered.clone()).await {
                Ok(endpoint) => {
                    self.stats.endpoint_created();
                    if attempts > 1 {
                        debug!(attempts, "endpoint became available");
                    }
                    return Ok(Some(EndpointHandle {
                        endpoint,
                        resource,
                        released: AtomicBool::new(false),
                        stats: self.stats.clone(),
                    }));
                },
                Err(e) if e.is_endpoint_unavailable() => {
                    let waited = self.clock.now().duration_since(started);
                    if waited >= self.creation_timeout {
                        warn!(
                            attempts,
                            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                            error = %e,
                            "endpoint factory stayed unavailable"
                        );
                        return Err(DeliveryError::EndpointCreationTimeout { waited });
                    }
                    debug!(attempts, error = %e, "endpoint unavailable, retrying");

                    tokio::select! {
                        () = self.clock.sleep(self.retry_delay) => {},
                        () = stopping.cancelled() => return Ok(None),
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }
    }
}
