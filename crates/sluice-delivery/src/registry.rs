//! Explicit registry of running activations.
//!
//! The registry is an ordinary value owned by the host. Nothing here is
//! process-global.

use std::{collections::HashMap, fmt};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::supervisor::ConnectionSupervisor;

/// Identifies a registered activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivationId(pub Uuid);

impl ActivationId {
    /// Creates a random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ActivationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActivationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ActivationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Activations keyed by id.
#[derive(Default)]
pub struct ActivationRegistry {
    activations: RwLock<HashMap<ActivationId, ConnectionSupervisor>>,
}

impl ActivationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `supervisor` under a fresh id.
    pub fn register(&self, supervisor: ConnectionSupervisor) -> ActivationId {
        let id = ActivationId::new();
        self.activations.write().insert(id, supervisor);
        id
    }

    /// Looks up an activation.
    pub fn get(&self, id: ActivationId) -> Option<ConnectionSupervisor> {
        self.activations.read().get(&id).cloned()
    }

    /// Removes an activation without stopping it.
    pub fn remove(&self, id: ActivationId) -> Option<ConnectionSupervisor> {
        self.activations.write().remove(&id)
    }

    /// Registered ids.
    pub fn ids(&self) -> Vec<ActivationId> {
        self.activations.read().keys().copied().collect()
    }

    /// Number of registered activations.
    pub fn len(&self) -> usize {
        self.activations.read().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.activations.read().is_empty()
    }

    /// Stops every registered activation and empties the registry.
    pub async fn stop_all(&self) {
        let activations: Vec<(ActivationId, ConnectionSupervisor)> =
            self.activations.write().drain().collect();
        for (id, supervisor) in activations {
            info!(activation_id = %id, destination = %supervisor.config().destination(), "stopping activation");
            supervisor.stop().await;
        }
    }
}

impl fmt::Debug for ActivationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationRegistry").field("activations", &self.len()).finish()
    }
}
