//! Poison-message detection and remediation.

pub mod actions;
pub mod tracker;

pub use actions::{ActionEntry, ActionParseError, ActionTable, RedeliveryAction};
pub use tracker::{
    Encounter, MessageMover, PoisonMessageTracker, PoisonStats, PoisonStatsSnapshot,
    TrackerSettings,
};
