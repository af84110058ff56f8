//! Per-activation poison-message tracking.
//!
//! Each redelivered message id gets an [`Encounter`] counting how often it
//! has been seen. The encounter's cursor walks the [`ActionTable`] as the
//! count crosses thresholds, and the action under the cursor decides whether
//! the message reaches the endpoint.
//!
//! Encounters live in a two-generation cache. New and recently seen ids go
//! into the current generation; when it fills up it becomes the previous
//! generation and the old previous generation is dropped wholesale. This is
//! an approximate LRU bounded by the configured lookback size.
//!
//! Bookkeeping happens under the tracker's lock; the action itself (sleeping,
//! sending to another destination) runs outside it.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use sluice_core::{
    properties, ActivationEvent, Clock, Destination, EventHandler, Message, MessageId,
    PropertyValue,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::actions::{ActionTable, RedeliveryAction};
use crate::error::{DeliveryError, Result};

/// Sends poison messages to another destination.
#[async_trait]
pub trait MessageMover: Send {
    /// Sends a broker-made copy of `original` carrying `stamp` to `target`.
    async fn copy_and_send(
        &mut self,
        original: &Message,
        target: &Destination,
        stamp: &BTreeMap<String, PropertyValue>,
    ) -> sluice_core::Result<()>;

    /// Re-sends `original` itself, with `stamp` applied, to `target`.
    async fn redirect(
        &mut self,
        original: &Message,
        target: &Destination,
        stamp: &BTreeMap<String, PropertyValue>,
    ) -> sluice_core::Result<()>;
}

/// Tracker tuning taken from the activation configuration.
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    /// Approximate number of encounters retained.
    pub lookback: usize,
    /// Re-send the original on move instead of copying it.
    pub redirect: bool,
    /// Durable subscription name stamped on moved messages.
    pub subscriber_name: Option<String>,
    /// Activation context name stamped on moved messages.
    pub context_name: String,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            lookback: 5000,
            redirect: false,
            subscriber_name: None,
            context_name: "sluice".to_string(),
        }
    }
}

/// What the tracker remembers about one redelivered message.
#[derive(Debug, Clone, Default)]
pub struct Encounter {
    /// How many redelivered sightings have been seen.
    pub count: u32,
    /// Index of the current entry in the effective action table.
    pub cursor: usize,
    /// Callback-owned properties carried across redeliveries.
    pub state: BTreeMap<String, PropertyValue>,
    /// Table set by the callback for this message only.
    pub table_override: Option<Arc<ActionTable>>,
}

#[derive(Debug)]
struct EncounterCache {
    current: HashMap<MessageId, Encounter>,
    previous: HashMap<MessageId, Encounter>,
    generation_capacity: usize,
}

impl EncounterCache {
    fn new(lookback: usize) -> Self {
        Self {
            current: HashMap::new(),
            previous: HashMap::new(),
            generation_capacity: lookback.div_ceil(2).max(1),
        }
    }

    /// Runs `f` on the encounter for `id`, creating or promoting it into the
    /// current generation. Returns whether the encounter was new.
    fn upsert<R>(&mut self, id: &MessageId, f: impl FnOnce(&mut Encounter) -> R) -> (R, bool) {
        if let Some(encounter) = self.current.get_mut(id) {
            return (f(encounter), false);
        }

        let (mut encounter, created) = match self.previous.remove(id) {
            Some(encounter) => (encounter, false),
            None => (Encounter::default(), true),
        };
        let result = f(&mut encounter);
        self.current.insert(id.clone(), encounter);

        if self.current.len() >= self.generation_capacity {
            self.previous = std::mem::take(&mut self.current);
        }
        (result, created)
    }

    fn get(&self, id: &MessageId) -> Option<&Encounter> {
        self.current.get(id).or_else(|| self.previous.get(id))
    }

    fn get_mut(&mut self, id: &MessageId) -> Option<&mut Encounter> {
        match self.current.get_mut(id) {
            Some(encounter) => Some(encounter),
            None => self.previous.get_mut(id),
        }
    }

    fn len(&self) -> usize {
        self.current.len() + self.previous.len()
    }
}

/// Counters for poison-message remediation.
#[derive(Debug, Default)]
pub struct PoisonStats {
    delays: AtomicU64,
    moves: AtomicU64,
    deletes: AtomicU64,
    encounters: AtomicU64,
}

/// Point-in-time copy of [`PoisonStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoisonStatsSnapshot {
    /// Messages held back by a delay action.
    pub delays: u64,
    /// Messages moved to another destination.
    pub moves: u64,
    /// Messages consumed without delivery.
    pub deletes: u64,
    /// Encounters created.
    pub encounters: u64,
}

impl PoisonStats {
    /// Returns the current counter values.
    pub fn snapshot(&self) -> PoisonStatsSnapshot {
        PoisonStatsSnapshot {
            delays: self.delays.load(Ordering::Relaxed),
            moves: self.moves.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            encounters: self.encounters.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        self.delays.store(0, Ordering::Relaxed);
        self.moves.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.encounters.store(0, Ordering::Relaxed);
    }
}

struct Plan {
    encounter: u32,
    action: RedeliveryAction,
    state: BTreeMap<String, PropertyValue>,
}

/// Decides whether redelivered messages reach the endpoint.
pub struct PoisonMessageTracker {
    origin: Destination,
    table: Arc<ActionTable>,
    settings: TrackerSettings,
    cache: Mutex<EncounterCache>,
    stats: PoisonStats,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventHandler>,
}

impl PoisonMessageTracker {
    /// Creates a tracker for messages consumed from `origin`.
    pub fn new(
        origin: Destination,
        table: ActionTable,
        settings: TrackerSettings,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            origin,
            table: Arc::new(table),
            cache: Mutex::new(EncounterCache::new(settings.lookback)),
            settings,
            stats: PoisonStats::default(),
            clock,
            events,
        }
    }

    /// Remediation counters.
    pub fn stats(&self) -> &PoisonStats {
        &self.stats
    }

    /// Configured action table.
    pub fn table(&self) -> &ActionTable {
        &self.table
    }

    /// Copy of the encounter tracked for `id`, if still retained.
    pub fn encounter(&self, id: &MessageId) -> Option<Encounter> {
        self.cache.lock().get(id).cloned()
    }

    /// Number of retained encounters.
    pub fn tracked(&self) -> usize {
        self.cache.lock().len()
    }

    /// Decides whether `message` should be handed to the endpoint.
    ///
    /// First deliveries pass without bookkeeping. Redeliveries bump their
    /// encounter and run the action under its cursor. Returns `Ok(false)` when
    /// the message was consumed by a move or delete instead.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::PoisonAction`] when a move fails on both the
    /// copy and the redirect path.
    pub async fn should_deliver(
        &self,
        mover: &mut dyn MessageMover,
        message: &mut Message,
        stopping: &CancellationToken,
    ) -> Result<bool> {
        if !message.redelivered {
            return Ok(true);
        }

        let (plan, created) = {
            let mut cache = self.cache.lock();
            cache.upsert(&message.id, |encounter| {
                encounter.count = encounter.count.saturating_add(1);
                let table = encounter.table_override.as_ref().unwrap_or(&self.table);
                encounter.cursor = table.advance(encounter.cursor, encounter.count);
                Plan {
                    encounter: encounter.count,
                    action: table.entry(encounter.cursor).action.clone(),
                    state: encounter.state.clone(),
                }
            })
        };
        if created {
            self.stats.encounters.fetch_add(1, Ordering::Relaxed);
        }

        message.set_property(properties::REDELIVERY_COUNT, i64::from(plan.encounter));
        for (name, value) in &plan.state {
            message.set_property(name.clone(), value.clone());
        }

        match plan.action {
            RedeliveryAction::NoOp => Ok(true),
            RedeliveryAction::Delay(delay) => {
                self.delay(message, plan.encounter, delay, stopping).await;
                Ok(true)
            },
            RedeliveryAction::Delete => {
                self.stats.deletes.fetch_add(1, Ordering::Relaxed);
                info!(
                    message_id = %message.id,
                    encounter = plan.encounter,
                    destination = %self.origin,
                    "deleting poison message"
                );
                self.events.handle_event(&ActivationEvent::MessageDeleted {
                    message_id: message.id.clone(),
                    encounter: plan.encounter,
                });
                Ok(false)
            },
            RedeliveryAction::Move(target) => {
                self.move_message(mover, message, &target, plan.encounter).await?;
                Ok(false)
            },
        }
    }

    /// Reads redelivery state and a table override back from a message the
    /// endpoint callback has processed.
    pub fn absorb_callback_properties(&self, message: &Message) {
        if !message.redelivered {
            return;
        }

        let state: BTreeMap<String, PropertyValue> = message
            .properties
            .iter()
            .filter(|(name, _)| name.starts_with(properties::STATE_PREFIX))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let table_override = match message.property(properties::REDELIVERY_HANDLING) {
            Some(PropertyValue::Text(spec)) => match ActionTable::parse(spec, &self.origin) {
                Ok(table) => Some(Arc::new(table)),
                Err(e) => {
                    warn!(
                        message_id = %message.id,
                        override_spec = %spec,
                        error = %e,
                        "ignoring invalid redelivery handling override"
                    );
                    None
                },
            },
            _ => None,
        };

        let mut cache = self.cache.lock();
        if let Some(encounter) = cache.get_mut(&message.id) {
            encounter.state = state;
            if let Some(table) = table_override {
                debug!(message_id = %message.id, table = %table, "redelivery handling overridden");
                encounter.cursor = table.advance(0, encounter.count);
                encounter.table_override = Some(table);
            }
        }
    }

    async fn delay(
        &self,
        message: &Message,
        encounter: u32,
        delay: Duration,
        stopping: &CancellationToken,
    ) {
        self.stats.delays.fetch_add(1, Ordering::Relaxed);
        debug!(
            message_id = %message.id,
            encounter,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "delaying redelivered message"
        );
        self.events.handle_event(&ActivationEvent::MessageDelayed {
            message_id: message.id.clone(),
            encounter,
            delay,
        });

        tokio::select! {
            () = self.clock.sleep(delay) => {},
            () = stopping.cancelled() => {
                debug!(message_id = %message.id, "delay cut short by shutdown");
            },
        }
    }

    async fn move_message(
        &self,
        mover: &mut dyn MessageMover,
        message: &Message,
        target: &Destination,
        encounter: u32,
    ) -> Result<()> {
        let stamp = self.move_stamp(message, encounter);

        let moved = if self.settings.redirect {
            mover.redirect(message, target, &stamp).await
        } else {
            match mover.copy_and_send(message, target, &stamp).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!(
                        message_id = %message.id,
                        target = %target,
                        error = %e,
                        "copying poison message failed, redirecting original"
                    );
                    mover.redirect(message, target, &stamp).await
                },
            }
        };

        match moved {
            Ok(()) => {
                self.stats.moves.fetch_add(1, Ordering::Relaxed);
                info!(
                    message_id = %message.id,
                    encounter,
                    from = %self.origin,
                    to = %target,
                    "moved poison message"
                );
                self.events.handle_event(&ActivationEvent::MessageMoved {
                    message_id: message.id.clone(),
                    encounter,
                    target: target.clone(),
                });
                Ok(())
            },
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    encounter,
                    target = %target,
                    error = %e,
                    "poison message could not be moved"
                );
                Err(DeliveryError::poison_action(message.id.to_string(), e.to_string()))
            },
        }
    }

    fn move_stamp(&self, message: &Message, encounter: u32) -> BTreeMap<String, PropertyValue> {
        let mut stamp = BTreeMap::new();
        stamp.insert(properties::REDELIVERY_COUNT.to_string(), i64::from(encounter).into());
        stamp.insert(
            properties::ORIGINAL_DESTINATION_NAME.to_string(),
            message.destination.name.clone().into(),
        );
        stamp.insert(
            properties::ORIGINAL_DESTINATION_TYPE.to_string(),
            message.destination.kind.as_str().into(),
        );
        stamp.insert(
            properties::ORIGINAL_TIMESTAMP.to_string(),
            message.timestamp.to_rfc3339().into(),
        );
        if let Some(subscriber) = &self.settings.subscriber_name {
            stamp.insert(properties::SUBSCRIBER_NAME.to_string(), subscriber.clone().into());
        }
        stamp.insert(
            properties::CONTEXT_NAME.to_string(),
            self.settings.context_name.clone().into(),
        );
        stamp
    }
}
