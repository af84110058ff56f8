//! Message model and strongly-typed identifiers.
//!
//! The delivery core never interprets message payloads. It only reads the
//! envelope: identity, destination, redelivery markers and the property map
//! through which redelivery diagnostics flow back and forth between the core
//! and the endpoint callback.

use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known message property names.
///
/// Properties in this namespace are stamped by the delivery core or read back
/// from a message after the endpoint callback returns.
pub mod properties {
    /// Number of times the poison tracker has seen this message redelivered.
    pub const REDELIVERY_COUNT: &str = "sluice.redelivery.count";
    /// Name of the destination the message was consumed from.
    pub const ORIGINAL_DESTINATION_NAME: &str = "sluice.original.destination.name";
    /// Kind (`queue` or `topic`) of the original destination.
    pub const ORIGINAL_DESTINATION_TYPE: &str = "sluice.original.destination.type";
    /// RFC 3339 timestamp of the original message.
    pub const ORIGINAL_TIMESTAMP: &str = "sluice.original.timestamp";
    /// Durable subscription name, if any.
    pub const SUBSCRIBER_NAME: &str = "sluice.subscriber.name";
    /// Name of the activation context that moved the message.
    pub const CONTEXT_NAME: &str = "sluice.context.name";
    /// Zero-based position of the message inside its batch.
    pub const BATCH_INDEX: &str = "sluice.batch.index";
    /// Number of messages in the batch.
    pub const BATCH_SIZE: &str = "sluice.batch.size";
    /// Set by the callback to replace the action table for this encounter.
    pub const REDELIVERY_HANDLING: &str = "sluice.redelivery.handling";
    /// Set by the callback to ask the activation to stop.
    pub const STOP_CONNECTOR: &str = "sluice.stop.connector";
    /// Prefix for callback-owned state carried across redeliveries.
    pub const STATE_PREFIX: &str = "sluice.state.";
}

/// Broker-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Creates an identifier from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Messaging domain of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    /// Point-to-point queue.
    #[default]
    Queue,
    /// Publish-subscribe topic.
    Topic,
}

impl DestinationKind {
    /// Returns the lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Topic => "topic",
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DestinationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "topic" => Ok(Self::Topic),
            other => Err(format!("unknown destination type '{other}'")),
        }
    }
}

/// Whether sessions take part in two-phase commit or commit locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxMode {
    /// Work is enlisted with an external transaction manager.
    TwoPhase,
    /// Work is committed or rolled back on the session itself.
    Local,
}

/// Messaging domain resolved once per strategy instance.
///
/// Replaces per-call dispatch on queue/topic and transactional flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Domain {
    /// Queue or topic.
    pub kind: DestinationKind,
    /// Transactional flavor of sessions in this domain.
    pub tx_mode: TxMode,
}

impl Domain {
    /// Resolves the domain from the destination kind and whether two-phase
    /// delivery is both supported by the broker and required by the endpoint.
    pub fn resolve(kind: DestinationKind, two_phase: bool) -> Self {
        let tx_mode = if two_phase { TxMode::TwoPhase } else { TxMode::Local };
        Self { kind, tx_mode }
    }

    /// Returns true when delivery must be demarcated by the container.
    pub fn is_two_phase(&self) -> bool {
        self.tx_mode == TxMode::TwoPhase
    }
}

/// A named queue or topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    /// Messaging domain.
    pub kind: DestinationKind,
    /// Broker-visible name.
    pub name: String,
}

impl Destination {
    /// Creates a destination.
    pub fn new(kind: DestinationKind, name: impl Into<String>) -> Self {
        Self { kind, name: name.into() }
    }

    /// Creates a queue destination.
    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Queue, name)
    }

    /// Creates a topic destination.
    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Topic, name)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Value stored in a message property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Text value.
    Text(String),
}

impl PropertyValue {
    /// Interprets the value as a flag: `true`, non-zero integers and
    /// non-empty text other than `false` all count as set.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(flag) => *flag,
            Self::Int(value) => *value != 0,
            Self::Text(text) => {
                let text = text.trim();
                !text.is_empty() && !text.eq_ignore_ascii_case("false")
            },
        }
    }

    /// Returns the text content if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the integer content if this is an integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(flag) => write!(f, "{flag}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Text(text) => f.write_str(text),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(flag: bool) -> Self {
        Self::Bool(flag)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// Receiver of explicit acknowledgements in hold-until-ack mode.
pub trait Acknowledger: Send + Sync + fmt::Debug {
    /// Records that the endpoint finished with the message.
    ///
    /// Repeated calls for the same message count once.
    fn acknowledge(&self);
}

/// A message pulled from the broker.
#[derive(Debug, Clone)]
pub struct Message {
    /// Broker-assigned identifier.
    pub id: MessageId,
    /// Destination the message was consumed from.
    pub destination: Destination,
    /// Set by the broker when this is not the first delivery.
    pub redelivered: bool,
    /// Broker-side delivery counter (1 for the first delivery).
    pub delivery_count: u32,
    /// When the message was originally produced.
    pub timestamp: DateTime<Utc>,
    /// Application and diagnostic properties.
    pub properties: BTreeMap<String, PropertyValue>,
    /// Opaque payload.
    pub body: Bytes,
    end_of_batch: bool,
    acknowledger: Option<Arc<dyn Acknowledger>>,
}

impl Message {
    /// Creates a first-delivery message.
    pub fn new(
        id: impl Into<MessageId>,
        destination: Destination,
        body: impl Into<Bytes>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            destination,
            redelivered: false,
            delivery_count: 1,
            timestamp,
            properties: BTreeMap::new(),
            body: body.into(),
            end_of_batch: false,
            acknowledger: None,
        }
    }

    /// Creates the synthetic marker delivered after the last message of a
    /// batch so the endpoint can finalize it.
    pub fn end_of_batch(destination: Destination, timestamp: DateTime<Utc>) -> Self {
        let mut marker = Self::new(MessageId::new(""), destination, Bytes::new(), timestamp);
        marker.end_of_batch = true;
        marker
    }

    /// Returns true for the synthetic end-of-batch marker.
    pub fn is_end_of_batch(&self) -> bool {
        self.end_of_batch
    }

    /// Returns a property value.
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    /// Sets a property, replacing any previous value.
    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(name.into(), value.into());
    }

    /// Removes a property and returns its previous value.
    pub fn remove_property(&mut self, name: &str) -> Option<PropertyValue> {
        self.properties.remove(name)
    }

    /// Attaches the acknowledger used in hold-until-ack mode.
    pub fn set_acknowledger(&mut self, acknowledger: Arc<dyn Acknowledger>) {
        self.acknowledger = Some(acknowledger);
    }

    /// Acknowledges the message.
    ///
    /// A no-op unless the activation holds transactions until acknowledgement.
    pub fn acknowledge(&self) {
        if let Some(acknowledger) = &self.acknowledger {
            acknowledger.acknowledge();
        }
    }
}

/// Identifies the execution context a transaction is associated with.
///
/// One context exists per delivery window; the transaction manager keys its
/// thread-association bookkeeping on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub Uuid);

impl ContextId {
    /// Creates a new random context ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a transaction handed across contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    /// Creates a new random transaction ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct CountingAck(AtomicUsize);

    impl Acknowledger for CountingAck {
        fn acknowledge(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn domain_resolution_follows_two_phase_flag() {
        let domain = Domain::resolve(DestinationKind::Topic, true);
        assert!(domain.is_two_phase());
        assert_eq!(domain.kind, DestinationKind::Topic);
        assert_eq!(Domain::resolve(DestinationKind::Queue, false).tx_mode, TxMode::Local);
    }

    #[test]
    fn destination_kind_parses_case_insensitively() {
        assert_eq!("Queue".parse::<DestinationKind>(), Ok(DestinationKind::Queue));
        assert_eq!(" topic ".parse::<DestinationKind>(), Ok(DestinationKind::Topic));
        assert!("mailbox".parse::<DestinationKind>().is_err());
    }

    #[test]
    fn truthiness_of_property_values() {
        assert!(PropertyValue::from(true).is_truthy());
        assert!(PropertyValue::from("yes").is_truthy());
        assert!(PropertyValue::from(1).is_truthy());
        assert!(!PropertyValue::from("FALSE").is_truthy());
        assert!(!PropertyValue::from("").is_truthy());
        assert!(!PropertyValue::from(0).is_truthy());
    }

    #[test]
    fn acknowledge_without_acknowledger_is_noop() {
        let message = Message::new("m-1", Destination::queue("orders"), "x", Utc::now());
        message.acknowledge();
        assert!(!message.is_end_of_batch());
    }

    #[test]
    fn acknowledge_reaches_attached_acknowledger() {
        let ack = Arc::new(CountingAck::default());
        let mut message = Message::new("m-1", Destination::queue("orders"), "x", Utc::now());
        message.set_acknowledger(ack.clone());

        let copy = message.clone();
        copy.acknowledge();

        assert_eq!(ack.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn end_of_batch_marker_is_flagged() {
        let marker = Message::end_of_batch(Destination::queue("orders"), Utc::now());
        assert!(marker.is_end_of_batch());
        assert!(marker.body.is_empty());
    }

    #[test]
    fn property_values_serialize_untagged() {
        let json = serde_json::to_string(&PropertyValue::from(7)).unwrap();
        assert_eq!(json, "7");
        let back: PropertyValue = serde_json::from_str("\"dlq\"").unwrap();
        assert_eq!(back, PropertyValue::from("dlq"));
    }
}
