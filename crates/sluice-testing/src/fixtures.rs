//! Message builders for tests.

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sluice_core::{Destination, Message, MessageId, PropertyValue};
use uuid::Uuid;

/// Builder for broker messages.
pub struct MessageBuilder {
    id: Option<MessageId>,
    destination: Destination,
    body: Bytes,
    redelivered: bool,
    delivery_count: u32,
    timestamp: Option<DateTime<Utc>>,
    properties: BTreeMap<String, PropertyValue>,
}

impl MessageBuilder {
    /// Starts a first-delivery message on `destination`.
    pub fn new(destination: Destination) -> Self {
        Self {
            id: None,
            destination,
            body: Bytes::from_static(b"{}"),
            redelivered: false,
            delivery_count: 1,
            timestamp: None,
            properties: BTreeMap::new(),
        }
    }

    /// Sets the message id. Defaults to a random one.
    #[must_use]
    pub fn id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Marks the message redelivered with the given broker count.
    #[must_use]
    pub fn redelivered(mut self, delivery_count: u32) -> Self {
        self.redelivered = true;
        self.delivery_count = delivery_count;
        self
    }

    /// Sets the original timestamp.
    #[must_use]
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Adds a property.
    #[must_use]
    pub fn property(mut self, name: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Builds the message.
    pub fn build(self) -> Message {
        let id = self.id.unwrap_or_else(|| MessageId::new(format!("msg-{}", Uuid::new_v4().simple())));
        let mut message =
            Message::new(id, self.destination, self.body, self.timestamp.unwrap_or_else(Utc::now));
        message.redelivered = self.redelivered;
        message.delivery_count = self.delivery_count;
        message.properties = self.properties;
        message
    }
}
