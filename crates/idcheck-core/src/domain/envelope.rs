//! Message envelope carried by the bus.
//!
//! The body is opaque bytes (UTF-8 JSON in practice). Routing metadata lives in
//! `MessageProperties` and is never inspected by business logic beyond being
//! copied verbatim.

/// Transport-level properties of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Caller-chosen token linking a request to its reply.
    pub correlation_id: Option<String>,

    /// Queue the reply should be published to.
    pub reply_to: Option<String>,

    /// Survive broker restarts (only meaningful for durable queues).
    pub persistent: bool,
}

impl MessageProperties {
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// A message as published by a producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl OutgoingMessage {
    pub fn new(body: Vec<u8>, properties: MessageProperties) -> Self {
        Self { body, properties }
    }
}

/// A message as seen by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,

    /// Set when the broker hands the message out again after its first
    /// delivery was never acknowledged.
    pub redelivered: bool,
}

impl Message {
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }
}
