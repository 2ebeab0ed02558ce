// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Abstraction
//!
//! The broker primitives the messaging core is written against: declare, bind, publish,
//! consume and reconnect. `channel::AmqpConnection` implements them over lapin and
//! `memory::MemoryBroker` in-process.
//!
//! Inbound deliveries carry their own acknowledger, and `ack`/`nack` consume the
//! delivery, so each delivery is settled at most once by construction.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, fmt};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A header, exchange argument or queue argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    String(String),
    Bool(bool),
    Int(i32),
    LongLong(i64),
}

impl HeaderValue {
    /// The value as a string slice.
    ///
    /// # Returns
    /// `Some` for string values, `None` for every other variant
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

/// Message headers and declaration arguments.
pub type Arguments = BTreeMap<String, HeaderValue>;

/// Message properties carried outside the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    /// AMQP `type` property; the event type for envelopes.
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    pub priority: Option<u8>,
    /// Delivery mode 2 when set.
    pub persistent: bool,
    pub headers: Arguments,
}

impl MessageProperties {
    /// Looks up a string header.
    ///
    /// # Parameters
    /// * `key` - The header name
    ///
    /// # Returns
    /// The header value, or `None` when it is missing or not a string
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(HeaderValue::as_str)
    }

    /// Sets a header, replacing any previous value under `key`.
    ///
    /// # Parameters
    /// * `key` - The header name
    /// * `value` - The header value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    /// Sets the MIME content type of the body.
    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    /// Sets the AMQP `type` property.
    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    /// Sets the id a reply must echo back.
    pub fn with_correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    /// Sets the queue replies are sent to.
    pub fn with_reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    /// Sets the message priority, honoured by queues declared with a max priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Marks the message persistent so durable queues keep it across broker restarts.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
}

impl OutboundMessage {
    /// Creates a message with default properties.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange; empty for the default exchange
    /// * `routing_key` - Routing key, or the queue name on the default exchange
    /// * `data` - The message body
    pub fn new(exchange: &str, routing_key: &str, data: Vec<u8>) -> Self {
        OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: MessageProperties::default(),
            data,
        }
    }

    /// Replaces the message properties.
    pub fn with_properties(mut self, properties: MessageProperties) -> Self {
        self.properties = properties;
        self
    }
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// Acknowledger for deliveries consumed in auto-ack mode; the broker already settled them.
pub(crate) struct AutoAcked;

#[async_trait]
impl Acknowledger for AutoAcked {
    async fn ack(&self) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), AmqpError> {
        Ok(())
    }
}

/// A message received from a subscription.
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl InboundDelivery {
    /// Wraps a received message with the acknowledger that settles it.
    pub fn new(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        redelivered: bool,
        properties: MessageProperties,
        data: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        InboundDelivery {
            delivery_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered,
            properties,
            data,
            acker,
        }
    }

    /// Acknowledges the delivery, consuming it.
    pub async fn ack(self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    /// Rejects the delivery.
    ///
    /// # Parameters
    /// * `requeue` - Return the message to its queue when true; otherwise the queue's
    ///   dead-letter arguments decide where it goes
    pub async fn nack(self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Deliveries of one subscription. The stream ends when the channel is lost.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Subscription parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub queue: String,
    pub consumer_tag: String,
    /// Unacknowledged deliveries the broker may push ahead; 0 is unlimited.
    pub prefetch: u16,
    pub auto_ack: bool,
    pub exclusive: bool,
}

impl ConsumeOptions {
    /// Manual acknowledgement, one delivery in flight at a time.
    pub fn manual(queue: &str, consumer_tag: &str) -> Self {
        ConsumeOptions {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            prefetch: 1,
            auto_ack: false,
            exclusive: false,
        }
    }

    /// Exclusive auto-ack subscription, as used for private reply queues.
    pub fn auto_ack(queue: &str, consumer_tag: &str) -> Self {
        ConsumeOptions {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            prefetch: 0,
            auto_ack: true,
            exclusive: true,
        }
    }
}

/// Broker primitives shared by every component of a process.
///
/// Implementations detect a lost channel on any operation and attempt exactly one
/// reconnect before surfacing the failure.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares an exchange with the definition's kind, flags and arguments.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns its name, which the broker generates when the
    /// definition's name is empty.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    /// Binds a queue to an exchange. Binding twice with the same key is a no-op.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Removes a binding created by [`Transport::bind_queue`].
    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError>;

    /// Publishes a message.
    async fn publish(&self, message: OutboundMessage) -> Result<(), AmqpError>;

    /// Opens a subscription.
    ///
    /// # Returns
    /// A stream of deliveries that ends when the channel is lost
    async fn consume(&self, options: &ConsumeOptions) -> Result<DeliveryStream, AmqpError>;

    /// Re-dials with the original parameters; a no-op while connected.
    async fn reconnect(&self) -> Result<(), AmqpError>;

    /// Whether both the connection and the channel are open.
    fn is_connected(&self) -> bool;
}
