// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Every failure the messaging core can surface, grouped by the layer that raises it.
//! `AmqpError` covers the broker (connection, topology, publish, subscription, ack),
//! `EnvelopeError` the wire codec, `HandlerError` business handlers, `ConsumeError`
//! the outcome of a single delivery and `RequestError` the request/reply call.

use std::time::Duration;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connection and channel variants are retried once through a reconnect before being
/// surfaced; declare and bind variants are fatal during topology setup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing (or re-establishing) a connection to the broker
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error removing a queue binding
    #[error("failure to unbind queue `{1}` from exchange `{0}`")]
    UnbindingQueueError(String, String),

    /// Error deleting a queue
    #[error("failure to delete queue `{0}`")]
    DeleteQueueError(String),

    /// Error publishing a message
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to subscribe consumer `{0}`")]
    SubscriptionError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl AmqpError {
    /// True for the variants that indicate the connection or channel is gone.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, AmqpError::ConnectionError | AmqpError::ChannelError)
    }
}

/// Errors raised while encoding or decoding an event envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The body parsed but is not a valid envelope: missing type, bad timestamp,
    /// payload not an object. Redelivery cannot fix it.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The body could not be read at all (truncated or corrupted in transit).
    #[error("unreadable envelope: {0}")]
    Unreadable(String),

    /// The envelope could not be serialized.
    #[error("failure to encode envelope: {0}")]
    Encode(String),
}

impl EnvelopeError {
    /// Whether a redelivery could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EnvelopeError::Unreadable(_))
    }
}

/// Errors returned by business event handlers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    /// A payload key the handler requires is absent.
    #[error("missing payload field `{0}`")]
    MissingField(String),

    /// The payload does not match the shape the handler expects.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("handler cancelled")]
    Cancelled,
}

/// What the consumer runtime must do with a delivery once its handler finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    Reject,
}

/// Outcome of handling a single delivery that did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumeError {
    #[error(transparent)]
    Serialization(#[from] EnvelopeError),

    /// No exact or pattern handler is registered for the event type.
    #[error("no handler registered for event type `{0}`")]
    DispatchMiss(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The handler ran but its reply could not be published.
    #[error("failure to publish reply: {0}")]
    Reply(AmqpError),
}

impl ConsumeError {
    /// Maps the failure onto an acknowledgement decision.
    ///
    /// Dispatch misses and structurally invalid bodies are rejected without requeue.
    /// A transiently unreadable body is requeued once: `redelivered` deliveries are
    /// rejected. Handler and reply failures are always requeued.
    pub fn disposition(&self, redelivered: bool) -> Disposition {
        match self {
            ConsumeError::Serialization(err) if err.is_transient() && !redelivered => {
                Disposition::Requeue
            }
            ConsumeError::Serialization(_) | ConsumeError::DispatchMiss(_) => Disposition::Reject,
            ConsumeError::Handler(_) | ConsumeError::Reply(_) => Disposition::Requeue,
        }
    }
}

/// Errors surfaced by a synchronous request/reply call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// No matching reply arrived before the deadline.
    #[error("timeout waiting for response after {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the wait.
    #[error("request cancelled while waiting for response")]
    Cancelled,

    /// The request could not be published.
    #[error("failure to publish request: {0}")]
    Publish(AmqpError),

    /// Reply queue setup failed or the reply stream was lost.
    #[error("transport failure: {0}")]
    Transport(AmqpError),

    /// The remote handler replied with `success = false`.
    #[error("remote handler failed: {0}")]
    Remote(String),

    /// The request could not be encoded or the reply could not be decoded.
    #[error("failure to decode response: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_bodies_and_misses_are_never_requeued() {
        let malformed = ConsumeError::from(EnvelopeError::Malformed("missing field `type`".into()));
        assert_eq!(malformed.disposition(false), Disposition::Reject);
        assert_eq!(malformed.disposition(true), Disposition::Reject);

        let miss = ConsumeError::DispatchMiss("audit.created".into());
        assert_eq!(miss.disposition(false), Disposition::Reject);
    }

    #[test]
    fn unreadable_bodies_are_requeued_once() {
        let err = ConsumeError::from(EnvelopeError::Unreadable("EOF while parsing".into()));
        assert_eq!(err.disposition(false), Disposition::Requeue);
        assert_eq!(err.disposition(true), Disposition::Reject);
    }

    #[test]
    fn handler_failures_are_always_requeued() {
        let err = ConsumeError::from(HandlerError::Failed("db down".into()));
        assert_eq!(err.disposition(false), Disposition::Requeue);
        assert_eq!(err.disposition(true), Disposition::Requeue);
    }
}
