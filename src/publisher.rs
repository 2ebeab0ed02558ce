// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes events to exchanges, fire-and-forget or as a synchronous request. Every
//! message is persistent, carries a fresh message id, a timestamp, the caller's trace
//! context and, when given, the `hash-on` header a consistent-hash exchange routes by.
//!
//! A request declares a private auto-deleting reply queue, publishes with `reply_to`
//! and a new correlation id, and waits for the matching reply until the timeout
//! elapses or the caller cancels. Replies with another correlation id are discarded.

use crate::{
    envelope::{EventEnvelope, ReplyEnvelope},
    errors::{AmqpError, RequestError},
    exchange::HASH_ON_HEADER,
    otel,
    queue::QueueDefinition,
    transport::{
        ConsumeOptions, DeliveryStream, InboundDelivery, MessageProperties, OutboundMessage,
        Transport, JSON_CONTENT_TYPE,
    },
};
use chrono::Utc;
use futures_util::StreamExt;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Reply wait used when the caller gives no timeout.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// An outstanding request, alive until its reply arrives or its deadline passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub correlation_id: String,
    pub reply_queue: String,
    pub deadline: Instant,
}

impl PendingRequest {
    fn new(reply_queue: String, timeout: Duration) -> Self {
        PendingRequest {
            correlation_id: Uuid::new_v4().to_string(),
            reply_queue,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn matches(&self, delivery: &InboundDelivery) -> bool {
        delivery.properties.correlation_id.as_deref() == Some(self.correlation_id.as_str())
    }
}

/// Where and how [`RabbitMQPublisher::publish_event`] sends an envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub exchange: String,
    /// Defaults to the envelope type.
    pub routing_key: Option<String>,
    pub hash_key: String,
    pub wait_response: bool,
    pub timeout: Option<Duration>,
    pub priority: Option<u8>,
}

impl PublishOptions {
    pub fn new(exchange: &str, hash_key: &str) -> Self {
        PublishOptions {
            exchange: exchange.to_owned(),
            hash_key: hash_key.to_owned(),
            ..Default::default()
        }
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    /// Waits for the reply, up to `timeout` or the default when `None`.
    pub fn wait_response(mut self, timeout: Option<Duration>) -> Self {
        self.wait_response = true;
        self.timeout = timeout;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Publisher over the shared transport.
pub struct RabbitMQPublisher {
    transport: Arc<dyn Transport>,
}

impl RabbitMQPublisher {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { transport })
    }

    /// Publishes a JSON `body` routed by `hash_key`.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        hash_key: &str,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        let properties = hashed_properties(hash_key).with_kind(routing_key);
        self.publish_raw(exchange, routing_key, properties, body)
            .await
    }

    /// Publishes `body` with caller-built properties. The message id and timestamp are
    /// filled in when absent; delivery is always persistent.
    pub async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        mut properties: MessageProperties,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        properties.persistent = true;
        if properties.content_type.is_none() {
            properties.content_type = Some(JSON_CONTENT_TYPE.to_owned());
        }
        if properties.message_id.is_none() {
            properties.message_id = Some(Uuid::new_v4().to_string());
        }
        if properties.timestamp.is_none() {
            properties.timestamp = u64::try_from(Utc::now().timestamp()).ok();
        }
        otel::inject(&Context::current(), &mut properties.headers);

        let message =
            OutboundMessage::new(exchange, routing_key, body.to_vec()).with_properties(properties);

        match self.transport.publish(message).await {
            Err(err) => {
                error!(error = err.to_string(), exchange, routing_key, "error publishing message");
                Err(err)
            }
            _ => {
                debug!(exchange, routing_key, "message published");
                Ok(())
            }
        }
    }

    /// Publishes `body` and waits for the reply body, returned unmodified.
    ///
    /// Fails with `Timeout` when no matching reply arrives within `timeout`
    /// (default [`DEFAULT_REPLY_TIMEOUT`]) and with `Cancelled` when `ctx` is cancelled
    /// first. The reply queue is deleted on every path, so late replies are dropped.
    pub async fn publish_and_await(
        &self,
        ctx: &CancellationToken,
        exchange: &str,
        routing_key: &str,
        hash_key: &str,
        body: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, RequestError> {
        let properties = hashed_properties(hash_key).with_kind(routing_key);
        self.request_raw(ctx, exchange, routing_key, properties, body, timeout)
            .await
    }

    /// Sends `event` as a request and decodes the `{"success", "data", "error"}` reply.
    pub async fn request<T: DeserializeOwned>(
        &self,
        ctx: &CancellationToken,
        exchange: &str,
        hash_key: &str,
        event: &EventEnvelope,
        timeout: Option<Duration>,
    ) -> Result<T, RequestError> {
        let body = event
            .encode()
            .map_err(|err| RequestError::Decode(err.to_string()))?;

        let reply = self
            .publish_and_await(ctx, exchange, event.kind(), hash_key, &body, timeout)
            .await?;

        decode_reply(&reply)
    }

    /// Publishes `event` as described by `opts`. Returns the reply body when
    /// `opts.wait_response` is set.
    pub async fn publish_event(
        &self,
        ctx: &CancellationToken,
        event: &EventEnvelope,
        opts: &PublishOptions,
    ) -> Result<Option<Vec<u8>>, RequestError> {
        let body = event
            .encode()
            .map_err(|err| RequestError::Decode(err.to_string()))?;
        let routing_key = opts.routing_key.as_deref().unwrap_or(event.kind());

        let mut properties = hashed_properties(&opts.hash_key).with_kind(event.kind());
        properties.priority = opts.priority;

        if !opts.wait_response {
            return self
                .publish_raw(&opts.exchange, routing_key, properties, &body)
                .await
                .map(|_| None)
                .map_err(RequestError::Publish);
        }

        self.request_raw(ctx, &opts.exchange, routing_key, properties, &body, opts.timeout)
            .await
            .map(Some)
    }

    async fn request_raw(
        &self,
        ctx: &CancellationToken,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, RequestError> {
        let timeout = timeout.unwrap_or(DEFAULT_REPLY_TIMEOUT);

        if ctx.is_cancelled() {
            debug!("request cancelled before publishing");
            return Err(RequestError::Cancelled);
        }

        let reply_queue = self
            .transport
            .declare_queue(&QueueDefinition::new("").delete().exclusive())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failed to declare reply queue");
                RequestError::Transport(err)
            })?;
        let pending = PendingRequest::new(reply_queue, timeout);

        let result = self
            .send_and_wait(ctx, &pending, exchange, routing_key, properties, body, timeout)
            .await;

        if let Err(err) = self.transport.delete_queue(&pending.reply_queue).await {
            warn!(
                error = err.to_string(),
                reply_queue = pending.reply_queue,
                "failure to delete reply queue"
            );
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_and_wait(
        &self,
        ctx: &CancellationToken,
        pending: &PendingRequest,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, RequestError> {
        let consumer_tag = format!("reply-{}", pending.correlation_id);
        let replies = self
            .transport
            .consume(&ConsumeOptions::auto_ack(&pending.reply_queue, &consumer_tag))
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failed to register reply consumer");
                RequestError::Transport(err)
            })?;

        let properties = properties
            .with_reply_to(&pending.reply_queue)
            .with_correlation_id(&pending.correlation_id);

        if ctx.is_cancelled() {
            debug!(correlation_id = pending.correlation_id, "request cancelled before publishing");
            return Err(RequestError::Cancelled);
        }
        self.publish_raw(exchange, routing_key, properties, body)
            .await
            .map_err(RequestError::Publish)?;

        await_reply(ctx, pending, replies, timeout).await
    }
}

async fn await_reply(
    ctx: &CancellationToken,
    pending: &PendingRequest,
    mut replies: DeliveryStream,
    timeout: Duration,
) -> Result<Vec<u8>, RequestError> {
    let deadline = tokio::time::sleep_until(pending.deadline);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;

            _ = ctx.cancelled() => {
                debug!(correlation_id = pending.correlation_id, "request cancelled");
                return Err(RequestError::Cancelled);
            }

            _ = &mut deadline => {
                warn!(correlation_id = pending.correlation_id, "timeout waiting for response");
                return Err(RequestError::Timeout(timeout));
            }

            next = replies.next() => match next {
                Some(Ok(delivery)) if pending.matches(&delivery) => {
                    return Ok(delivery.data);
                }
                Some(Ok(delivery)) => {
                    warn!(
                        expected = pending.correlation_id,
                        received = ?delivery.properties.correlation_id,
                        "discarding reply with unexpected correlation id"
                    );
                }
                Some(Err(err)) => return Err(RequestError::Transport(err)),
                None => return Err(RequestError::Transport(AmqpError::ConnectionError)),
            },
        }
    }
}

fn hashed_properties(hash_key: &str) -> MessageProperties {
    let properties = MessageProperties::default().with_content_type(JSON_CONTENT_TYPE);
    if hash_key.is_empty() {
        return properties;
    }
    properties.with_header(HASH_ON_HEADER, hash_key)
}

fn decode_reply<T: DeserializeOwned>(body: &[u8]) -> Result<T, RequestError> {
    let reply: ReplyEnvelope<T> =
        serde_json::from_slice(body).map_err(|err| RequestError::Decode(err.to_string()))?;

    if !reply.success {
        return Err(RequestError::Remote(reply.error));
    }

    reply
        .data
        .ok_or_else(|| RequestError::Decode("missing response data".to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AutoAcked, MockTransport};
    use futures_util::stream;
    use serde_json::{json, Map, Value};

    fn reply(correlation_id: &str, body: &[u8]) -> InboundDelivery {
        InboundDelivery::new(
            1,
            "",
            "amq.gen-reply",
            false,
            MessageProperties::default().with_correlation_id(correlation_id),
            body.to_vec(),
            Box::new(AutoAcked),
        )
    }

    fn reply_queue_transport() -> MockTransport {
        let mut transport = MockTransport::new();
        transport
            .expect_declare_queue()
            .withf(|def| def.name().is_empty() && def.is_exclusive() && def.is_auto_delete())
            .times(1)
            .returning(|_| Ok("amq.gen-reply".to_owned()));
        transport
            .expect_delete_queue()
            .withf(|name| name == "amq.gen-reply")
            .times(1)
            .returning(|_| Ok(()));
        transport
    }

    #[tokio::test]
    async fn publish_sets_hash_header_and_persistence() {
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .withf(|msg| {
                msg.exchange == "hashed.events"
                    && msg.routing_key == "user.registered"
                    && msg.properties.header(HASH_ON_HEADER) == Some("batch-1")
                    && msg.properties.persistent
                    && msg.properties.message_id.is_some()
                    && msg.properties.timestamp.is_some()
                    && msg.properties.kind.as_deref() == Some("user.registered")
                    && msg.properties.content_type.as_deref() == Some(JSON_CONTENT_TYPE)
            })
            .times(1)
            .returning(|_| Ok(()));

        let publisher = RabbitMQPublisher::new(Arc::new(transport));
        publisher
            .publish("hashed.events", "user.registered", "batch-1", b"{}")
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn request_without_reply_times_out_after_the_configured_duration() {
        let mut transport = reply_queue_transport();
        transport
            .expect_consume()
            .withf(|opts| opts.auto_ack && opts.exclusive && opts.queue == "amq.gen-reply")
            .returning(|_| {
                Ok(stream::iter(vec![Ok(reply("stale", b"old"))])
                    .chain(stream::pending())
                    .boxed())
            });
        transport.expect_publish().times(1).returning(|msg| {
            assert_eq!(msg.properties.reply_to.as_deref(), Some("amq.gen-reply"));
            assert!(msg.properties.correlation_id.is_some());
            Ok(())
        });

        let publisher = RabbitMQPublisher::new(Arc::new(transport));
        let started = Instant::now();
        let result = publisher
            .publish_and_await(
                &CancellationToken::new(),
                "hashed.events",
                "transaction",
                "wallet-1",
                b"{}",
                Some(Duration::from_secs(3)),
            )
            .await;

        assert_eq!(result, Err(RequestError::Timeout(Duration::from_secs(3))));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_distinct_from_timeout() {
        let mut transport = reply_queue_transport();
        transport
            .expect_consume()
            .returning(|_| Ok(stream::pending().boxed()));
        transport.expect_publish().returning(|_| Ok(()));

        let publisher = RabbitMQPublisher::new(Arc::new(transport));
        let ctx = CancellationToken::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result = publisher
            .publish_and_await(&ctx, "hashed.events", "transaction", "k", b"{}", None)
            .await;
        assert_eq!(result, Err(RequestError::Cancelled));
    }

    #[tokio::test]
    async fn cancelled_request_touches_nothing_on_the_broker() {
        let transport = MockTransport::new();
        let publisher = RabbitMQPublisher::new(Arc::new(transport));
        let ctx = CancellationToken::new();
        ctx.cancel();

        let result = publisher
            .publish_and_await(&ctx, "hashed.events", "transaction", "k", b"{}", None)
            .await;
        assert_eq!(result, Err(RequestError::Cancelled));
    }

    #[tokio::test]
    async fn publish_failure_still_removes_the_reply_queue() {
        let mut transport = reply_queue_transport();
        transport
            .expect_consume()
            .returning(|_| Ok(stream::pending().boxed()));
        transport
            .expect_publish()
            .returning(|msg| Err(AmqpError::PublishingError(msg.exchange)));

        let publisher = RabbitMQPublisher::new(Arc::new(transport));
        let result = publisher
            .publish_and_await(&CancellationToken::new(), "hashed.events", "transaction", "k", b"{}", None)
            .await;

        assert_eq!(
            result,
            Err(RequestError::Publish(AmqpError::PublishingError("hashed.events".into())))
        );
    }

    #[tokio::test]
    async fn publish_event_without_wait_uses_envelope_type_as_routing_key() {
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .withf(|msg| msg.routing_key == "wallet.created" && msg.properties.priority == Some(5))
            .times(1)
            .returning(|_| Ok(()));

        let publisher = RabbitMQPublisher::new(Arc::new(transport));
        let event = EventEnvelope::new("wallet.created", Map::new());
        let reply = publisher
            .publish_event(
                &CancellationToken::new(),
                &event,
                &PublishOptions::new("hashed.events", "user-1").priority(5),
            )
            .await;

        assert_eq!(reply, Ok(None));
    }

    #[test]
    fn remote_failures_surface_as_remote_errors() {
        let failed = br#"{"success":false,"data":null,"error":"insufficient funds"}"#;
        assert_eq!(
            decode_reply::<Value>(failed),
            Err(RequestError::Remote("insufficient funds".into()))
        );

        let ok = br#"{"success":true,"data":{"balance":10},"error":""}"#;
        assert_eq!(decode_reply::<Value>(ok), Ok(json!({"balance": 10})));

        assert!(matches!(decode_reply::<Value>(b"nope"), Err(RequestError::Decode(_))));
    }
}
