// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Dispatcher
//!
//! Routes decoded envelopes to business handlers. Handlers are registered for an exact
//! event type or for a prefix pattern ending in `*`. Exact matches always win; patterns
//! are tried in registration order and the first match handles the event. An event
//! nothing matches is a dispatch miss, rejected without requeue.
//!
//! `EventDispatcher` is the delivery handler consumers run: it decodes the body,
//! dispatches it and, when the delivery names a reply queue, publishes the handler's
//! result back under the request's correlation id.

use crate::{
    consumer::DeliveryHandler,
    envelope::{EventEnvelope, ReplyEnvelope},
    errors::{ConsumeError, HandlerError},
    transport::{InboundDelivery, MessageProperties, OutboundMessage, Transport, JSON_CONTENT_TYPE},
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde_json::Value;
use std::{collections::HashMap, future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Marker closing a pattern registration, e.g. `user.registered.*`.
pub const PATTERN_WILDCARD: char = '*';

/// What a handler gets besides the event: cancellation of the consumer that received
/// it and the trace context it was published under.
#[derive(Clone, Debug)]
pub struct HandlerContext {
    cancel: CancellationToken,
    trace: Context,
}

impl HandlerContext {
    pub fn new(cancel: CancellationToken, trace: Context) -> Self {
        HandlerContext { cancel, trace }
    }

    /// A context no consumer will cancel.
    pub fn detached() -> Self {
        HandlerContext::new(CancellationToken::new(), Context::new())
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn trace(&self) -> &Context {
        &self.trace
    }
}

/// A business event handler. The returned value is the reply for request/reply calls.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &HandlerContext, event: &EventEnvelope) -> Result<Value, HandlerError>;
}

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(HandlerContext, EventEnvelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, ctx: &HandlerContext, event: &EventEnvelope) -> Result<Value, HandlerError> {
        (self.0)(ctx.clone(), event.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(HandlerContext, EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Clone)]
struct PatternHandler {
    pattern: String,
    prefix: String,
    handler: Arc<dyn EventHandler>,
}

/// Event type to handler mapping, owned by whoever builds the consumers.
#[derive(Clone, Default)]
pub struct DispatchRegistry {
    exact: HashMap<String, Arc<dyn EventHandler>>,
    patterns: Vec<PatternHandler>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        DispatchRegistry::default()
    }

    /// Registers `handler` for events whose type is exactly `kind`, replacing any
    /// previous exact registration.
    pub fn register_exact(mut self, kind: &str, handler: Arc<dyn EventHandler>) -> Self {
        self.exact.insert(kind.to_owned(), handler);
        self
    }

    /// Registers `handler` for event types starting with `pattern` minus its trailing
    /// wildcard. A pattern without wildcard is used as the prefix as is.
    pub fn register_pattern(mut self, pattern: &str, handler: Arc<dyn EventHandler>) -> Self {
        let prefix = pattern
            .strip_suffix(PATTERN_WILDCARD)
            .unwrap_or(pattern)
            .to_owned();

        self.patterns.push(PatternHandler {
            pattern: pattern.to_owned(),
            prefix,
            handler,
        });
        self
    }

    /// The handler an event of type `kind` is dispatched to.
    pub fn resolve(&self, kind: &str) -> Option<&Arc<dyn EventHandler>> {
        if let Some(handler) = self.exact.get(kind) {
            return Some(handler);
        }

        self.patterns
            .iter()
            .find(|p| kind.starts_with(&p.prefix))
            .map(|p| {
                debug!(event_type = kind, pattern = p.pattern, "pattern handler matched");
                &p.handler
            })
    }

    pub async fn dispatch(
        &self,
        ctx: &HandlerContext,
        event: &EventEnvelope,
    ) -> Result<Value, ConsumeError> {
        let Some(handler) = self.resolve(event.kind()) else {
            return Err(ConsumeError::DispatchMiss(event.kind().to_owned()));
        };

        handler.handle(ctx, event).await.map_err(ConsumeError::from)
    }
}

/// Decodes deliveries, dispatches them and publishes replies.
pub struct EventDispatcher {
    registry: Arc<DispatchRegistry>,
    transport: Arc<dyn Transport>,
}

impl EventDispatcher {
    pub fn new(registry: DispatchRegistry, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(EventDispatcher {
            registry: Arc::new(registry),
            transport,
        })
    }

    pub fn registry(&self) -> &DispatchRegistry {
        &self.registry
    }

    /// Publishes the outcome to the delivery's reply queue through the default exchange.
    async fn reply(
        &self,
        delivery: &InboundDelivery,
        reply_to: &str,
        result: &Result<Value, ConsumeError>,
    ) -> Result<(), ConsumeError> {
        let body = match result {
            Ok(data) => ReplyEnvelope::ok(data.clone()),
            Err(err) => ReplyEnvelope::failed(&err.to_string()),
        };
        let data = serde_json::to_vec(&body).map_err(|err| {
            ConsumeError::Handler(HandlerError::Failed(format!(
                "failure to marshal response: {err}"
            )))
        })?;

        let mut properties = MessageProperties::default().with_content_type(JSON_CONTENT_TYPE);
        properties.correlation_id = delivery.properties.correlation_id.clone();

        self.transport
            .publish(OutboundMessage::new("", reply_to, data).with_properties(properties))
            .await
            .map_err(|err| {
                error!(error = err.to_string(), reply_to, "error publishing reply");
                ConsumeError::Reply(err)
            })
    }
}

#[async_trait]
impl DeliveryHandler for EventDispatcher {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        delivery: &InboundDelivery,
    ) -> Result<(), ConsumeError> {
        let event = EventEnvelope::decode(&delivery.data).map_err(|err| {
            warn!(
                error = err.to_string(),
                routing_key = delivery.routing_key,
                "failure to decode event"
            );
            ConsumeError::from(err)
        })?;

        debug!(
            event_type = event.kind(),
            exchange = delivery.exchange,
            "received event"
        );

        let result = self.registry.dispatch(ctx, &event).await;

        match &result {
            Err(ConsumeError::DispatchMiss(kind)) => warn!(
                event_type = kind,
                "removing message from queue - reason: unsupported msg type"
            ),
            Err(err) => error!(
                error = err.to_string(),
                event_type = event.kind(),
                "error handling event"
            ),
            Ok(_) => debug!(event_type = event.kind(), "event successfully processed"),
        }

        if let Some(reply_to) = delivery.properties.reply_to.as_deref() {
            self.reply(delivery, reply_to, &result).await?;
        }

        result.map(|_| ())
    }
}
