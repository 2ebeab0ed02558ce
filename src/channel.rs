// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Owns the single broker connection and channel shared by every component of the
//! process. Operations that find the channel or connection closed trigger one
//! reconnect, which discards the stale handles and re-dials with the original URI,
//! before the operation is retried once and any remaining failure is surfaced.

use crate::{
    config::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{
        Acknowledger, Arguments, AutoAcked, ConsumeOptions, DeliveryStream, HeaderValue,
        InboundDelivery, MessageProperties, OutboundMessage, Transport,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::BTreeMap,
    future::Future,
    sync::{Arc, RwLock},
};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

/// Delivery mode marking a message persistent
const PERSISTENT_DELIVERY_MODE: u8 = 2;

#[derive(Clone)]
struct AmqpHandles {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
}

impl AmqpHandles {
    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

/// A reconnecting AMQP connection with one channel.
pub struct AmqpConnection {
    uri: String,
    connection_name: String,
    handles: RwLock<Option<AmqpHandles>>,
    reconnecting: Mutex<()>,
}

impl AmqpConnection {
    /// Connects to the broker described by `cfg` and opens the shared channel.
    pub async fn connect(cfg: &RabbitMQConfigs) -> Result<Arc<AmqpConnection>, AmqpError> {
        let uri = cfg.uri();
        let handles = dial(&uri, &cfg.connection_name).await?;

        Ok(Arc::new(AmqpConnection {
            uri,
            connection_name: cfg.connection_name.clone(),
            handles: RwLock::new(Some(handles)),
            reconnecting: Mutex::new(()),
        }))
    }

    /// The active channel, reconnecting first if it has been lost.
    pub async fn channel(&self) -> Result<Arc<Channel>, AmqpError> {
        if let Some(handles) = self.current().filter(AmqpHandles::is_connected) {
            return Ok(handles.channel);
        }

        self.reconnect().await?;
        self.current()
            .map(|handles| handles.channel)
            .ok_or(AmqpError::ConnectionError)
    }

    /// Closes the channel and the connection. Only for orchestrated shutdown.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let Some(handles) = self.take() else {
            return Ok(());
        };

        let mut failed = false;
        if let Err(err) = handles.channel.close(200, "shutdown").await {
            error!(error = err.to_string(), "error closing channel");
            failed = true;
        }
        if let Err(err) = handles.connection.close(200, "shutdown").await {
            error!(error = err.to_string(), "error closing connection");
            failed = true;
        }

        if failed {
            return Err(AmqpError::ConnectionError);
        }

        debug!("amqp connection closed");
        Ok(())
    }

    fn current(&self) -> Option<AmqpHandles> {
        self.handles.read().ok().and_then(|handles| handles.clone())
    }

    fn take(&self) -> Option<AmqpHandles> {
        self.handles.write().ok().and_then(|mut handles| handles.take())
    }

    fn store(&self, new: AmqpHandles) -> Result<(), AmqpError> {
        let mut handles = self.handles.write().map_err(|_| AmqpError::InternalError)?;
        *handles = Some(new);
        Ok(())
    }

    /// Runs `op` on the channel, reconnecting and retrying once when the failure
    /// shows the channel or connection is gone.
    ///
    /// The outer error is a failed reconnect; the inner result is the operation's.
    async fn with_channel<T, F, Fut>(&self, op: F) -> Result<lapin::Result<T>, AmqpError>
    where
        F: Fn(Arc<Channel>) -> Fut + Send + Sync,
        Fut: Future<Output = lapin::Result<T>> + Send,
        T: Send,
    {
        let channel = self.channel().await?;

        match op(channel.clone()).await {
            Err(err) if is_connection_lost(&err) || !channel.status().connected() => {
                warn!(error = err.to_string(), "channel lost, reconnecting");
                self.reconnect().await?;
                let channel = self.channel().await?;
                Ok(op(channel).await)
            }
            other => Ok(other),
        }
    }
}

#[async_trait]
impl Transport for AmqpConnection {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);
        let args = to_field_table(&def.params);

        self.with_channel(|channel| {
            let kind = lapin::ExchangeKind::from(&def.kind);
            let args = args.clone();
            async move {
                channel
                    .exchange_declare(
                        &def.name,
                        kind,
                        ExchangeDeclareOptions {
                            passive: def.passive,
                            durable: def.durable,
                            auto_delete: def.delete,
                            internal: def.internal,
                            nowait: def.no_wait,
                        },
                        args,
                    )
                    .await
            }
        })
        .await?
        .map_err(|err| {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the exchange"
            );
            AmqpError::DeclareExchangeError(def.name.clone())
        })?;

        debug!("exchange: {} was created", def.name);
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {}", def.name);
        let args = to_field_table(&def.arguments());

        let queue = self
            .with_channel(|channel| {
                let args = args.clone();
                async move {
                    channel
                        .queue_declare(
                            &def.name,
                            QueueDeclareOptions {
                                passive: def.passive,
                                durable: def.durable,
                                exclusive: def.exclusive,
                                auto_delete: def.delete,
                                nowait: def.no_wait,
                            },
                            args,
                        )
                        .await
                }
            })
            .await?
            .map_err(|err| {
                error!(error = err.to_string(), queue = def.name, "error to declare the queue");
                AmqpError::DeclareQueueError(def.name.clone())
            })?;

        let name = queue.name().as_str().to_owned();
        debug!("queue: {} was created", name);
        Ok(name)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.with_channel(|channel| async move {
            channel
                .queue_bind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
        })
        .await?
        .map_err(|err| {
            error!(error = err.to_string(), "error to bind queue to exchange");
            AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            )
        })
    }

    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "unbinding queue: {} from the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.with_channel(|channel| async move {
            channel
                .queue_unbind(
                    &binding.queue_name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    FieldTable::default(),
                )
                .await
        })
        .await?
        .map_err(|err| {
            error!(error = err.to_string(), "error to unbind queue from exchange");
            AmqpError::UnbindingQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            )
        })
    }

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        self.with_channel(|channel| async move {
            channel
                .queue_delete(name, QueueDeleteOptions::default())
                .await
                .map(|_| ())
        })
        .await?
        .map_err(|err| {
            error!(error = err.to_string(), queue = name, "error to delete the queue");
            AmqpError::DeleteQueueError(name.to_owned())
        })
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), AmqpError> {
        let properties = to_basic_properties(&message.properties);
        let message = &message;

        self.with_channel(|channel| {
            let properties = properties.clone();
            async move {
                channel
                    .basic_publish(
                        &message.exchange,
                        &message.routing_key,
                        BasicPublishOptions {
                            immediate: false,
                            mandatory: false,
                        },
                        &message.data,
                        properties,
                    )
                    .await
                    .map(|_| ())
            }
        })
        .await?
        .map_err(|err| {
            error!(
                error = err.to_string(),
                exchange = message.exchange,
                "error publishing message"
            );
            AmqpError::PublishingError(message.exchange.clone())
        })
    }

    async fn consume(&self, options: &ConsumeOptions) -> Result<DeliveryStream, AmqpError> {
        if options.prefetch > 0 {
            self.with_channel(|channel| async move {
                channel
                    .basic_qos(options.prefetch, BasicQosOptions { global: false })
                    .await
            })
            .await?
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(options.queue.clone())
            })?;
        }

        let consumer = self
            .with_channel(|channel| async move {
                channel
                    .basic_consume(
                        &options.queue,
                        &options.consumer_tag,
                        BasicConsumeOptions {
                            no_local: false,
                            no_ack: options.auto_ack,
                            exclusive: options.exclusive,
                            nowait: false,
                        },
                        FieldTable::default(),
                    )
                    .await
            })
            .await?
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::SubscriptionError(options.consumer_tag.clone())
            })?;

        let auto_ack = options.auto_ack;
        Ok(consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(to_inbound(delivery, auto_ack)),
                Err(err) => {
                    error!(error = err.to_string(), "error receiving delivery");
                    Err(AmqpError::ConsumerError(err.to_string()))
                }
            })
            .boxed())
    }

    async fn reconnect(&self) -> Result<(), AmqpError> {
        let _guard = self.reconnecting.lock().await;

        if self.is_connected() {
            return Ok(());
        }

        if let Some(stale) = self.take() {
            debug!("discarding stale amqp handles");
            let _ = stale.channel.close(200, "reconnecting").await;
            let _ = stale.connection.close(200, "reconnecting").await;
        }

        let handles = dial(&self.uri, &self.connection_name).await?;
        self.store(handles)?;

        debug!("amqp reconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.current()
            .map(|handles| handles.is_connected())
            .unwrap_or(false)
    }
}

/// Opens a connection and a channel on it.
async fn dial(uri: &str, connection_name: &str) -> Result<AmqpHandles, AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(connection_name.to_owned()));

    let connection = match Connection::connect(uri, options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError)
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match connection.create_channel().await {
        Ok(channel) => {
            debug!("channel created");
            Ok(AmqpHandles {
                connection: Arc::new(connection),
                channel: Arc::new(channel),
            })
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            let _ = connection.close(200, "channel failure").await;
            Err(AmqpError::ChannelError)
        }
    }
}

fn is_connection_lost(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::InvalidChannelState(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::IOError(_)
    )
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

fn to_inbound(delivery: Delivery, auto_ack: bool) -> InboundDelivery {
    let acker: Box<dyn Acknowledger> = if auto_ack {
        Box::new(AutoAcked)
    } else {
        Box::new(LapinAcker(delivery.acker))
    };

    InboundDelivery::new(
        delivery.delivery_tag,
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        delivery.redelivered,
        from_basic_properties(&delivery.properties),
        delivery.data,
        acker,
    )
}

fn to_amqp_value(value: &HeaderValue) -> AMQPValue {
    match value {
        HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Int(v) => AMQPValue::LongInt(*v),
        HeaderValue::LongLong(v) => AMQPValue::LongLongInt(*v),
    }
}

fn from_amqp_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::LongString(v) => Some(HeaderValue::String(
            String::from_utf8_lossy(v.as_bytes()).into_owned(),
        )),
        AMQPValue::ShortString(v) => Some(HeaderValue::String(v.as_str().to_owned())),
        AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
        AMQPValue::ShortInt(v) => Some(HeaderValue::Int(i32::from(*v))),
        AMQPValue::LongInt(v) => Some(HeaderValue::Int(*v)),
        AMQPValue::LongUInt(v) => Some(HeaderValue::LongLong(i64::from(*v))),
        AMQPValue::LongLongInt(v) => Some(HeaderValue::LongLong(*v)),
        _ => None,
    }
}

fn to_field_table(args: &Arguments) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in args {
        btree.insert(ShortString::from(key.clone()), to_amqp_value(value));
    }
    FieldTable::from(btree)
}

fn to_basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();

    if let Some(content_type) = &props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(kind) = &props.kind {
        basic = basic.with_type(ShortString::from(kind.clone()));
    }
    if let Some(id) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(id) = &props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(queue) = &props.reply_to {
        basic = basic.with_reply_to(ShortString::from(queue.clone()));
    }
    if let Some(timestamp) = props.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if let Some(priority) = props.priority {
        basic = basic.with_priority(priority);
    }
    if props.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if !props.headers.is_empty() {
        basic = basic.with_headers(to_field_table(&props.headers));
    }

    basic
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    from_amqp_value(value).map(|value| (key.as_str().to_owned(), value))
                })
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        kind: props.kind().as_ref().map(|v| v.to_string()),
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        correlation_id: props.correlation_id().as_ref().map(|v| v.to_string()),
        reply_to: props.reply_to().as_ref().map(|v| v.to_string()),
        timestamp: *props.timestamp(),
        priority: *props.priority(),
        persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        headers,
    }
}
