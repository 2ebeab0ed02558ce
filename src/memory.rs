// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! An in-process `Transport` with the broker behaviour the messaging core relies on:
//!
//! - the default exchange routes to the queue named by the routing key
//! - direct and headers exchanges route on exact key match, fanout to every binding,
//!   topic on `*`/`#` patterns
//! - the consistent-hash exchange places `weight * RING_POINTS_PER_WEIGHT` points per
//!   binding on a ring and routes each message to the first point at or after the hash
//!   of its hash header;
//!   binding a queue again with a different weight adds points, an identical binding
//!   is a no-op
//! - manual-ack subscriptions hold at most `prefetch` unacknowledged deliveries, or
//!   any number when `prefetch` is 0
//! - `nack(requeue = true)` redelivers with the redelivered flag set, `nack(false)`
//!   dead-letters through the queue's dead-letter arguments or drops
//! - `disconnect()` ends every open subscription; settling a delivery from the lost
//!   channel fails and returns it to its queue
//!
//! Hash values differ from the broker plugin's, only the placement rules match.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind, HASH_ON_HEADER},
    queue::{
        QueueBinding, QueueDefinition, AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
        AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
    },
    transport::{
        Acknowledger, AutoAcked, ConsumeOptions, DeliveryStream, InboundDelivery,
        MessageProperties, OutboundMessage, Transport,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{hash_map::DefaultHasher, BTreeSet, HashMap},
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// A message sitting in a memory queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMessage {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
}

struct MemoryQueue {
    def: QueueDefinition,
    tx: mpsc::UnboundedSender<MemoryMessage>,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<MemoryMessage>>>,
}

impl MemoryQueue {
    fn new(def: QueueDefinition) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        MemoryQueue {
            def,
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
        }
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<QueueBinding>,
}

impl BrokerState {
    /// Queues a message published to `exchange` with `routing_key` lands in.
    fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        props: &MessageProperties,
    ) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let def = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| AmqpError::PublishingError(exchange.to_owned()))?;
        let bound = self
            .bindings
            .iter()
            .filter(|binding| binding.exchange_name == exchange);

        let queues: BTreeSet<String> = match def.kind {
            ExchangeKind::Direct | ExchangeKind::Headers => bound
                .filter(|binding| binding.routing_key == routing_key)
                .map(|binding| binding.queue_name.clone())
                .collect(),
            ExchangeKind::Fanout => bound.map(|binding| binding.queue_name.clone()).collect(),
            ExchangeKind::Topic => bound
                .filter(|binding| topic_matches(&binding.routing_key, routing_key))
                .map(|binding| binding.queue_name.clone())
                .collect(),
            ExchangeKind::ConsistentHash => {
                let header = def.hash_header().unwrap_or(HASH_ON_HEADER);
                match props.header(header) {
                    Some(key) => pick_weighted(bound, key).into_iter().collect(),
                    None => {
                        warn!(exchange, header, "message without hash header, unroutable");
                        BTreeSet::new()
                    }
                }
            }
        };

        Ok(queues.into_iter().collect())
    }

    fn deliver(&self, queues: &[String], message: &MemoryMessage) {
        for name in queues {
            if let Some(queue) = self.queues.get(name) {
                let _ = queue.tx.send(message.clone());
            }
        }
    }
}

/// Ring points one unit of binding weight is worth.
const RING_POINTS_PER_WEIGHT: u32 = 64;

/// Picks the queue owning the first ring point at or after the key's hash.
fn pick_weighted<'a>(bindings: impl Iterator<Item = &'a QueueBinding>, key: &str) -> Option<String> {
    let mut ring: Vec<(u64, &str)> = vec![];
    for binding in bindings {
        let Some(weight) = binding.weight() else {
            continue;
        };
        for point in 0..weight.saturating_mul(RING_POINTS_PER_WEIGHT) {
            ring.push((
                hash_of(&(binding.queue_name.as_str(), binding.routing_key.as_str(), point)),
                binding.queue_name.as_str(),
            ));
        }
    }
    ring.sort_unstable();

    let target = hash_of(&key);
    ring.iter()
        .find(|(point, _)| *point >= target)
        .or_else(|| ring.first())
        .map(|(_, queue)| (*queue).to_owned())
}

fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
fn topic_matches(pattern: &str, key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(other)) if word == other => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    matches(&pattern, &key)
}

fn lock(state: &Mutex<BrokerState>) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
    state.lock().map_err(|_| AmqpError::InternalError)
}

/// Sends a rejected message to its queue's dead-letter target, if it has one.
fn dead_letter(state: &Mutex<BrokerState>, queue: &str, message: &MemoryMessage) {
    let Ok(state) = lock(state) else {
        return;
    };
    let Some(def) = state.queues.get(queue).map(|q| &q.def) else {
        return;
    };

    let args = def.arguments();
    let exchange = args
        .get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)
        .and_then(|value| value.as_str());
    let routing_key = args
        .get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
        .and_then(|value| value.as_str());

    let (Some(exchange), Some(routing_key)) = (exchange, routing_key) else {
        debug!(queue, "rejected message dropped, no dead letter queue");
        return;
    };

    match state.route(exchange, routing_key, &message.properties) {
        Ok(targets) => {
            let dead = MemoryMessage {
                redelivered: false,
                ..message.clone()
            };
            state.deliver(&targets, &dead);
            debug!(queue, routing_key, "message dead-lettered");
        }
        Err(err) => warn!(error = err.to_string(), queue, "failure to dead-letter message"),
    }
}

struct MemoryAcker {
    queue: String,
    message: MemoryMessage,
    tx: mpsc::UnboundedSender<MemoryMessage>,
    connection: CancellationToken,
    state: Arc<Mutex<BrokerState>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl MemoryAcker {
    fn requeue(&self) {
        let _ = self.tx.send(MemoryMessage {
            redelivered: true,
            ..self.message.clone()
        });
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        if self.connection.is_cancelled() {
            self.requeue();
            return Err(AmqpError::AckMessageError);
        }
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        if self.connection.is_cancelled() {
            self.requeue();
            return Err(AmqpError::NackMessageError);
        }

        if requeue {
            self.requeue();
        } else {
            dead_letter(&self.state, &self.queue, &self.message);
        }
        Ok(())
    }
}

struct Subscription {
    queue: String,
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<MemoryMessage>>>,
    tx: mpsc::UnboundedSender<MemoryMessage>,
    connection: CancellationToken,
    auto_ack: bool,
    /// Unsettled delivery limit; `None` when prefetch is unlimited.
    permits: Option<Arc<Semaphore>>,
    state: Arc<Mutex<BrokerState>>,
    next_tag: Arc<AtomicU64>,
}

impl Subscription {
    async fn next(self) -> Option<(Result<InboundDelivery, AmqpError>, Subscription)> {
        let permit = match &self.permits {
            Some(permits) => tokio::select! {
                _ = self.connection.cancelled() => return None,
                permit = permits.clone().acquire_owned() => Some(permit.ok()?),
            },
            None => None,
        };

        let message = {
            let mut rx = tokio::select! {
                _ = self.connection.cancelled() => return None,
                rx = self.rx.lock() => rx,
            };
            tokio::select! {
                _ = self.connection.cancelled() => return None,
                message = rx.recv() => message?,
            }
        };

        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let acker: Box<dyn Acknowledger> = if self.auto_ack {
            Box::new(AutoAcked)
        } else {
            Box::new(MemoryAcker {
                queue: self.queue.clone(),
                message: message.clone(),
                tx: self.tx.clone(),
                connection: self.connection.clone(),
                state: self.state.clone(),
                _permit: permit,
            })
        };

        let delivery = InboundDelivery::new(
            tag,
            &message.exchange,
            &message.routing_key,
            message.redelivered,
            message.properties,
            message.data,
            acker,
        );

        Some((Ok(delivery), self))
    }
}

/// In-process broker implementing [`Transport`].
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    connection: Mutex<CancellationToken>,
    connected: AtomicBool,
    refuse_reconnect: AtomicBool,
    reconnects: AtomicUsize,
    next_tag: Arc<AtomicU64>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        MemoryBroker {
            state: Arc::new(Mutex::new(BrokerState::default())),
            connection: Mutex::new(CancellationToken::new()),
            connected: AtomicBool::new(true),
            refuse_reconnect: AtomicBool::new(false),
            reconnects: AtomicUsize::new(0),
            next_tag: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Arc<MemoryBroker> {
        Arc::new(MemoryBroker::default())
    }

    /// Drops the connection: open subscriptions end and unsettled deliveries return
    /// to their queues when settled.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(token) = self.connection.lock() {
            token.cancel();
        }
    }

    /// Makes subsequent reconnect attempts fail while `refuse` is set.
    pub fn refuse_reconnect(&self, refuse: bool) {
        self.refuse_reconnect.store(refuse, Ordering::SeqCst);
    }

    pub fn reconnect_count(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Takes the next message from `queue` without a subscription (`basic.get`).
    pub async fn get(&self, queue: &str) -> Option<MemoryMessage> {
        let rx = lock(&self.state).ok()?.queues.get(queue)?.rx.clone();
        let mut rx = rx.lock().await;
        rx.try_recv().ok()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        lock(&self.state)
            .map(|state| state.queues.contains_key(queue))
            .unwrap_or(false)
    }

    pub fn bindings(&self, exchange: &str) -> Vec<QueueBinding> {
        lock(&self.state)
            .map(|state| {
                state
                    .bindings
                    .iter()
                    .filter(|binding| binding.exchange_name == exchange)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn connection_token(&self) -> Result<CancellationToken, AmqpError> {
        self.connection
            .lock()
            .map(|token| token.clone())
            .map_err(|_| AmqpError::InternalError)
    }

    async fn ensure_connected(&self) -> Result<(), AmqpError> {
        if self.is_connected() {
            return Ok(());
        }
        warn!("memory connection lost, reconnecting");
        self.reconnect().await
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_connected().await?;
        let mut state = lock(&self.state)?;

        match state.exchanges.get(&def.name) {
            Some(existing) if existing.kind != def.kind => {
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            Some(_) => Ok(()),
            None if def.passive => Err(AmqpError::DeclareExchangeError(def.name.clone())),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        self.ensure_connected().await?;
        let mut state = lock(&self.state)?;

        let name = if def.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            def.name.clone()
        };

        if !state.queues.contains_key(&name) {
            if def.passive {
                return Err(AmqpError::DeclareQueueError(name));
            }
            let def = QueueDefinition {
                name: name.clone(),
                ..def.clone()
            };
            state.queues.insert(name.clone(), MemoryQueue::new(def));
        }

        Ok(name)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_connected().await?;
        let mut state = lock(&self.state)?;

        if !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_connected().await?;
        let mut state = lock(&self.state)?;
        state.bindings.retain(|existing| existing != binding);
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        self.ensure_connected().await?;
        let mut state = lock(&self.state)?;
        state.queues.remove(name);
        state.bindings.retain(|binding| binding.queue_name != name);
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<(), AmqpError> {
        self.ensure_connected().await?;
        let state = lock(&self.state)?;

        let targets = state.route(&message.exchange, &message.routing_key, &message.properties)?;
        if targets.is_empty() {
            debug!(
                exchange = message.exchange,
                routing_key = message.routing_key,
                "message unroutable, dropped"
            );
            return Ok(());
        }

        state.deliver(
            &targets,
            &MemoryMessage {
                exchange: message.exchange,
                routing_key: message.routing_key,
                redelivered: false,
                properties: message.properties,
                data: message.data,
            },
        );
        Ok(())
    }

    async fn consume(&self, options: &ConsumeOptions) -> Result<DeliveryStream, AmqpError> {
        self.ensure_connected().await?;
        let connection = self.connection_token()?;
        let state = lock(&self.state)?;

        let queue = state
            .queues
            .get(&options.queue)
            .ok_or_else(|| AmqpError::SubscriptionError(options.consumer_tag.clone()))?;

        let permits = (!options.auto_ack && options.prefetch > 0)
            .then(|| Arc::new(Semaphore::new(usize::from(options.prefetch))));

        let subscription = Subscription {
            queue: options.queue.clone(),
            rx: queue.rx.clone(),
            tx: queue.tx.clone(),
            connection,
            auto_ack: options.auto_ack,
            permits,
            state: self.state.clone(),
            next_tag: self.next_tag.clone(),
        };

        Ok(stream::unfold(subscription, Subscription::next).boxed())
    }

    async fn reconnect(&self) -> Result<(), AmqpError> {
        if self.is_connected() {
            return Ok(());
        }
        if self.refuse_reconnect.load(Ordering::SeqCst) {
            warn!("memory reconnect refused");
            return Err(AmqpError::ConnectionError);
        }

        let mut token = self.connection.lock().map_err(|_| AmqpError::InternalError)?;
        *token = CancellationToken::new();
        self.connected.store(true, Ordering::SeqCst);
        self.reconnects.fetch_add(1, Ordering::SeqCst);

        debug!("memory connection re-established");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
