// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! The per-queue message pump. A consumer moves through
//! `Stopped -> Subscribing -> Running -> Draining -> Stopped`: it subscribes with manual
//! acknowledgement and a prefetch of one, spawns a worker per delivery, and settles each
//! delivery exactly once from the handler outcome. When the broker closes the delivery
//! stream the consumer reconnects and resubscribes; if that fails, or when it is
//! cancelled, it waits for every in-flight worker before reporting `Stopped`.

use crate::{
    dispatcher::HandlerContext,
    errors::{AmqpError, ConsumeError, Disposition},
    otel,
    queue::QueueDefinition,
    transport::{ConsumeOptions, DeliveryStream, InboundDelivery, Transport},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc};
use tokio::sync::watch;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

/// Lifecycle of a single consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not subscribed; terminal once the pump exits.
    Stopped,
    /// Opening the subscription, initially or after a lost channel.
    Subscribing,
    /// Receiving deliveries.
    Running,
    /// Cancelled; waiting for in-flight deliveries to settle.
    Draining,
}

/// Processes one delivery. The runtime acknowledges on `Ok` and maps errors through
/// [`ConsumeError::disposition`].
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &HandlerContext,
        delivery: &InboundDelivery,
    ) -> Result<(), ConsumeError>;
}

/// Notified around every delivery a consumer processes.
pub trait DeliveryObserver: Send + Sync {
    /// Called before the handler runs.
    fn on_received(&self, consumer: &str);
    /// Called after the delivery is settled, whatever the outcome.
    fn on_processed(&self, consumer: &str);
}

/// What happens to a delivery whose handler keeps failing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequeuePolicy {
    /// Requeue on every handler failure. A poison message loops until purged.
    #[default]
    Always,
    /// Requeue the first failure only; a failing redelivery is rejected and reaches the
    /// queue's dead letter queue when it has one.
    DeadLetterOnRedelivery,
}

impl RequeuePolicy {
    /// Adjusts a handler failure's disposition for a delivery.
    ///
    /// # Parameters
    /// * `disposition` - What the error itself asks for
    /// * `redelivered` - The broker's redelivered flag on the delivery
    ///
    /// # Returns
    /// The disposition to settle the delivery with
    pub fn apply(&self, disposition: Disposition, redelivered: bool) -> Disposition {
        match (self, disposition) {
            (RequeuePolicy::DeadLetterOnRedelivery, Disposition::Requeue) if redelivered => {
                Disposition::Reject
            }
            _ => disposition,
        }
    }
}

/// Starts consumers over a shared transport. Cheap to clone; every consumer it starts
/// shares the handler and observers.
#[derive(Clone)]
pub struct ConsumerRuntime {
    transport: Arc<dyn Transport>,
    handler: Arc<dyn DeliveryHandler>,
    observers: Vec<Arc<dyn DeliveryObserver>>,
    policy: RequeuePolicy,
    prefetch: u16,
}

impl ConsumerRuntime {
    /// Creates a runtime with prefetch 1, no observers and [`RequeuePolicy::Always`].
    ///
    /// # Parameters
    /// * `transport` - Broker connection the consumers subscribe through
    /// * `handler` - Handler every delivery is passed to
    pub fn new(transport: Arc<dyn Transport>, handler: Arc<dyn DeliveryHandler>) -> Self {
        ConsumerRuntime {
            transport,
            handler,
            observers: vec![],
            policy: RequeuePolicy::default(),
            prefetch: 1,
        }
    }

    /// Adds an observer notified around every delivery.
    pub fn with_observer(mut self, observer: Arc<dyn DeliveryObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Sets how failing deliveries are requeued.
    pub fn with_policy(mut self, policy: RequeuePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Unacknowledged deliveries held per subscription. Defaults to 1; zero is
    /// treated as 1.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Subscribes `consumer` to `queue` and runs it until `parent` or the returned
    /// handle is cancelled. The queue must already be declared.
    pub async fn start(
        &self,
        parent: &CancellationToken,
        queue: &str,
        consumer: &str,
    ) -> Result<ConsumerHandle, AmqpError> {
        let (state, watcher) = watch::channel(ConsumerState::Subscribing);

        let deliveries = match self.subscribe(queue, consumer).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                state.send_replace(ConsumerState::Stopped);
                error!(error = err.to_string(), queue, consumer, "failure to subscribe");
                return Err(AmqpError::SubscriptionError(consumer.to_owned()));
            }
        };

        state.send_replace(ConsumerState::Running);
        info!(queue, consumer, "consumer running");

        let cancel = parent.child_token();
        let pump = Pump {
            runtime: self.clone(),
            queue: queue.to_owned(),
            consumer: consumer.to_owned(),
            cancel: cancel.clone(),
            state,
            workers: TaskTracker::new(),
        };
        tokio::spawn(pump.run(deliveries));

        Ok(ConsumerHandle {
            name: consumer.to_owned(),
            queue_name: queue.to_owned(),
            cancel,
            state: watcher,
        })
    }

    async fn subscribe(&self, queue: &str, consumer: &str) -> Result<DeliveryStream, AmqpError> {
        self.transport
            .declare_queue(&QueueDefinition::new(queue).passive())
            .await?;

        let options = ConsumeOptions {
            prefetch: self.prefetch,
            ..ConsumeOptions::manual(queue, consumer)
        };
        self.transport.consume(&options).await
    }

    async fn process(&self, cancel: CancellationToken, consumer: &str, delivery: InboundDelivery) {
        for observer in &self.observers {
            observer.on_received(consumer);
        }

        let name = delivery
            .properties
            .kind
            .clone()
            .unwrap_or_else(|| delivery.routing_key.clone());
        let (trace, mut span) =
            otel::new_span(&delivery.properties, &global::tracer("amqp consumer"), &name);

        let ctx = HandlerContext::new(cancel, trace);
        let outcome = self.handler.handle(&ctx, &delivery).await;

        let redelivered = delivery.redelivered;
        let delivery_tag = delivery.delivery_tag;
        let disposition = match &outcome {
            Ok(()) => Disposition::Ack,
            Err(err) => {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                self.policy.apply(err.disposition(redelivered), redelivered)
            }
        };

        let settled = match disposition {
            Disposition::Ack => delivery.ack().await,
            Disposition::Requeue => {
                warn!(consumer, delivery_tag, "error whiling handling msg, requeuing for latter");
                delivery.nack(true).await
            }
            Disposition::Reject => {
                warn!(consumer, delivery_tag, redelivered, "rejecting msg without requeue");
                delivery.nack(false).await
            }
        };

        match settled {
            Ok(()) if outcome.is_ok() => {
                debug!(consumer, delivery_tag, "message successfully processed");
                span.set_status(Status::Ok);
            }
            Ok(()) => {}
            Err(err) => {
                error!(error = err.to_string(), consumer, delivery_tag, "failure to settle msg");
                span.record_error(&err);
            }
        }

        for observer in &self.observers {
            observer.on_processed(consumer);
        }
    }
}

/// The task behind a running consumer.
struct Pump {
    runtime: ConsumerRuntime,
    queue: String,
    consumer: String,
    cancel: CancellationToken,
    state: watch::Sender<ConsumerState>,
    workers: TaskTracker,
}

impl Pump {
    async fn run(self, mut deliveries: DeliveryStream) {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    debug!(consumer = self.consumer, "consumer cancelled");
                    break;
                }

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => self.spawn_worker(delivery),
                    Some(Err(err)) => {
                        error!(error = err.to_string(), consumer = self.consumer, "errors consume msg");
                    }
                    None => {
                        warn!(consumer = self.consumer, "delivery stream closed, resubscribing");
                        match self.resubscribe().await {
                            Ok(stream) => deliveries = stream,
                            Err(err) => {
                                error!(
                                    error = err.to_string(),
                                    consumer = self.consumer,
                                    "failure to resubscribe, stopping consumer"
                                );
                                break;
                            }
                        }
                    }
                },
            }
        }

        drop(deliveries);
        self.state.send_replace(ConsumerState::Draining);
        debug!(
            consumer = self.consumer,
            in_flight = self.workers.len(),
            "draining consumer"
        );

        self.workers.close();
        self.workers.wait().await;

        self.state.send_replace(ConsumerState::Stopped);
        info!(queue = self.queue, consumer = self.consumer, "consumer stopped");
    }

    fn spawn_worker(&self, delivery: InboundDelivery) {
        let runtime = self.runtime.clone();
        let consumer = self.consumer.clone();
        let cancel = self.cancel.clone();

        self.workers.spawn(async move {
            runtime.process(cancel, &consumer, delivery).await;
        });
    }

    async fn resubscribe(&self) -> Result<DeliveryStream, AmqpError> {
        self.state.send_replace(ConsumerState::Subscribing);
        self.runtime.transport.reconnect().await?;
        let deliveries = self.runtime.subscribe(&self.queue, &self.consumer).await?;
        self.state.send_replace(ConsumerState::Running);

        info!(consumer = self.consumer, "consumer resubscribed");
        Ok(deliveries)
    }
}

/// Owner's handle on a running consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    name: String,
    queue_name: String,
    cancel: CancellationToken,
    state: watch::Receiver<ConsumerState>,
}

impl ConsumerHandle {
    /// The consumer tag.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue this consumer is subscribed to.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// True once the consumer drained, including after it gave up on reconnecting.
    pub fn is_stopped(&self) -> bool {
        self.state() == ConsumerState::Stopped || self.state.has_changed().is_err()
    }

    /// Cancels the subscription and returns once every in-flight delivery is settled.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.stopped().await;
    }

    /// Waits for the consumer to reach `Stopped` without cancelling it.
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        // A closed channel means the pump is gone.
        let _ = state.wait_for(|s| *s == ConsumerState::Stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::MemoryBroker, transport::{MockTransport, OutboundMessage}};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::Notify;

    struct Counting {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl DeliveryHandler for Counting {
        async fn handle(&self, _: &HandlerContext, _: &InboundDelivery) -> Result<(), ConsumeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(crate::errors::HandlerError::Failed("first attempt".into()).into());
            }
            Ok(())
        }
    }

    async fn broker_with_queue(name: &str) -> Arc<MemoryBroker> {
        let broker = MemoryBroker::new();
        broker.declare_queue(&QueueDefinition::new(name).durable()).await.unwrap();
        broker
    }

    #[test]
    fn dead_letter_policy_only_rejects_failing_redeliveries() {
        let policy = RequeuePolicy::DeadLetterOnRedelivery;
        assert_eq!(policy.apply(Disposition::Requeue, false), Disposition::Requeue);
        assert_eq!(policy.apply(Disposition::Requeue, true), Disposition::Reject);
        assert_eq!(policy.apply(Disposition::Ack, true), Disposition::Ack);
        assert_eq!(
            RequeuePolicy::Always.apply(Disposition::Requeue, true),
            Disposition::Requeue
        );
    }

    #[tokio::test]
    async fn subscribes_with_manual_ack_and_prefetch_one() {
        let mut transport = MockTransport::new();
        transport
            .expect_declare_queue()
            .returning(|def| Ok(def.name().to_owned()));
        transport
            .expect_consume()
            .withf(|opts| opts.prefetch == 1 && !opts.auto_ack && opts.queue == "q1")
            .times(1)
            .returning(|_| Ok(futures_util::stream::pending().boxed()));

        let handler = Arc::new(Counting { calls: AtomicUsize::new(0), fail_first: false });
        let runtime = ConsumerRuntime::new(Arc::new(transport), handler);

        let handle = runtime
            .start(&CancellationToken::new(), "q1", "c1")
            .await
            .unwrap();
        assert_eq!(handle.state(), ConsumerState::Running);

        handle.stop().await;
        assert!(handle.is_stopped());
    }

    #[tokio::test]
    async fn missing_queue_fails_with_subscription_error() {
        let broker = MemoryBroker::new();
        let handler = Arc::new(Counting { calls: AtomicUsize::new(0), fail_first: false });
        let runtime = ConsumerRuntime::new(broker, handler);

        let err = runtime
            .start(&CancellationToken::new(), "nowhere", "c1")
            .await
            .unwrap_err();
        assert_eq!(err, AmqpError::SubscriptionError("c1".into()));
    }

    #[tokio::test]
    async fn handler_failure_is_redelivered_until_success() {
        let broker = broker_with_queue("q1").await;
        let handler = Arc::new(Counting { calls: AtomicUsize::new(0), fail_first: true });
        let runtime = ConsumerRuntime::new(broker.clone(), handler.clone());
        let handle = runtime
            .start(&CancellationToken::new(), "q1", "c1")
            .await
            .unwrap();

        broker
            .publish(OutboundMessage::new("", "q1", b"{}".to_vec()))
            .await
            .unwrap();

        while handler.calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.stop().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert!(broker.get("q1").await.is_none());
    }

    struct Blocking {
        started: Notify,
        release: Notify,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryHandler for Blocking {
        async fn handle(&self, _: &HandlerContext, _: &InboundDelivery) -> Result<(), ConsumeError> {
            self.started.notify_one();
            self.release.notified().await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancellation_drains_in_flight_work_before_stopping() {
        let broker = broker_with_queue("q1").await;
        let handler = Arc::new(Blocking {
            started: Notify::new(),
            release: Notify::new(),
            finished: AtomicUsize::new(0),
        });
        let parent = CancellationToken::new();
        let handle = ConsumerRuntime::new(broker.clone(), handler.clone())
            .start(&parent, "q1", "c1")
            .await
            .unwrap();

        broker
            .publish(OutboundMessage::new("", "q1", b"{}".to_vec()))
            .await
            .unwrap();
        handler.started.notified().await;

        parent.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.state(), ConsumerState::Draining);

        handler.release.notify_one();
        handle.stopped().await;

        assert_eq!(handler.finished.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), ConsumerState::Stopped);
        assert!(broker.get("q1").await.is_none());
    }
}
