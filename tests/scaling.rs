// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use async_trait::async_trait;
use common::{hashed_broker, wait_until, AckAll, EXCHANGE};
use hashbus::{
    config::ScalingConfigs,
    consumer::{ConsumerHandle, ConsumerRuntime, DeliveryHandler},
    dispatcher::HandlerContext,
    errors::{AmqpError, ConsumeError},
    memory::MemoryBroker,
    publisher::RabbitMQPublisher,
    scaling::{
        ConsumerLauncher, LoadSampler, ScalingAction, ScalingController,
        WeightedConsumerLauncher,
    },
    topology::AmqpTopology,
    transport::InboundDelivery,
};
use std::{
    sync::{
        atomic::{AtomicI64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct InjectedLoad(AtomicI64);

impl InjectedLoad {
    fn set(&self, in_flight: i64) {
        self.0.store(in_flight, Ordering::SeqCst);
    }
}

impl LoadSampler for InjectedLoad {
    fn in_flight(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Counts what it acknowledges.
#[derive(Default)]
struct Counted(AtomicUsize);

#[async_trait]
impl DeliveryHandler for Counted {
    async fn handle(&self, _: &HandlerContext, _: &InboundDelivery) -> Result<(), ConsumeError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Launches like the pool's launcher but can never unbind a slot.
struct StuckBinding(Arc<WeightedConsumerLauncher>);

#[async_trait]
impl ConsumerLauncher for StuckBinding {
    async fn launch(
        &self,
        cancel: &CancellationToken,
        index: usize,
    ) -> Result<ConsumerHandle, AmqpError> {
        self.0.launch(cancel, index).await
    }

    async fn retire(&self, handle: &ConsumerHandle) -> Result<(), AmqpError> {
        Err(AmqpError::UnbindingQueueError(
            EXCHANGE.to_owned(),
            handle.queue_name().to_owned(),
        ))
    }
}

async fn pool(
    config: ScalingConfigs,
) -> (Arc<MemoryBroker>, Arc<ScalingController>, Arc<InjectedLoad>) {
    pool_with(config, Arc::new(AckAll), |launcher| launcher as Arc<dyn ConsumerLauncher>).await
}

async fn pool_with(
    config: ScalingConfigs,
    handler: Arc<dyn DeliveryHandler>,
    wrap: impl FnOnce(Arc<WeightedConsumerLauncher>) -> Arc<dyn ConsumerLauncher>,
) -> (Arc<MemoryBroker>, Arc<ScalingController>, Arc<InjectedLoad>) {
    let broker = hashed_broker(&[]).await;
    let topology = Arc::new(AmqpTopology::new(broker.clone()));
    let runtime = ConsumerRuntime::new(broker.clone(), handler);
    let launcher = wrap(WeightedConsumerLauncher::new(topology, runtime, config.clone()));
    let load = Arc::new(InjectedLoad::default());

    let controller =
        ScalingController::new(config, launcher, load.clone(), &CancellationToken::new());
    controller.start_initial().await.unwrap();

    (broker, controller, load)
}

fn single_sample_config() -> ScalingConfigs {
    ScalingConfigs {
        history_size: 1,
        exchange: EXCHANGE.to_owned(),
        ..Default::default()
    }
}

#[tokio::test]
async fn sustained_load_scales_up_by_at_most_two_until_the_maximum() {
    let (broker, controller, load) = pool(single_sample_config()).await;
    assert_eq!(controller.active_count().await, 2);
    assert_eq!(broker.bindings(EXCHANGE).len(), 2);

    load.set(20);
    for expected in [4, 6, 8, 10] {
        assert_eq!(controller.evaluate().await, ScalingAction::ScaledUp(2));
        assert_eq!(controller.active_count().await, expected);
    }
    assert_eq!(controller.evaluate().await, ScalingAction::Hold);
    assert_eq!(controller.active_count().await, 10);

    let mut queues: Vec<String> = broker
        .bindings(EXCHANGE)
        .iter()
        .map(|binding| binding.queue_name().to_owned())
        .collect();
    queues.sort();
    let mut expected: Vec<String> = (1..=10).map(|i| format!("sync_queue_{i}")).collect();
    expected.sort();
    assert_eq!(queues, expected);

    controller.shutdown().await;
}

#[tokio::test]
async fn light_load_scales_down_one_at_a_time_to_the_protected_minimum() {
    let (broker, controller, load) = pool(single_sample_config()).await;

    load.set(20);
    controller.evaluate().await;
    controller.evaluate().await;
    assert_eq!(controller.active_count().await, 6);

    load.set(1);
    for (expected, retired) in [(5, 6), (4, 5), (3, 4), (2, 3)] {
        assert_eq!(
            controller.evaluate().await,
            ScalingAction::ScaledDown(format!("sync_consumer_{retired}"))
        );
        assert_eq!(controller.active_count().await, expected);
        assert_eq!(broker.bindings(EXCHANGE).len(), expected);
    }

    assert_eq!(controller.evaluate().await, ScalingAction::Hold);
    assert_eq!(
        controller.active_consumers().await,
        vec!["sync_consumer_1".to_owned(), "sync_consumer_2".to_owned()]
    );

    controller.shutdown().await;
}

#[tokio::test]
async fn freed_slots_are_reused_on_the_next_scale_up() {
    let (_broker, controller, load) = pool(single_sample_config()).await;

    load.set(20);
    controller.evaluate().await;
    load.set(3);
    assert_eq!(
        controller.evaluate().await,
        ScalingAction::ScaledDown("sync_consumer_4".into())
    );

    load.set(20);
    assert_eq!(controller.evaluate().await, ScalingAction::ScaledUp(2));
    let mut names = controller.active_consumers().await;
    names.sort();
    assert_eq!(
        names,
        (1..=5).map(|i| format!("sync_consumer_{i}")).collect::<Vec<_>>()
    );

    controller.shutdown().await;
}

#[tokio::test]
async fn consumer_whose_queue_cannot_be_unbound_keeps_running() {
    let (broker, controller, load) = pool_with(single_sample_config(), Arc::new(AckAll), |l| {
        Arc::new(StuckBinding(l)) as Arc<dyn ConsumerLauncher>
    })
    .await;

    load.set(20);
    controller.evaluate().await;
    assert_eq!(controller.active_count().await, 4);

    load.set(1);
    assert_eq!(controller.evaluate().await, ScalingAction::Hold);
    assert_eq!(controller.active_count().await, 4);
    assert_eq!(broker.bindings(EXCHANGE).len(), 4);
    assert!(controller
        .active_consumers()
        .await
        .contains(&"sync_consumer_4".to_owned()));

    controller.shutdown().await;
}

#[tokio::test]
async fn backlog_of_a_retired_queue_waits_for_its_slot_to_return() {
    let handler = Arc::new(Counted::default());
    let (broker, controller, load) =
        pool_with(single_sample_config(), handler.clone(), |launcher| {
            launcher as Arc<dyn ConsumerLauncher>
        })
        .await;

    load.set(20);
    controller.evaluate().await;
    load.set(3);
    assert_eq!(
        controller.evaluate().await,
        ScalingAction::ScaledDown("sync_consumer_4".into())
    );

    RabbitMQPublisher::new(broker.clone())
        .publish("", "sync_queue_4", "", b"{}")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.0.load(Ordering::SeqCst), 0);

    load.set(20);
    assert_eq!(controller.evaluate().await, ScalingAction::ScaledUp(2));
    wait_until(|| handler.0.load(Ordering::SeqCst) == 1).await;

    controller.shutdown().await;
}

#[tokio::test]
async fn moving_average_damps_a_single_spike() {
    let (_broker, controller, load) = pool(ScalingConfigs {
        history_size: 5,
        exchange: EXCHANGE.to_owned(),
        ..Default::default()
    })
    .await;

    for _ in 0..4 {
        controller.evaluate().await;
    }
    load.set(20);
    // mean (0 + 0 + 0 + 0 + 20) / 5 = 4, not above twice the two consumers
    assert_eq!(controller.evaluate().await, ScalingAction::Hold);
    assert_eq!(controller.evaluate().await, ScalingAction::ScaledUp(2));

    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn scaling_loop_runs_every_interval_until_shutdown() {
    let (_broker, controller, load) = pool(single_sample_config()).await;
    load.set(100);

    let task = controller.spawn();
    tokio::time::sleep(Duration::from_secs(2 * 30 + 1)).await;
    assert_eq!(controller.active_count().await, 6);

    controller.shutdown().await;
    task.await.unwrap();
    assert_eq!(controller.active_count().await, 0);
}
