// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Elastic Consumer Pool
//!
//! Every interval the controller samples the in-flight message count, pushes it into a
//! bounded sliding window and compares the window mean with the number of active
//! consumers:
//!
//! - mean above twice the consumer count: start up to `scale_up_step` consumers, never
//!   going past `max_consumers`;
//! - mean below the consumer count: stop exactly one consumer, never going below
//!   `min_consumers`. The consumers started first are protected and never retired.
//!
//! Each pool consumer owns the queue `{queue_prefix}_{index}`, with indices starting
//! at 1, bound to the consistent-hash exchange with `consumer_weight`. Retiring a
//! consumer removes its binding before the consumer is drained, and freed indices are
//! reused lowest first. A consumer whose binding cannot be removed keeps running.
//!
//! ## Retired backlog
//!
//! Stopping a retired consumer only waits for the deliveries it is already handling.
//! Messages still queued in its unbound queue stay there, untouched, until a later
//! scale-up reuses the index and a new consumer drains them. With a sustained light
//! load that may never happen, so the queue keeps whatever it held when it was retired.

use crate::{
    config::ScalingConfigs,
    consumer::{ConsumerHandle, ConsumerRuntime, DeliveryObserver},
    errors::AmqpError,
    queue::QueueDefinition,
    topology::AmqpTopology,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One observation of the pool's load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingSample {
    pub timestamp: DateTime<Utc>,
    pub active_message_count: i64,
}

/// Fixed-capacity sample history; the oldest sample is evicted first.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    capacity: usize,
    samples: VecDeque<ScalingSample>,
}

impl SlidingWindow {
    /// Creates an empty window. A zero capacity is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        SlidingWindow {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends a sample, evicting the oldest one when the window is full.
    pub fn push(&mut self, sample: ScalingSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Mean in-flight count over the window, 0 when empty.
    /// Mean in-flight count over the retained samples, 0 when empty.
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let total: i64 = self.samples.iter().map(|s| s.active_message_count).sum();
        total as f64 / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Source of the in-flight count the controller samples.
pub trait LoadSampler: Send + Sync {
    /// Deliveries received but not yet settled.
    fn in_flight(&self) -> i64;
}

/// Counts deliveries between receipt and settlement across every consumer it observes.
#[derive(Debug, Default)]
pub struct LoadGauge {
    in_flight: AtomicI64,
}

impl LoadGauge {
    /// Creates a gauge at zero, ready to be shared as observer and sampler.
    pub fn new() -> Arc<LoadGauge> {
        Arc::new(LoadGauge::default())
    }
}

impl DeliveryObserver for LoadGauge {
    fn on_received(&self, _consumer: &str) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn on_processed(&self, _consumer: &str) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LoadSampler for LoadGauge {
    fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Starts and retires the consumer for a pool slot.
#[async_trait]
pub trait ConsumerLauncher: Send + Sync {
    /// Prepares the slot's queue and starts its consumer.
    ///
    /// # Parameters
    /// * `cancel` - Parent token; cancelling it stops the consumer
    /// * `index` - Pool slot, starting at 1
    ///
    /// # Returns
    /// The handle of the running consumer
    async fn launch(
        &self,
        cancel: &CancellationToken,
        index: usize,
    ) -> Result<ConsumerHandle, AmqpError>;

    /// Detaches the slot from the topology. Called before the consumer is stopped.
    async fn retire(&self, handle: &ConsumerHandle) -> Result<(), AmqpError>;
}

/// Launches consumers on weighted queues of the pool's consistent-hash exchange.
pub struct WeightedConsumerLauncher {
    topology: Arc<AmqpTopology>,
    runtime: ConsumerRuntime,
    config: ScalingConfigs,
}

impl WeightedConsumerLauncher {
    /// Creates a launcher binding `{queue_prefix}_{index}` queues to `config.exchange`.
    pub fn new(
        topology: Arc<AmqpTopology>,
        runtime: ConsumerRuntime,
        config: ScalingConfigs,
    ) -> Arc<Self> {
        Arc::new(WeightedConsumerLauncher {
            topology,
            runtime,
            config,
        })
    }
}

#[async_trait]
impl ConsumerLauncher for WeightedConsumerLauncher {
    async fn launch(
        &self,
        cancel: &CancellationToken,
        index: usize,
    ) -> Result<ConsumerHandle, AmqpError> {
        let queue = self.config.queue_name(index);

        self.topology
            .declare_queue(&QueueDefinition::new(&queue).durable())
            .await?;
        self.topology
            .bind_weighted(&queue, &self.config.exchange, self.config.consumer_weight)
            .await?;

        self.runtime
            .start(cancel, &queue, &self.config.consumer_name(index))
            .await
    }

    async fn retire(&self, handle: &ConsumerHandle) -> Result<(), AmqpError> {
        self.topology
            .unbind_weighted(
                handle.queue_name(),
                &self.config.exchange,
                self.config.consumer_weight,
            )
            .await
    }
}

/// Outcome of one scaling evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScalingAction {
    /// No consumer was started or stopped.
    Hold,
    /// Number of consumers started.
    ScaledUp(usize),
    /// Name of the consumer stopped.
    ScaledDown(String),
}

struct PoolConsumer {
    index: usize,
    protected: bool,
    handle: ConsumerHandle,
}

/// Grows and shrinks a pool of consumers with the sampled load.
///
/// The controller owns every consumer it starts; [`ScalingController::shutdown`] stops
/// them all.
pub struct ScalingController {
    config: ScalingConfigs,
    launcher: Arc<dyn ConsumerLauncher>,
    sampler: Arc<dyn LoadSampler>,
    active: Mutex<Vec<PoolConsumer>>,
    window: std::sync::Mutex<SlidingWindow>,
    cancel: CancellationToken,
}

impl ScalingController {
    /// Creates an idle controller. Call [`ScalingController::start_initial`] and then
    /// [`ScalingController::spawn`] to run it.
    ///
    /// # Parameters
    /// * `config` - Pool bounds, cadence and naming
    /// * `launcher` - Starts and retires the consumer of each slot
    /// * `sampler` - Source of the in-flight count
    /// * `parent` - Cancelling it stops the loop and every consumer
    pub fn new(
        config: ScalingConfigs,
        launcher: Arc<dyn ConsumerLauncher>,
        sampler: Arc<dyn LoadSampler>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(ScalingController {
            window: std::sync::Mutex::new(SlidingWindow::new(config.history_size)),
            config,
            launcher,
            sampler,
            active: Mutex::new(vec![]),
            cancel: parent.child_token(),
        })
    }

    /// Starts the protected minimum set of consumers.
    pub async fn start_initial(&self) -> Result<(), AmqpError> {
        let mut active = self.active.lock().await;

        for index in 1..=self.config.min_consumers {
            if active.iter().any(|c| c.index == index) {
                continue;
            }

            let handle = self.launcher.launch(&self.cancel, index).await?;
            info!(consumer = handle.name(), "started protected consumer");
            active.push(PoolConsumer {
                index,
                protected: true,
                handle,
            });
        }

        Ok(())
    }

    /// Consumers that are live or draining.
    pub async fn active_count(&self) -> usize {
        let mut active = self.active.lock().await;
        prune_stopped(&mut active);
        active.len()
    }

    /// Names of the pool's consumers, in start order.
    pub async fn active_consumers(&self) -> Vec<String> {
        let active = self.active.lock().await;
        active.iter().map(|c| c.handle.name().to_owned()).collect()
    }

    /// Takes one sample and applies at most one scaling rule.
    pub async fn evaluate(&self) -> ScalingAction {
        let sample = ScalingSample {
            timestamp: Utc::now(),
            active_message_count: self.sampler.in_flight(),
        };
        let mean = match self.window.lock() {
            Ok(mut window) => {
                window.push(sample);
                window.mean()
            }
            Err(_) => {
                error!("scaling window poisoned");
                return ScalingAction::Hold;
            }
        };

        let mut active = self.active.lock().await;
        prune_stopped(&mut active);
        let count = active.len();

        debug!(
            mean,
            consumers = count,
            in_flight = sample.active_message_count,
            "scaling sample"
        );

        if mean > (count * 2) as f64 && count < self.config.max_consumers {
            let wanted = self
                .config
                .scale_up_step
                .min(self.config.max_consumers - count);
            return self.scale_up(&mut active, wanted).await;
        }

        if mean < count as f64 && count > self.config.min_consumers {
            return self.scale_down(&mut active).await;
        }

        ScalingAction::Hold
    }

    async fn scale_up(&self, active: &mut Vec<PoolConsumer>, wanted: usize) -> ScalingAction {
        let mut started = 0;

        for _ in 0..wanted {
            let index = lowest_free_index(active);
            match self.launcher.launch(&self.cancel, index).await {
                Ok(handle) => {
                    info!(consumer = handle.name(), "scaled up consumer");
                    active.push(PoolConsumer {
                        index,
                        protected: false,
                        handle,
                    });
                    started += 1;
                }
                Err(err) => {
                    error!(error = err.to_string(), index, "failure to start consumer");
                    break;
                }
            }
        }

        if started == 0 {
            return ScalingAction::Hold;
        }
        ScalingAction::ScaledUp(started)
    }

    async fn scale_down(&self, active: &mut Vec<PoolConsumer>) -> ScalingAction {
        let Some(position) = active.iter().rposition(|c| !c.protected) else {
            return ScalingAction::Hold;
        };

        let victim = &active[position];
        if let Err(err) = self.launcher.retire(&victim.handle).await {
            error!(
                error = err.to_string(),
                consumer = victim.handle.name(),
                "failure to detach consumer queue, keeping consumer"
            );
            return ScalingAction::Hold;
        }
        victim.handle.stop().await;

        let retired = active.remove(position);
        info!(consumer = retired.handle.name(), "scaled down consumer");
        ScalingAction::ScaledDown(retired.handle.name().to_owned())
    }

    /// Evaluates every `interval` until the controller is shut down.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                _ = ticker.tick() => {
                    let action = self.evaluate().await;
                    if action != ScalingAction::Hold {
                        debug!(?action, "scaling action applied");
                    }
                }
            }
        }

        debug!("scaling loop stopped");
    }

    /// Runs [`ScalingController::run`] on a new task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move { controller.run().await })
    }

    /// Stops the scaling loop and every consumer, returning once all of them drained.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let mut active = self.active.lock().await;
        join_all(active.iter().map(|c| c.handle.stop())).await;
        active.clear();

        info!("consumer pool stopped");
    }
}

fn prune_stopped(active: &mut Vec<PoolConsumer>) {
    active.retain(|c| {
        let stopped = c.handle.is_stopped();
        if stopped {
            warn!(consumer = c.handle.name(), "removing stopped consumer from pool");
        }
        !stopped
    });
}

fn lowest_free_index(active: &[PoolConsumer]) -> usize {
    (1..)
        .find(|index| active.iter().all(|c| c.index != *index))
        .unwrap_or(active.len() + 1)
}
