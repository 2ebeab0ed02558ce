// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use async_trait::async_trait;
use hashbus::{
    consumer::DeliveryHandler,
    dispatcher::HandlerContext,
    errors::ConsumeError,
    exchange::{ExchangeDefinition, HASH_ON_HEADER},
    memory::MemoryBroker,
    queue::QueueDefinition,
    topology::{AmqpTopology, Topology},
    transport::InboundDelivery,
};
use serde_json::{Map, Value};
use std::{sync::Arc, time::Duration};

pub const EXCHANGE: &str = "hashed.events";

/// A memory broker with the consistent-hash exchange and one durable queue per
/// `(name, weight)` binding.
pub async fn hashed_broker(bindings: &[(&str, u32)]) -> Arc<MemoryBroker> {
    let broker = MemoryBroker::new();

    let mut topology = AmqpTopology::new(broker.clone()).exchange(
        ExchangeDefinition::new(EXCHANGE)
            .consistent_hash(HASH_ON_HEADER)
            .durable(),
    );
    for (queue, _) in bindings {
        topology = topology.queue(QueueDefinition::new(queue).durable().with_dlq());
    }
    topology.install().await.unwrap();

    for (queue, weight) in bindings {
        topology.bind_weighted(queue, EXCHANGE, *weight).await.unwrap();
    }

    broker
}

pub fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Acknowledges everything.
pub struct AckAll;

#[async_trait]
impl DeliveryHandler for AckAll {
    async fn handle(&self, _: &HandlerContext, _: &InboundDelivery) -> Result<(), ConsumeError> {
        Ok(())
    }
}
