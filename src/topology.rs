// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! Declares exchanges and queues and binds them. Topology is usually registered up
//! front and installed once at startup, but the scaling controller also declares and
//! binds pool queues at runtime through the same manager.
//!
//! Weighted bindings to a consistent-hash exchange use the decimal weight as routing
//! key. Binding the same queue again with another weight adds to its share of the hash
//! space; an identical re-bind is a no-op on the broker.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::Transport,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Interface for registering topology and installing it on the broker.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self
    where
        Self: Sized;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self
    where
        Self: Sized;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self
    where
        Self: Sized;

    /// Creates all exchanges, then all queues, then all bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Topology manager over a shared transport.
pub struct AmqpTopology {
    transport: Arc<dyn Transport>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    pub fn new(transport: Arc<dyn Transport>) -> AmqpTopology {
        AmqpTopology {
            transport,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// Declares a single exchange.
    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.transport.declare_exchange(def).await
    }

    /// Declares a queue, and its dead letter queue first when it has one. Returns the
    /// queue name, generated by the broker for unnamed queues.
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        if let Some(dlq) = def.dlq_definition() {
            self.transport.declare_queue(&dlq).await?;
        }

        self.transport.declare_queue(def).await
    }

    pub async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.transport.bind_queue(binding).await
    }

    /// Binds `queue` to a consistent-hash `exchange` with `weight` points of the hash
    /// space.
    pub async fn bind_weighted(
        &self,
        queue: &str,
        exchange: &str,
        weight: u32,
    ) -> Result<(), AmqpError> {
        if weight == 0 {
            error!(queue, exchange, "binding weight must be positive");
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        debug!(queue, exchange, weight, "binding weighted queue");
        self.bind(&QueueBinding::weighted(queue, exchange, weight))
            .await
    }

    /// Removes a weighted binding, giving its share of the hash space back to the
    /// remaining bindings.
    pub async fn unbind_weighted(
        &self,
        queue: &str,
        exchange: &str,
        weight: u32,
    ) -> Result<(), AmqpError> {
        debug!(queue, exchange, weight, "unbinding weighted queue");
        self.transport
            .unbind_queue(&QueueBinding::weighted(queue, exchange, weight))
            .await
    }

    pub async fn delete_queue(&self, name: &str) -> Result<(), AmqpError> {
        self.transport.delete_queue(name).await
    }

    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            self.declare_exchange(exch).await?;
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            self.declare_queue(def).await?;
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            self.bind(binding).await?;
        }

        debug!("queues were bound");
        Ok(())
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }
}
