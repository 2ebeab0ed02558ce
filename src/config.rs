// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Connection and scaling settings. Loading them (files, secrets, flags) is left to the
//! embedding application; these structs deserialize from any serde source and fall back
//! to the defaults a local RabbitMQ uses.

use serde::Deserialize;
use std::{env, time::Duration};

/// RabbitMQ connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Name reported to the broker for this connection.
    pub connection_name: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "".to_owned(),
            connection_name: "hashbus".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// Builds the AMQP URI used to dial (and re-dial) the broker.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    /// Defaults overridden by `RABBITMQ_HOST`, `RABBITMQ_PORT`, `RABBITMQ_USER`,
    /// `RABBITMQ_PASSWORD`, `RABBITMQ_VHOST` and `APP_NAME` when set.
    ///
    /// An unparsable port keeps the default.
    pub fn from_env() -> Self {
        let mut cfg = RabbitMQConfigs::default();

        if let Ok(host) = env::var("RABBITMQ_HOST") {
            cfg.host = host;
        }
        if let Some(port) = env::var("RABBITMQ_PORT").ok().and_then(|p| p.parse().ok()) {
            cfg.port = port;
        }
        if let Ok(user) = env::var("RABBITMQ_USER") {
            cfg.user = user;
        }
        if let Ok(password) = env::var("RABBITMQ_PASSWORD") {
            cfg.password = password;
        }
        if let Ok(vhost) = env::var("RABBITMQ_VHOST") {
            cfg.vhost = vhost;
        }
        if let Ok(name) = env::var("APP_NAME") {
            cfg.connection_name = name;
        }

        cfg
    }
}

/// Bounds and cadence of the elastic consumer pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScalingConfigs {
    pub min_consumers: usize,
    pub max_consumers: usize,
    pub interval_secs: u64,
    /// Capacity of the sliding window of load samples.
    pub history_size: usize,
    /// Most consumers added by a single scale-up.
    pub scale_up_step: usize,
    pub queue_prefix: String,
    pub consumer_prefix: String,
    /// Consistent-hash exchange every pool queue is bound to.
    pub exchange: String,
    /// Weight each pool queue is bound with.
    pub consumer_weight: u32,
}

impl Default for ScalingConfigs {
    fn default() -> Self {
        ScalingConfigs {
            min_consumers: 2,
            max_consumers: 10,
            interval_secs: 30,
            history_size: 5,
            scale_up_step: 2,
            queue_prefix: "sync_queue".to_owned(),
            consumer_prefix: "sync_consumer".to_owned(),
            exchange: "hashed.events".to_owned(),
            consumer_weight: 1,
        }
    }
}

impl ScalingConfigs {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn queue_name(&self, index: usize) -> String {
        format!("{}_{}", self.queue_prefix, index)
    }

    pub fn consumer_name(&self, index: usize) -> String {
        format!("{}_{}", self.consumer_prefix, index)
    }
}
