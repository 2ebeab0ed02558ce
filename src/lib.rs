// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod scaling;
pub mod topology;
pub mod transport;
