// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management
//!
//! Types for defining exchanges. Besides the standard AMQP kinds this supports the
//! consistent-hash exchange, which hashes a designated message header to pick exactly
//! one of its weighted queue bindings, giving sticky routing for related messages.

use crate::transport::{Arguments, HeaderValue};

/// Exchange argument naming the header the consistent-hash exchange hashes on
pub const AMQP_ARGS_HASH_HEADER: &str = "hash-header";
/// Message header carrying the hash input
pub const HASH_ON_HEADER: &str = "hash-on";
/// Broker-side type name of the consistent-hash exchange plugin
pub const CONSISTENT_HASH_EXCHANGE_TYPE: &str = "x-consistent-hash";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: routes on exact routing key match
/// - Fanout: broadcasts to every bound queue
/// - Topic: routes on `*`/`#` pattern match of routing keys
/// - Headers: routes on header values
/// - ConsistentHash: routes to one weighted binding chosen by hashing a header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    ConsistentHash,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::ConsistentHash => {
                lapin::ExchangeKind::Custom(CONSISTENT_HASH_EXCHANGE_TYPE.to_owned())
            }
        }
    }
}

/// Definition of an exchange with its configuration parameters.
///
/// Built with chained setters, starting from a non-durable direct exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: Arguments,
}

impl ExchangeDefinition {
    /// Creates a new direct exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            no_wait: false,
            params: Arguments::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    pub fn arguments(&self) -> &Arguments {
        &self.params
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Makes this a consistent-hash exchange hashing on `header`.
    ///
    /// Requires the consistent-hash exchange plugin on the broker. Queues bound to it
    /// use their decimal weight as routing key.
    pub fn consistent_hash(mut self, header: &str) -> Self {
        self.kind = ExchangeKind::ConsistentHash;
        self.params.insert(
            AMQP_ARGS_HASH_HEADER.to_owned(),
            HeaderValue::String(header.to_owned()),
        );
        self
    }

    /// Header the consistent-hash exchange hashes on, if configured.
    pub fn hash_header(&self) -> Option<&str> {
        match self.params.get(AMQP_ARGS_HASH_HEADER) {
            Some(HeaderValue::String(header)) => Some(header),
            _ => None,
        }
    }

    /// Adds a single argument to the exchange.
    pub fn param(mut self, key: &str, value: HeaderValue) -> Self {
        self.params.insert(key.to_owned(), value);
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consistent_hash_exchange_names_its_hash_header() {
        let def = ExchangeDefinition::new("hashed.events")
            .consistent_hash(HASH_ON_HEADER)
            .durable();

        assert_eq!(def.exchange_kind(), &ExchangeKind::ConsistentHash);
        assert_eq!(def.hash_header(), Some("hash-on"));
        assert!(def.is_durable());
        assert!(!def.is_auto_delete());
    }

    #[test]
    fn extra_params_sit_next_to_the_hash_header() {
        let def = ExchangeDefinition::new("hashed.events")
            .consistent_hash(HASH_ON_HEADER)
            .param("alternate-exchange", HeaderValue::from("unrouted"));

        assert_eq!(def.arguments().len(), 2);
        assert_eq!(
            def.arguments().get("alternate-exchange"),
            Some(&HeaderValue::String("unrouted".into()))
        );
    }

    #[test]
    fn consistent_hash_maps_to_the_plugin_type() {
        let kind: lapin::ExchangeKind = (&ExchangeKind::ConsistentHash).into();
        assert!(matches!(
            kind,
            lapin::ExchangeKind::Custom(ref name) if name == CONSISTENT_HASH_EXCHANGE_TYPE
        ));
    }
}
