// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Envelope
//!
//! The typed wrapper moved over the bus: `{"type", "timestamp", "payload"}` where the
//! timestamp is RFC3339 and the payload a JSON object. The type is the dispatch key and
//! usually the routing key.
//!
//! Decoding distinguishes bodies that parse but are not envelopes (`Malformed`, never
//! retried) from bodies that cannot be read at all (`Unreadable`, retried once).

use crate::errors::{EnvelopeError, HandlerError};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{error::Category, Map, Value};

/// Well-known event types.
pub mod events {
    pub const USER_REGISTERED: &str = "user.registered";
    pub const USER_LOGGED_IN: &str = "user.logged_in";
    pub const WALLET_CREATED: &str = "wallet.created";
    pub const DEPOSIT_CREATED: &str = "deposit.created";
    pub const TRANSACTION: &str = "transaction";
}

/// An event with its type, creation time and free-form payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    kind: String,
    timestamp: DateTime<Utc>,
    payload: Map<String, Value>,
}

impl EventEnvelope {
    /// Creates an envelope stamped with the current time.
    pub fn new(kind: &str, payload: Map<String, Value>) -> Self {
        EventEnvelope::with_timestamp(kind, Utc::now(), payload)
    }

    pub fn with_timestamp(kind: &str, timestamp: DateTime<Utc>, payload: Map<String, Value>) -> Self {
        EventEnvelope {
            kind: kind.to_owned(),
            timestamp,
            payload,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|err| EnvelopeError::Encode(err.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: EventEnvelope = serde_json::from_slice(data).map_err(|err| {
            match err.classify() {
                Category::Io | Category::Eof => EnvelopeError::Unreadable(err.to_string()),
                Category::Syntax | Category::Data => EnvelopeError::Malformed(err.to_string()),
            }
        })?;

        if envelope.kind.is_empty() {
            return Err(EnvelopeError::Malformed("empty event type".to_owned()));
        }

        Ok(envelope)
    }

    /// Decodes the whole payload into `T`, failing closed on any missing or
    /// mismatched field.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|err| HandlerError::InvalidPayload(err.to_string()))
    }

    /// A string payload field the handler cannot do without.
    pub fn required_str(&self, key: &str) -> Result<&str, HandlerError> {
        match self.payload.get(key) {
            Some(Value::String(value)) => Ok(value),
            Some(other) => Err(HandlerError::InvalidPayload(format!(
                "`{key}` must be a string, got {other}"
            ))),
            None => Err(HandlerError::MissingField(key.to_owned())),
        }
    }
}

/// Body of a reply to a request: the handler's result or its error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope<T = Value> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub error: String,
}

impl ReplyEnvelope<Value> {
    pub fn ok(data: Value) -> Self {
        ReplyEnvelope {
            success: true,
            data: Some(data),
            error: String::new(),
        }
    }

    pub fn failed(error: &str) -> Self {
        ReplyEnvelope {
            success: false,
            data: None,
            error: error.to_owned(),
        }
    }
}
