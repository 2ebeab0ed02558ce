// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{hashed_broker, payload, EXCHANGE};
use hashbus::{
    consumer::{ConsumerHandle, ConsumerRuntime},
    dispatcher::{handler_fn, DispatchRegistry, EventDispatcher},
    envelope::{events, EventEnvelope},
    errors::{HandlerError, RequestError},
    memory::MemoryBroker,
    publisher::{PublishOptions, RabbitMQPublisher},
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize, PartialEq)]
struct Approval {
    approved: bool,
    amount: f64,
}

#[derive(Debug, Deserialize)]
struct Transfer {
    amount: f64,
}

async fn transaction_service(broker: &Arc<MemoryBroker>) -> ConsumerHandle {
    let registry = DispatchRegistry::new().register_exact(
        events::TRANSACTION,
        handler_fn(|_ctx, event| async move {
            let transfer: Transfer = event.payload_as()?;
            if transfer.amount <= 0.0 {
                return Err(HandlerError::Failed("amount must be positive".into()));
            }
            Ok(json!({"approved": true, "amount": transfer.amount}))
        }),
    );

    ConsumerRuntime::new(broker.clone(), EventDispatcher::new(registry, broker.clone()))
        .start(&CancellationToken::new(), "q1", "transactions")
        .await
        .unwrap()
}

fn transaction(amount: f64) -> EventEnvelope {
    EventEnvelope::new(events::TRANSACTION, payload(json!({"amount": amount})))
}

#[tokio::test]
async fn reply_body_is_returned_unmodified() {
    let broker = hashed_broker(&[("q1", 1)]).await;
    let service = transaction_service(&broker).await;
    let publisher = RabbitMQPublisher::new(broker.clone());

    let body = transaction(25.0).encode().unwrap();
    let reply = publisher
        .publish_and_await(
            &CancellationToken::new(),
            EXCHANGE,
            events::TRANSACTION,
            "wallet-1",
            &body,
            Some(Duration::from_secs(5)),
        )
        .await
        .unwrap();

    let reply: Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(
        reply,
        json!({"success": true, "data": {"approved": true, "amount": 25.0}, "error": ""})
    );

    service.stop().await;
}

#[tokio::test]
async fn typed_request_decodes_data_and_surfaces_remote_failures() {
    let broker = hashed_broker(&[("q1", 1)]).await;
    let service = transaction_service(&broker).await;
    let publisher = RabbitMQPublisher::new(broker.clone());
    let ctx = CancellationToken::new();

    let approval: Approval = publisher
        .request(&ctx, EXCHANGE, "wallet-1", &transaction(10.0), None)
        .await
        .unwrap();
    assert_eq!(
        approval,
        Approval {
            approved: true,
            amount: 10.0
        }
    );

    let rejected = publisher
        .request::<Approval>(&ctx, EXCHANGE, "wallet-1", &transaction(-1.0), None)
        .await;
    assert_eq!(
        rejected,
        Err(RequestError::Remote("amount must be positive".into()))
    );

    service.stop().await;
}

#[tokio::test]
async fn unhandled_request_fails_fast_instead_of_timing_out() {
    let broker = hashed_broker(&[("q1", 1)]).await;
    let service = transaction_service(&broker).await;
    let publisher = RabbitMQPublisher::new(broker.clone());

    let audit = EventEnvelope::new("audit.created", payload(json!({})));
    let reply = publisher
        .publish_event(
            &CancellationToken::new(),
            &audit,
            &PublishOptions::new(EXCHANGE, "wallet-1").wait_response(Some(Duration::from_secs(5))),
        )
        .await
        .unwrap()
        .unwrap();

    let reply: Value = serde_json::from_slice(&reply).unwrap();
    assert_eq!(reply["success"], json!(false));
    assert_eq!(
        reply["error"],
        json!("no handler registered for event type `audit.created`")
    );

    service.stop().await;
}

#[tokio::test(start_paused = true)]
async fn request_nobody_answers_times_out_after_the_configured_duration() {
    let broker = hashed_broker(&[("q1", 1)]).await;
    let publisher = RabbitMQPublisher::new(broker.clone());

    let started = Instant::now();
    let result = publisher
        .request::<Value>(
            &CancellationToken::new(),
            EXCHANGE,
            "wallet-1",
            &transaction(5.0),
            Some(Duration::from_secs(2)),
        )
        .await;

    assert_eq!(result, Err(RequestError::Timeout(Duration::from_secs(2))));
    assert_eq!(started.elapsed(), Duration::from_secs(2));

    // The unanswered request is still waiting in the service queue; its reply queue is gone.
    let request = broker.get("q1").await.unwrap();
    let reply_to = request.properties.reply_to.unwrap();
    assert!(!broker.has_queue(&reply_to));
}

#[tokio::test]
async fn cancelled_request_is_never_published() {
    let broker = hashed_broker(&[("q1", 1)]).await;
    let publisher = RabbitMQPublisher::new(broker.clone());
    let ctx = CancellationToken::new();
    ctx.cancel();

    let result = publisher
        .publish_and_await(
            &ctx,
            EXCHANGE,
            events::TRANSACTION,
            "wallet-1",
            &transaction(5.0).encode().unwrap(),
            Some(Duration::from_secs(1)),
        )
        .await;

    assert_eq!(result, Err(RequestError::Cancelled));
    assert!(broker.get("q1").await.is_none());
}
