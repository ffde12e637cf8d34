//! Integration tests for duplicate collapse and result replay.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use ticketq_core::config::AppConfig;
use ticketq_database::JobStore;
use ticketq_entity::job::{DurabilityTier, JobPriority, JobStatus};
use ticketq_queue::{EnqueueOutcome, EnqueueRequest, JobHandler};

use crate::helpers::{CountingHandler, TestApp};

fn payment() -> EnqueueRequest {
    EnqueueRequest::new(
        "money",
        "payment-process",
        json!({
            "venueId": "venue-1",
            "userId": "user-1",
            "eventId": "event-1",
            "amount": 4500,
            "currency": "usd"
        }),
        DurabilityTier::Critical,
    )
    .with_priority(JobPriority::High)
}

fn refund() -> EnqueueRequest {
    EnqueueRequest::new(
        "money",
        "refund-process",
        json!({"transactionId": "TX123", "reason": "duplicate charge"}),
        DurabilityTier::Critical,
    )
}

#[tokio::test]
async fn test_payment_replay_returns_cached_result() {
    let app = TestApp::new();
    let handler = Arc::new(CountingHandler::new("payment-process").limited_by("stripe"));
    let executor = app.executor(vec![Arc::clone(&handler) as Arc<dyn JobHandler>]);

    let first = app.queue.enqueue(payment()).await.unwrap();
    let job_id = first.job_id().unwrap();
    assert_eq!(app.drain(&executor).await, 1);

    let row = app.store.find_by_id(job_id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Completed);
    let result = row.result.clone().unwrap();

    let second = app.queue.enqueue(payment()).await.unwrap();
    assert_eq!(
        second,
        EnqueueOutcome::Duplicate {
            job_id,
            cached_result: Some(result),
        }
    );
    assert_eq!(app.drain(&executor).await, 0);
    assert_eq!(handler.calls(), 1);
    assert_eq!(app.store.len(), 1);
}

#[tokio::test]
async fn test_concurrent_refund_submissions_collapse() {
    let app = TestApp::new();
    let handler = Arc::new(CountingHandler::new("refund-process").limited_by("stripe"));
    let executor = app.executor(vec![Arc::clone(&handler) as Arc<dyn JobHandler>]);

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let queue = Arc::clone(&app.queue);
            tokio::spawn(async move { queue.enqueue(refund()).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap().unwrap());
    }

    let queued: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, EnqueueOutcome::Queued { .. }))
        .collect();
    assert_eq!(queued.len(), 1);
    let job_id = queued[0].job_id().unwrap();
    assert!(outcomes.iter().all(|o| o.job_id() == Some(job_id)));
    assert_eq!(app.store.len(), 1);
    assert_eq!(app.records.len(), 1);

    app.drain(&executor).await;
    assert_eq!(handler.calls(), 1);

    match app.queue.enqueue(refund()).await.unwrap() {
        EnqueueOutcome::Duplicate {
            job_id: existing,
            cached_result,
        } => {
            assert_eq!(existing, job_id);
            assert_eq!(cached_result.unwrap()["run"], 1);
        }
        other => panic!("expected duplicate, got {other:?}"),
    }
}

#[tokio::test]
async fn test_redelivery_after_completion_replays() {
    let app = TestApp::new();
    let handler = Arc::new(CountingHandler::new("refund-process"));
    let executor = app.executor(vec![Arc::clone(&handler) as Arc<dyn JobHandler>]);

    app.queue.enqueue(refund()).await.unwrap();
    let delivery = app.next_delivery().await.unwrap();
    let job = delivery.job.clone();
    executor.execute(&job).await.unwrap();

    // The broker delivers the same job again, e.g. after a lost ack.
    let outcome = executor.execute(&job).await.unwrap();
    assert!(matches!(outcome, ticketq_queue::ExecutionOutcome::Replayed(_)));
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_distinct_payloads_are_not_duplicates() {
    let app = TestApp::new();
    let mut other = payment();
    other.payload["amount"] = json!(9000);

    let a = app.queue.enqueue(payment()).await.unwrap();
    let b = app.queue.enqueue(other).await.unwrap();
    assert!(matches!(a, EnqueueOutcome::Queued { .. }));
    assert!(matches!(b, EnqueueOutcome::Queued { .. }));
    assert_ne!(a.job_id(), b.job_id());
}

fn analytics(event_id: &str) -> EnqueueRequest {
    EnqueueRequest::new(
        "background",
        "analytics-event",
        json!({"eventId": event_id, "kind": "page_view"}),
        DurabilityTier::Ephemeral,
    )
}

#[tokio::test]
async fn test_declined_payment_can_be_resubmitted() {
    let app = TestApp::new();
    let handler = Arc::new(CountingHandler::new("payment-process").declining());
    let executor = app.executor(vec![Arc::clone(&handler) as Arc<dyn JobHandler>]);

    let first = app.queue.enqueue(payment()).await.unwrap().job_id().unwrap();
    assert_eq!(app.drain(&executor).await, 1);
    let row = app.store.find_by_id(first).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Failed);
    assert!(app.records.is_empty());

    // The user fixed their card; the same intent is submitted again.
    let second = app.queue.enqueue(payment()).await.unwrap();
    let EnqueueOutcome::Queued { job_id } = second else {
        panic!("expected a fresh job, got {second:?}");
    };
    assert_ne!(job_id, first);
    assert_eq!(app.drain(&executor).await, 1);
    assert_eq!(handler.calls(), 2);
}

#[tokio::test]
async fn test_exhausted_retries_free_the_key() {
    let app = TestApp::new();
    let handler = Arc::new(CountingHandler::new("analytics-event").failing());
    let executor = app.executor(vec![Arc::clone(&handler) as Arc<dyn JobHandler>]);

    app.queue.enqueue(analytics("evt-1")).await.unwrap();
    for _ in 0..100 {
        app.drain(&executor).await;
        if app.broker.is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handler.calls(), 3);
    assert!(app.records.is_empty());

    let again = app.queue.enqueue(analytics("evt-1")).await.unwrap();
    assert!(matches!(again, EnqueueOutcome::Queued { .. }));
}

#[tokio::test]
async fn test_ephemeral_job_lost_on_restart_can_be_resubmitted() {
    let mut config = AppConfig::default();
    config.idempotency.orphan_grace_seconds = 0;
    let before = TestApp::with_config(config);

    let first = before.queue.enqueue(analytics("evt-2")).await.unwrap();
    let first_id = first.job_id().unwrap();
    // Still queued, so the claim is live.
    assert_eq!(
        before.queue.enqueue(analytics("evt-2")).await.unwrap(),
        EnqueueOutcome::Duplicate {
            job_id: first_id,
            cached_result: None,
        }
    );

    let after = before.restart();
    let resubmitted = after.queue.enqueue(analytics("evt-2")).await.unwrap();
    let EnqueueOutcome::Queued { job_id } = resubmitted else {
        panic!("expected a fresh job, got {resubmitted:?}");
    };
    assert_ne!(job_id, first_id);
    assert_eq!(after.records.len(), 1);
}
