//! Integration tests for durability tiers across a simulated crash.

use std::sync::Arc;

use serde_json::json;

use ticketq_database::JobStore;
use ticketq_entity::job::{DurabilityTier, JobStatus};
use ticketq_queue::{EnqueueRequest, JobHandler};

use crate::helpers::{CountingHandler, TestApp};

#[tokio::test]
async fn test_critical_job_survives_crash_mid_run() {
    let before = TestApp::new();
    let job_id = before
        .queue
        .enqueue(EnqueueRequest::new(
            "money",
            "payment-process",
            json!({"venueId": "v1", "userId": "u1", "eventId": "e1", "amount": 100}),
            DurabilityTier::Critical,
        ))
        .await
        .unwrap()
        .job_id()
        .unwrap();

    // A worker picks the job up and the process dies before it finishes.
    let delivery = before.next_delivery().await.unwrap();
    before
        .persistence
        .mark_processing(&delivery.job)
        .await
        .unwrap()
        .unwrap();

    let after = before.restart();
    assert!(after.next_delivery().await.is_none());

    let report = after.recovery().recover_pending_jobs().await.unwrap();
    assert_eq!(report.recovered, 1);

    let handler = Arc::new(CountingHandler::new("payment-process"));
    let executor = after.executor(vec![Arc::clone(&handler) as Arc<dyn JobHandler>]);
    let redelivered = after.next_delivery().await.unwrap();
    assert_eq!(redelivered.job.id, job_id);
    // 10 allowed on "money", one spent before the crash, one by this delivery.
    assert_eq!(redelivered.attempts_left, 8);

    ticketq_queue::runner::settle(
        after.broker.as_ref(),
        &executor,
        redelivered,
        std::time::Duration::ZERO,
    )
    .await;

    let row = after.store.find_by_id(job_id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Completed);
    assert_eq!(row.attempts, 2);
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_critical_job_queued_before_crash_is_recovered() {
    let before = TestApp::new();
    let job_id = before
        .queue
        .enqueue(EnqueueRequest::new(
            "money",
            "refund-process",
            json!({"transactionId": "TX9"}),
            DurabilityTier::Critical,
        ))
        .await
        .unwrap()
        .job_id()
        .unwrap();

    let after = before.restart();
    after.recovery().recover_pending_jobs().await.unwrap();
    assert_eq!(after.next_delivery().await.unwrap().job.id, job_id);
}

#[tokio::test]
async fn test_ephemeral_and_standard_jobs_are_lost() {
    let before = TestApp::new();
    before
        .queue
        .enqueue(EnqueueRequest::new(
            "background",
            "analytics-event",
            json!({"eventId": "e1", "name": "page_view"}),
            DurabilityTier::Ephemeral,
        ))
        .await
        .unwrap();
    before
        .queue
        .enqueue(EnqueueRequest::new(
            "communication",
            "send-email",
            json!({"recipient": "fan@example.com", "date": "2024-06-01", "template": "daily"}),
            DurabilityTier::Standard,
        ))
        .await
        .unwrap();
    assert!(before.store.is_empty());

    let after = before.restart();
    let report = after.recovery().recover_pending_jobs().await.unwrap();
    assert_eq!(report.scanned, 0);
    assert!(after.broker.is_empty().await);
}

#[tokio::test]
async fn test_completed_jobs_are_not_recovered() {
    let before = TestApp::new();
    let handler = Arc::new(CountingHandler::new("refund-process"));
    let executor = before.executor(vec![Arc::clone(&handler) as Arc<dyn JobHandler>]);
    before
        .queue
        .enqueue(EnqueueRequest::new(
            "money",
            "refund-process",
            json!({"transactionId": "TX10"}),
            DurabilityTier::Critical,
        ))
        .await
        .unwrap();
    before.drain(&executor).await;

    let after = before.restart();
    let report = after.recovery().recover_pending_jobs().await.unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_tier_one_refused_when_store_down() {
    let app = TestApp::new();
    app.store.set_unavailable(true);

    let err = app
        .queue
        .enqueue(EnqueueRequest::new(
            "money",
            "refund-process",
            json!({"transactionId": "TX11"}),
            DurabilityTier::Critical,
        ))
        .await
        .unwrap_err();
    assert!(err.is_database());
    assert!(app.broker.is_empty().await);
}
