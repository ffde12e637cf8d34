//! Integration tests for threshold alerting.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use ticketq_core::config::{AlertMetric, AlertRuleConfig, AlertSeverity, MonitoringConfig};
use ticketq_entity::job::DurabilityTier;
use ticketq_queue::monitor::alerts::{CriticalOnly, RecordingAlertSink};
use ticketq_queue::{Broker, EnqueueRequest, JobHandler, Monitor};

use crate::helpers::{CountingHandler, TestApp};

fn backlog_rule(threshold: f64, severity: AlertSeverity) -> AlertRuleConfig {
    AlertRuleConfig {
        name: "communication_backlog".to_string(),
        metric: AlertMetric::QueueDepth {
            queue: "communication".to_string(),
        },
        threshold,
        severity,
        cooldown_seconds: 300,
    }
}

async fn fill_communication(app: &TestApp, n: usize) {
    for i in 0..n {
        app.queue
            .enqueue(EnqueueRequest::new(
                "communication",
                "send-email",
                json!({"template": "reminder", "recipient": format!("fan{i}@example.com"), "date": "2024-06-01"}),
                DurabilityTier::Standard,
            ))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_breach_notifies_once_per_cooldown() {
    let app = TestApp::new();
    let sink = RecordingAlertSink::new();
    let config = MonitoringConfig {
        rules: vec![backlog_rule(5.0, AlertSeverity::Warning)],
        ..MonitoringConfig::default()
    };
    let monitor = Monitor::new(
        Arc::clone(&app.broker) as Arc<dyn Broker>,
        Arc::clone(&app.metrics),
        &config,
    )
    .with_sink(Arc::new(sink.clone()));

    fill_communication(&app, 8).await;

    let start = Utc::now();
    for tick in 0..10 {
        monitor
            .evaluate_at(start + Duration::seconds(tick * 30))
            .await
            .unwrap();
    }

    let events = sink.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].alert_type, "communication_backlog");
    assert_eq!(events[0].context["value"], json!(8.0));
    assert_eq!(events[0].timestamp, start);
}

#[tokio::test]
async fn test_paging_sink_receives_only_critical() {
    let app = TestApp::new();
    let log = RecordingAlertSink::new();
    let pager = RecordingAlertSink::new();
    let mut warning = backlog_rule(1.0, AlertSeverity::Warning);
    warning.name = "communication_backlog_warning".to_string();
    let config = MonitoringConfig {
        rules: vec![warning, backlog_rule(2.0, AlertSeverity::Critical)],
        ..MonitoringConfig::default()
    };
    let monitor = Monitor::new(
        Arc::clone(&app.broker) as Arc<dyn Broker>,
        Arc::clone(&app.metrics),
        &config,
    )
    .with_sink(Arc::new(log.clone()))
    .with_sink(Arc::new(CriticalOnly::new(pager.clone())));

    fill_communication(&app, 3).await;
    let fired = monitor.evaluate_at(Utc::now()).await.unwrap();

    assert_eq!(fired.len(), 2);
    assert_eq!(log.events().await.len(), 2);
    let paged = pager.events().await;
    assert_eq!(paged.len(), 1);
    assert_eq!(paged[0].severity, AlertSeverity::Critical);
}

#[tokio::test]
async fn test_failure_rate_alert_from_handler_outcomes() {
    let app = TestApp::new();
    let handler = Arc::new(CountingHandler::new("analytics-event").failing());
    let executor = app.executor(vec![Arc::clone(&handler) as Arc<dyn JobHandler>]);
    for i in 0..5 {
        app.queue
            .enqueue(EnqueueRequest::new(
                "background",
                "analytics-event",
                json!({"eventId": format!("evt-{i}")}),
                DurabilityTier::Ephemeral,
            ))
            .await
            .unwrap();
    }
    app.drain(&executor).await;

    let sink = RecordingAlertSink::new();
    let config = MonitoringConfig {
        failure_min_samples: 5,
        rules: vec![AlertRuleConfig {
            name: "high_failure_rate".to_string(),
            metric: AlertMetric::FailureRate,
            threshold: 0.10,
            severity: AlertSeverity::Warning,
            cooldown_seconds: 600,
        }],
        ..MonitoringConfig::default()
    };
    let monitor = Monitor::new(
        Arc::clone(&app.broker) as Arc<dyn Broker>,
        Arc::clone(&app.metrics),
        &config,
    )
    .with_sink(Arc::new(sink.clone()));

    let fired = monitor.evaluate_at(Utc::now()).await.unwrap();
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].context["value"], json!(1.0));
    assert_eq!(sink.events().await.len(), 1);
}
