//! Alert events and the sinks that deliver them.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tracing::{error, info, warn};

use ticketq_core::config::AlertSeverity;
use ticketq_core::result::AppResult;

/// A fired alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    /// Name of the rule that fired.
    #[serde(rename = "type")]
    pub alert_type: String,
    /// Severity of the rule.
    pub severity: AlertSeverity,
    /// Human readable summary.
    pub message: String,
    /// Observed value, threshold and metric.
    pub context: Value,
    /// When the rule fired.
    pub timestamp: DateTime<Utc>,
}

/// Destination for alert events.
#[async_trait]
pub trait AlertSink: Send + Sync + std::fmt::Debug {
    /// Sink name for logs.
    fn name(&self) -> &str;

    /// Deliver one event.
    async fn send(&self, event: &AlertEvent) -> AppResult<()>;
}

/// Writes alerts to the structured log under the `ticketq::alert` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, event: &AlertEvent) -> AppResult<()> {
        let context = event.context.to_string();
        match event.severity {
            AlertSeverity::Critical => error!(
                target: "ticketq::alert",
                alert_type = %event.alert_type,
                severity = %event.severity,
                context = %context,
                "{}",
                event.message
            ),
            AlertSeverity::Warning => warn!(
                target: "ticketq::alert",
                alert_type = %event.alert_type,
                severity = %event.severity,
                context = %context,
                "{}",
                event.message
            ),
            AlertSeverity::Info => info!(
                target: "ticketq::alert",
                alert_type = %event.alert_type,
                severity = %event.severity,
                context = %context,
                "{}",
                event.message
            ),
        }
        Ok(())
    }
}

/// Publishes alerts on a broadcast channel for in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastAlertSink {
    tx: broadcast::Sender<AlertEvent>,
}

impl BroadcastAlertSink {
    /// Create a sink whose channel buffers `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future alerts.
    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl AlertSink for BroadcastAlertSink {
    fn name(&self) -> &str {
        "broadcast"
    }

    async fn send(&self, event: &AlertEvent) -> AppResult<()> {
        // No subscribers is not an error.
        let _ = self.tx.send(event.clone());
        Ok(())
    }
}

/// Forwards only critical alerts to an inner sink, e.g. a paging channel.
#[derive(Debug)]
pub struct CriticalOnly<S> {
    inner: S,
}

impl<S: AlertSink> CriticalOnly<S> {
    /// Wrap a sink.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: AlertSink> AlertSink for CriticalOnly<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn send(&self, event: &AlertEvent) -> AppResult<()> {
        if event.severity == AlertSeverity::Critical {
            self.inner.send(event).await
        } else {
            Ok(())
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingAlertSink {
    events: Arc<Mutex<Vec<AlertEvent>>>,
}

impl RecordingAlertSink {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far.
    pub async fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, event: &AlertEvent) -> AppResult<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
