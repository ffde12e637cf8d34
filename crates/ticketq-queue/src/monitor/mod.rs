//! Periodic metric collection and threshold alerting.
//!
//! Every tick reads queue depth and oldest-job age from the broker and the
//! trailing failure rate from [`QueueMetrics`], then evaluates each alert
//! rule. A rule fires when its metric is strictly above the threshold and
//! strictly more than `cooldown_seconds` have passed since it last fired.

pub mod alerts;
pub mod metrics;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{Mutex, watch};
use tokio::time;
use tracing::{debug, error, info, warn};

use ticketq_core::config::{AlertMetric, AlertRuleConfig, MonitoringConfig};
use ticketq_core::result::AppResult;

use crate::broker::{Broker, QueueStats};

pub use alerts::{AlertEvent, AlertSink};
pub use metrics::{MetricsSnapshot, QueueMetrics};

/// An alert rule with its firing state.
#[derive(Debug, Clone)]
pub struct AlertRule {
    /// Rule definition.
    pub config: AlertRuleConfig,
    /// Last time the rule fired.
    pub last_fired_at: Option<DateTime<Utc>>,
}

impl AlertRule {
    fn new(config: AlertRuleConfig) -> Self {
        Self {
            config,
            last_fired_at: None,
        }
    }

    fn cooled_down(&self, now: DateTime<Utc>) -> bool {
        let cooldown = chrono::Duration::try_seconds(self.config.cooldown_seconds)
            .unwrap_or(chrono::Duration::MAX);
        self.last_fired_at.is_none_or(|last| now - last > cooldown)
    }
}

/// Collects metrics and fires alerts on a fixed tick.
#[derive(Debug)]
pub struct Monitor {
    broker: Arc<dyn Broker>,
    metrics: Arc<QueueMetrics>,
    sinks: Vec<Arc<dyn AlertSink>>,
    rules: Mutex<Vec<AlertRule>>,
    tick: Duration,
    min_samples: usize,
}

impl Monitor {
    /// Create a monitor with the configured rules and no sinks.
    pub fn new(broker: Arc<dyn Broker>, metrics: Arc<QueueMetrics>, config: &MonitoringConfig) -> Self {
        Self {
            broker,
            metrics,
            sinks: Vec::new(),
            rules: Mutex::new(config.rules.iter().cloned().map(AlertRule::new).collect()),
            tick: Duration::from_secs(config.tick_seconds.max(1)),
            min_samples: config.failure_min_samples,
        }
    }

    /// Add a destination for fired alerts.
    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Current rules and their firing state.
    pub async fn rules(&self) -> Vec<AlertRule> {
        self.rules.lock().await.clone()
    }

    /// Evaluate every rule as of `now` and deliver the alerts that fire.
    pub async fn evaluate_at(&self, now: DateTime<Utc>) -> AppResult<Vec<AlertEvent>> {
        let mut stats: HashMap<String, QueueStats> = HashMap::new();
        let mut fired = Vec::new();
        let mut rules = self.rules.lock().await;

        for rule in rules.iter_mut() {
            let value = match &rule.config.metric {
                AlertMetric::QueueDepth { queue } | AlertMetric::OldestJobAge { queue } => {
                    if !self.broker.knows_queue(queue) {
                        warn!(rule = %rule.config.name, queue = %queue, "Alert rule names unknown queue");
                        continue;
                    }
                    if !stats.contains_key(queue) {
                        let s = self.broker.queue_stats(queue).await?;
                        stats.insert(queue.clone(), s);
                    }
                    let Some(s) = stats.get(queue) else {
                        continue;
                    };
                    match rule.config.metric {
                        AlertMetric::QueueDepth { .. } => s.depth as f64,
                        _ => s.oldest_age_seconds.unwrap_or(0.0),
                    }
                }
                AlertMetric::FailureRate => {
                    match self.metrics.failure_rate_at(now, self.min_samples) {
                        Some(rate) => rate,
                        None => continue,
                    }
                }
            };

            if value <= rule.config.threshold || !rule.cooled_down(now) {
                continue;
            }

            rule.last_fired_at = Some(now);
            let event = AlertEvent {
                alert_type: rule.config.name.clone(),
                severity: rule.config.severity,
                message: format!(
                    "{} is {value:.2}, above threshold {:.2}",
                    rule.config.metric, rule.config.threshold
                ),
                context: json!({
                    "metric": rule.config.metric,
                    "value": value,
                    "threshold": rule.config.threshold,
                    "cooldown_seconds": rule.config.cooldown_seconds,
                }),
                timestamp: now,
            };
            self.deliver(&event).await;
            fired.push(event);
        }

        Ok(fired)
    }

    /// Log one metrics snapshot and evaluate the rules.
    pub async fn tick(&self) -> AppResult<Vec<AlertEvent>> {
        let snapshot = self.metrics.snapshot(self.min_samples);
        info!(
            enqueued = snapshot.enqueued,
            duplicates = snapshot.duplicates,
            throttled = snapshot.throttled,
            completed = snapshot.completed,
            failed = snapshot.failed,
            recovered = snapshot.recovered,
            limiter_timeouts = snapshot.limiter_timeouts,
            failure_rate = snapshot.failure_rate.unwrap_or(0.0),
            "Queue metrics"
        );
        for queue in self.broker.queue_names() {
            let stats = self.broker.queue_stats(&queue).await?;
            debug!(
                queue = %stats.queue,
                depth = stats.depth,
                in_flight = stats.in_flight,
                oldest_age_seconds = stats.oldest_age_seconds.unwrap_or(0.0),
                "Queue stats"
            );
        }
        self.evaluate_at(Utc::now()).await
    }

    /// Tick until `cancel` turns true.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        info!(tick_seconds = self.tick.as_secs(), sinks = self.sinks.len(), "Monitor started");
        let mut interval = time::interval(self.tick);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Monitor tick failed");
                    }
                }
            }
        }
        info!("Monitor stopped");
    }

    async fn deliver(&self, event: &AlertEvent) {
        for sink in &self.sinks {
            if let Err(e) = sink.send(event).await {
                error!(sink = sink.name(), alert_type = %event.alert_type, error = %e, "Alert delivery failed");
            }
        }
    }
}
