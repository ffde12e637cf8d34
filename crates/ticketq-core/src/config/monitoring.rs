//! Monitoring and alerting configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Monitoring collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Whether the periodic collector runs.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between evaluation ticks.
    #[serde(default = "default_tick")]
    pub tick_seconds: u64,
    /// Trailing window in seconds for the failure-rate metric.
    #[serde(default = "default_failure_window")]
    pub failure_window_seconds: i64,
    /// Minimum outcomes in the window before the failure rate is trusted.
    #[serde(default = "default_min_samples")]
    pub failure_min_samples: usize,
    /// Alert rules evaluated on every tick.
    #[serde(default = "default_rules")]
    pub rules: Vec<AlertRuleConfig>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_seconds: default_tick(),
            failure_window_seconds: default_failure_window(),
            failure_min_samples: default_min_samples(),
            rules: default_rules(),
        }
    }
}

/// Declarative alert rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleConfig {
    /// Threshold name, unique per rule.
    pub name: String,
    /// Metric the rule observes.
    pub metric: AlertMetric,
    /// The rule fires when the metric is strictly greater than this value.
    pub threshold: f64,
    /// Alert severity.
    #[serde(default)]
    pub severity: AlertSeverity,
    /// Minimum seconds between two firings of this rule.
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: i64,
}

/// Metric observed by an alert rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertMetric {
    /// Number of jobs waiting in a queue.
    QueueDepth {
        /// Queue name.
        queue: String,
    },
    /// Age in seconds of the oldest waiting job in a queue.
    OldestJobAge {
        /// Queue name.
        queue: String,
    },
    /// Fraction of failed executions over the trailing window.
    FailureRate,
}

impl fmt::Display for AlertMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueDepth { queue } => write!(f, "queue_depth[{queue}]"),
            Self::OldestJobAge { queue } => write!(f, "oldest_job_age[{queue}]"),
            Self::FailureRate => write!(f, "failure_rate"),
        }
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational.
    Info,
    /// Needs attention.
    #[default]
    Warning,
    /// Pages the on-call channel.
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tick() -> u64 {
    30
}

fn default_failure_window() -> i64 {
    300
}

fn default_min_samples() -> usize {
    20
}

fn default_cooldown() -> i64 {
    300
}

fn default_rules() -> Vec<AlertRuleConfig> {
    vec![
        AlertRuleConfig {
            name: "money_queue_backlog".to_string(),
            metric: AlertMetric::QueueDepth {
                queue: "money".to_string(),
            },
            threshold: 1_000.0,
            severity: AlertSeverity::Critical,
            cooldown_seconds: 300,
        },
        AlertRuleConfig {
            name: "money_queue_stale".to_string(),
            metric: AlertMetric::OldestJobAge {
                queue: "money".to_string(),
            },
            threshold: 600.0,
            severity: AlertSeverity::Critical,
            cooldown_seconds: 300,
        },
        AlertRuleConfig {
            name: "communication_queue_backlog".to_string(),
            metric: AlertMetric::QueueDepth {
                queue: "communication".to_string(),
            },
            threshold: 5_000.0,
            severity: AlertSeverity::Warning,
            cooldown_seconds: 600,
        },
        AlertRuleConfig {
            name: "high_failure_rate".to_string(),
            metric: AlertMetric::FailureRate,
            threshold: 0.10,
            severity: AlertSeverity::Warning,
            cooldown_seconds: 600,
        },
    ]
}
