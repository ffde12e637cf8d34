//! Queue topology and persistence tuning.

use serde::{Deserialize, Serialize};

/// Queue topology configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Named queues known to the broker. Recovery only resubmits to these.
    #[serde(default = "default_queues")]
    pub queues: Vec<QueueDefinition>,
    /// Number of Tier 2 cache writes between background snapshots.
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every_writes: u64,
    /// Lifetime in seconds of Tier 2 job entries in the fast cache.
    #[serde(default = "default_standard_ttl")]
    pub standard_ttl_seconds: u64,
}

impl QueueConfig {
    /// Look up a queue definition by name.
    pub fn queue(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.iter().find(|q| q.name == name)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            snapshot_every_writes: default_snapshot_every(),
            standard_ttl_seconds: default_standard_ttl(),
        }
    }
}

/// A single named queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDefinition {
    /// Queue name (e.g., `"money"`).
    pub name: String,
    /// Maximum delivery attempts for jobs on this queue.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
}

impl QueueDefinition {
    /// Create a queue definition.
    pub fn new(name: impl Into<String>, max_attempts: i32) -> Self {
        Self {
            name: name.into(),
            max_attempts,
        }
    }
}

fn default_queues() -> Vec<QueueDefinition> {
    vec![
        QueueDefinition::new("money", 10),
        QueueDefinition::new("communication", 5),
        QueueDefinition::new("background", 3),
    ]
}

fn default_snapshot_every() -> u64 {
    100
}

fn default_standard_ttl() -> u64 {
    7 * 86_400
}

fn default_max_attempts() -> i32 {
    3
}
