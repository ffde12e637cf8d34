//! Job status, priority, and durability tier enumerations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Admitted and waiting in the broker.
    Pending,
    /// Currently being processed by a worker.
    Processing,
    /// Successfully completed.
    Completed,
    /// The last attempt failed.
    Failed,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a job in this state is a recovery candidate after a crash.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Pending | Self::Processing)
    }

    /// Return the status as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Priority level for a background job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "job_priority", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Low priority (processed last).
    Low,
    /// Normal priority (default).
    Normal,
    /// High priority.
    High,
    /// Critical priority (processed first).
    Critical,
}

impl JobPriority {
    /// Return the priority as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declared durability guarantee of a job. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "durability_tier", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DurabilityTier {
    /// Tier 1: every transition is written to the relational store before returning,
    /// and mirrored into the fast cache.
    Critical,
    /// Tier 2: fast cache only, with periodic snapshots.
    Standard,
    /// Tier 3: broker memory only; lost on crash.
    Ephemeral,
}

impl DurabilityTier {
    /// Numeric tier (1 = critical).
    pub fn level(&self) -> u8 {
        match self {
            Self::Critical => 1,
            Self::Standard => 2,
            Self::Ephemeral => 3,
        }
    }

    /// Whether the relational store holds this tier's jobs.
    pub fn is_durable(&self) -> bool {
        matches!(self, Self::Critical)
    }

    /// Return the tier as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Standard => "standard",
            Self::Ephemeral => "ephemeral",
        }
    }
}

impl fmt::Display for DurabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
