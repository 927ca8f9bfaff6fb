//! Stage domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::RawBytes;
use crate::spec::SkipOptions;

/// Runtime status of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    NotStarted,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
    /// The plugin asked to end the pipeline early, successfully
    Exited,
}

impl StageStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::NotStarted | Self::Running)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Cancelled => "CANCELLED",
            Self::Skipped => "SKIPPED",
            Self::Exited => "EXITED",
        };
        f.write_str(s)
    }
}

/// A pipeline stage resolved at plan time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    /// Unique among non-rollback stages; a rollback stage may share it
    pub index: u32,
    /// Owning plugin
    pub plugin: String,
    #[serde(default)]
    pub rollback: bool,
    /// Stage `with` payload, decoded only by the owning plugin
    #[serde(default)]
    pub config: RawBytes,
    pub status: StageStatus,
    #[serde(default)]
    pub status_reason: String,
    /// IDs of the stages this one depends on (rollback -> rolled-back stages)
    #[serde(default)]
    pub predecessors: Vec<String>,
    #[serde(default)]
    pub retried_count: u32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub skip_on: SkipOptions,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Set status and reason, keeping timestamps monotonic
    pub fn set_status(&mut self, status: StageStatus, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = status;
        self.status_reason = reason.into();
        self.updated_at = self.updated_at.max(now);
        if status.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
    }
}
