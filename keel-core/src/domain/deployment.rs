//! Deployment domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use super::application::GitPath;
use super::stage::Stage;

/// Metadata key holding the JSON-encoded notification config at build time
pub const METADATA_NOTIFICATION: &str = "DeploymentNotification";
/// Metadata key set when a cancel aborted a running rollback
pub const METADATA_ROLLBACK_INTERRUPTED: &str = "rollback_interrupted";

/// How a deployment is rolled out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStrategy {
    /// Let the planner (and plugins) decide
    #[default]
    Auto,
    QuickSync,
    PipelineSync,
}

/// Deployment lifecycle status
///
/// ```text
/// PENDING -> PLANNED -> RUNNING -> SUCCESS | FAILURE | CANCELLED
///                          \-> ROLLING_BACK -> FAILURE | CANCELLED
/// ```
/// PENDING and PLANNED may also jump to FAILURE (planning failed) or
/// CANCELLED (cancel before start). Terminal states never leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    Planned,
    Running,
    RollingBack,
    Success,
    Failure,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use DeploymentStatus::*;
        matches!(
            (self, next),
            (Pending, Planned | Failure | Cancelled)
                | (Planned, Running | Failure | Cancelled)
                | (Running, Success | Failure | Cancelled | RollingBack)
                | (RollingBack, Failure | Cancelled)
        )
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Planned => "PLANNED",
            Self::Running => "RUNNING",
            Self::RollingBack => "ROLLING_BACK",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Outcome of the rollback phase, if one ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RollbackOutcome {
    Succeeded,
    Failed,
    /// A cancel arrived while the rollback stage was running
    Interrupted,
}

/// Commit that caused a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub message: String,
    pub author: String,
    pub branch: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

/// What triggered a deployment and with which strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTrigger {
    pub commit: Commit,
    /// Empty for Git-originated triggers
    #[serde(default)]
    pub commander: String,
    pub timestamp: DateTime<Utc>,
    pub sync_strategy: SyncStrategy,
    #[serde(default)]
    pub strategy_summary: String,
}

/// An artifact version discovered by a plugin during planning
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactVersion {
    pub kind: String,
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub url: String,
}

/// A single deployment of an application
///
/// Created by the trigger, mutated by the executor once planning begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub application_id: String,
    pub application_name: String,
    pub application_kind: String,
    pub project_id: String,
    pub piped_id: String,
    pub trigger: DeploymentTrigger,
    /// Strategy resolved by the planner; AUTO until then
    pub sync_strategy: SyncStrategy,
    #[serde(default)]
    pub summary: String,
    pub git_path: GitPath,
    #[serde(default)]
    pub deploy_targets_by_plugin: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub status_reason: String,
    #[serde(default)]
    pub versions: Vec<ArtifactVersion>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub rollback: Option<RollbackOutcome>,
    #[serde(default)]
    pub deployment_chain_id: Option<String>,
    #[serde(default)]
    pub block_index: u32,
    #[serde(default)]
    pub trace_commit_hash: String,
    /// Commit of the most recent successful deployment at trigger time
    #[serde(default)]
    pub running_commit_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Rejected state-machine transition
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("deployment {deployment_id}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub deployment_id: String,
    pub from: DeploymentStatus,
    pub to: DeploymentStatus,
}

impl Deployment {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, keeping `updated_at` non-decreasing
    pub fn transition(
        &mut self,
        next: DeploymentStatus,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                deployment_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.status_reason = reason.into();
        self.touch(now);
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Bump `updated_at` without going backwards
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = self.updated_at.max(now);
    }

    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    pub fn stage_mut(&mut self, stage_id: &str) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| s.id == stage_id)
    }

    /// Plugins this deployment involves, in name order
    pub fn plugin_names(&self) -> impl Iterator<Item = &str> {
        self.deploy_targets_by_plugin.keys().map(String::as_str)
    }

    pub fn deploy_targets(&self, plugin: &str) -> &[String] {
        self.deploy_targets_by_plugin
            .get(plugin)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_happy_path_transitions() {
        let mut d = fixtures::deployment("d1");
        let now = Utc::now();
        d.transition(DeploymentStatus::Planned, "planned", now).unwrap();
        d.transition(DeploymentStatus::Running, "running", now).unwrap();
        d.transition(DeploymentStatus::Success, "done", now).unwrap();
        assert!(d.is_terminal());
        assert_eq!(d.completed_at, Some(d.updated_at));
    }

    #[test]
    fn test_terminal_states_never_leave() {
        let mut d = fixtures::deployment("d1");
        d.transition(DeploymentStatus::Cancelled, "cancelled", Utc::now())
            .unwrap();
        let err = d
            .transition(DeploymentStatus::Running, "again", Utc::now())
            .unwrap_err();
        assert_eq!(err.from, DeploymentStatus::Cancelled);
        assert_eq!(err.to, DeploymentStatus::Running);
        assert_eq!(d.status, DeploymentStatus::Cancelled);
    }

    #[test]
    fn test_rollback_only_from_running() {
        assert!(DeploymentStatus::Running.can_transition_to(DeploymentStatus::RollingBack));
        assert!(!DeploymentStatus::Planned.can_transition_to(DeploymentStatus::RollingBack));
        assert!(!DeploymentStatus::RollingBack.can_transition_to(DeploymentStatus::Success));
        assert!(!DeploymentStatus::RollingBack.can_transition_to(DeploymentStatus::Running));
    }

    #[test]
    fn test_updated_at_never_goes_backwards() {
        let mut d = fixtures::deployment("d1");
        let before = d.updated_at;
        d.transition(
            DeploymentStatus::Planned,
            "planned",
            before - Duration::seconds(30),
        )
        .unwrap();
        assert_eq!(d.updated_at, before);
    }

    fn any_status() -> impl proptest::strategy::Strategy<Value = DeploymentStatus> {
        use proptest::prelude::*;
        prop_oneof![
            Just(DeploymentStatus::Pending),
            Just(DeploymentStatus::Planned),
            Just(DeploymentStatus::Running),
            Just(DeploymentStatus::RollingBack),
            Just(DeploymentStatus::Success),
            Just(DeploymentStatus::Failure),
            Just(DeploymentStatus::Cancelled),
        ]
    }

    proptest::proptest! {
        #[test]
        fn prop_transitions_follow_state_machine(
            steps in proptest::collection::vec((any_status(), -3600i64..3600), 0..32)
        ) {
            let mut d = fixtures::deployment("d-prop");
            for (next, skew) in steps {
                let before = (d.status, d.updated_at);
                let result = d.transition(next, "step", before.1 + Duration::seconds(skew));
                if before.0.can_transition_to(next) {
                    proptest::prop_assert!(result.is_ok());
                    proptest::prop_assert_eq!(d.status, next);
                } else {
                    proptest::prop_assert!(result.is_err());
                    proptest::prop_assert_eq!(d.status, before.0);
                }
                proptest::prop_assert!(d.updated_at >= before.1);
                if before.0.is_terminal() {
                    proptest::prop_assert_eq!(d.status, before.0);
                }
            }
        }
    }

    #[test]
    fn test_sync_strategy_wire_names() {
        assert_eq!(
            serde_json::to_string(&SyncStrategy::QuickSync).unwrap(),
            "\"QUICK_SYNC\""
        );
        assert_eq!(
            serde_json::to_string(&DeploymentStatus::RollingBack).unwrap(),
            "\"ROLLING_BACK\""
        );
    }
}
