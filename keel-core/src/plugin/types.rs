//! Request and response bundles exchanged with plugins

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::PluginStatus;
use crate::domain::RawBytes;
use crate::domain::deployment::{ArtifactVersion, SyncStrategy};
use crate::domain::log::{LogEntry, LogLevel};
use crate::domain::stage::StageStatus;

/// The application context every plugin call receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationInput {
    pub application_id: String,
    pub application_name: String,
    /// Verbatim spec file contents
    pub spec_yaml: RawBytes,
    pub spec_filename: String,
    pub commit_hash: String,
    /// Application directory, relative to the repository root
    pub app_dir: String,
    /// Absolute path of the checked-out repository on this host
    #[serde(default)]
    pub repo_dir: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchDefinedStagesResponse {
    pub stages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetermineVersionsRequest {
    pub deployment_id: String,
    pub input: ApplicationInput,
    pub deploy_targets: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetermineVersionsResponse {
    pub versions: Vec<ArtifactVersion>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetermineStrategyRequest {
    pub deployment_id: String,
    pub input: ApplicationInput,
    pub deploy_targets: Vec<String>,
    /// Commit of the currently running deployment, empty on first deploy
    #[serde(default)]
    pub running_commit_hash: String,
}

/// A plugin's opinion on the sync strategy; `None` means undecided
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetermineStrategyResponse {
    pub strategy: Option<SyncStrategy>,
    #[serde(default)]
    pub summary: String,
}

/// A pipeline stage handed to its owning plugin for planning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestedStage {
    pub index: u32,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    pub config: RawBytes,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildPipelineSyncStagesRequest {
    pub deployment_id: String,
    pub input: ApplicationInput,
    pub deploy_targets: Vec<String>,
    /// Only the stages this plugin owns, with their pipeline indices
    pub stages: Vec<RequestedStage>,
    /// Whether rollback stages should be included
    pub rollback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildQuickSyncStagesRequest {
    pub deployment_id: String,
    pub input: ApplicationInput,
    pub deploy_targets: Vec<String>,
    pub rollback: bool,
}

/// A stage as planned by a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStage {
    pub index: u32,
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub rollback: bool,
    #[serde(default)]
    pub config: RawBytes,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildStagesResponse {
    pub stages: Vec<PlannedStage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteStageRequest {
    /// Unique per call; used to address cancellation
    pub execution_id: String,
    pub deployment_id: String,
    pub stage_id: String,
    pub stage_name: String,
    pub stage_index: u32,
    pub rollback: bool,
    pub config: RawBytes,
    pub input: ApplicationInput,
    pub deploy_targets: Vec<String>,
    /// Remaining budget for the stage
    pub timeout_secs: u64,
    #[serde(default)]
    pub running_commit_hash: String,
}

/// Something a plugin reports while a stage is executing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageEvent {
    Log(LogEntry),
    Metadata { key: String, value: String },
}

/// Final status a plugin reports for a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub status: StageStatus,
    #[serde(default)]
    pub reason: String,
}

impl StageOutcome {
    pub fn new(status: StageStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn success() -> Self {
        Self::new(StageStatus::Success, "")
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self::new(StageStatus::Failure, reason)
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(StageStatus::Cancelled, reason)
    }
}

/// One line of a streamed `ExecuteStage` reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum ExecuteStageFrame {
    Event { event: StageEvent },
    Completed { outcome: StageOutcome },
    Error { status: PluginStatus },
}

/// Channel a plugin uses to stream stage events back to the agent
#[derive(Debug, Clone)]
pub struct StageEventSender {
    tx: mpsc::Sender<StageEvent>,
}

impl StageEventSender {
    pub fn new(tx: mpsc::Sender<StageEvent>) -> Self {
        Self { tx }
    }

    /// A bounded channel pair
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StageEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Events are dropped once the receiving side has gone away
    pub async fn send(&self, event: StageEvent) {
        let _ = self.tx.send(event).await;
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.send(StageEvent::Log(LogEntry::new(level, message))).await;
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message).await;
    }

    pub async fn success(&self, message: impl Into<String>) {
        self.log(LogLevel::Success, message).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message).await;
    }

    pub async fn metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.send(StageEvent::Metadata {
            key: key.into(),
            value: value.into(),
        })
        .await;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetLivestateRequest {
    pub piped_id: String,
    pub application_id: String,
    pub deploy_targets: Vec<String>,
    /// The deploy source: spec and manifests at the running commit
    pub input: ApplicationInput,
    /// `apiVersion:kind:namespace:name#fieldPath` entries to leave out of the diff
    #[serde(default)]
    pub ignore_fields: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Synced,
    OutOfSync,
    Invalid,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub id: String,
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub deploy_target: String,
    #[serde(default)]
    pub healthy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetLivestateResponse {
    pub sync_state: SyncState,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub resources: Vec<ResourceState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_frames_are_tagged() {
        let frame = ExecuteStageFrame::Completed {
            outcome: StageOutcome::failure("ImagePullBackOff"),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["frame"], "completed");
        assert_eq!(json["outcome"]["status"], "FAILURE");

        let event = ExecuteStageFrame::Event {
            event: StageEvent::Metadata {
                key: "Approvers".into(),
                value: "alice".into(),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: ExecuteStageFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn test_event_sender_survives_closed_receiver() {
        let (sender, rx) = StageEventSender::channel(1);
        drop(rx);
        sender.info("nobody listens").await;
    }
}
