//! Deployment DTOs for agent to control-plane reporting

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::deployment::{
    ArtifactVersion, Deployment, DeploymentStatus, RollbackOutcome, SyncStrategy,
};
use crate::domain::log::LogEntry;
use crate::domain::stage::{Stage, StageStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeployment {
    pub deployment: Deployment,
}

/// The plan a deployment will follow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentPlanned {
    pub deployment_id: String,
    pub summary: String,
    pub status_reason: String,
    pub sync_strategy: SyncStrategy,
    pub versions: Vec<ArtifactVersion>,
    pub stages: Vec<Stage>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentPlanned {
    pub fn from_deployment(d: &Deployment) -> Self {
        Self {
            deployment_id: d.id.clone(),
            summary: d.summary.clone(),
            status_reason: d.status_reason.clone(),
            sync_strategy: d.sync_strategy,
            versions: d.versions.clone(),
            stages: d.stages.clone(),
            updated_at: d.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatusChanged {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub status_reason: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatusChanged {
    pub deployment_id: String,
    pub stage_id: String,
    pub status: StageStatus,
    pub status_reason: String,
    pub retried_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl StageStatusChanged {
    pub fn from_stage(deployment_id: &str, stage: &Stage) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            stage_id: stage.id.clone(),
            status: stage.status,
            status_reason: stage.status_reason.clone(),
            retried_count: stage.retried_count,
            updated_at: stage.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentCompleted {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub status_reason: String,
    pub stage_statuses: BTreeMap<String, StageStatus>,
    pub rollback: Option<RollbackOutcome>,
    pub completed_at: DateTime<Utc>,
}

impl DeploymentCompleted {
    pub fn from_deployment(d: &Deployment) -> Self {
        Self {
            deployment_id: d.id.clone(),
            status: d.status,
            status_reason: d.status_reason.clone(),
            stage_statuses: d.stages.iter().map(|s| (s.id.clone(), s.status)).collect(),
            rollback: d.rollback,
            completed_at: d.completed_at.unwrap_or(d.updated_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMetadata {
    pub deployment_id: String,
    pub stage_id: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentMetadata {
    pub deployment_id: String,
    pub metadata: BTreeMap<String, String>,
}

/// A batch of stage log lines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageLogs {
    pub deployment_id: String,
    pub stage_id: String,
    pub retried_count: u32,
    pub entries: Vec<LogEntry>,
}

/// Deployments owned by a piped that have not reached a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListNotCompletedDeployments {
    pub piped_id: String,
}
