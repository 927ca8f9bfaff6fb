//! Command domain types
//!
//! Commands are issued by users through the control plane and polled by the
//! agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::deployment::SyncStrategy;

/// A command addressed to this agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub project_id: String,
    pub piped_id: String,
    pub commander: String,
    pub kind: CommandKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    Sync {
        application_id: String,
        #[serde(default)]
        strategy: SyncStrategy,
    },
    ChainSync {
        application_id: String,
        chain_id: String,
        block_index: u32,
    },
    CancelDeployment {
        deployment_id: String,
        #[serde(default)]
        force_rollback: bool,
        #[serde(default)]
        force_no_rollback: bool,
    },
    ApproveStage {
        deployment_id: String,
        stage_id: String,
    },
}

impl CommandKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sync { .. } => "SYNC",
            Self::ChainSync { .. } => "CHAIN_SYNC",
            Self::CancelDeployment { .. } => "CANCEL_DEPLOYMENT",
            Self::ApproveStage { .. } => "APPROVE_STAGE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Succeeded,
    Failed,
}

/// An approval held for plugins to poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCommand {
    pub command_id: String,
    pub deployment_id: String,
    pub stage_id: String,
    pub commander: String,
    pub created_at: DateTime<Utc>,
}

/// Extra details attached when acknowledging a command
pub type CommandMetadata = BTreeMap<String, String>;
