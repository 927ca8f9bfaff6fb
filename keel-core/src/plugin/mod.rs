//! Plugin contract
//!
//! A plugin is an out-of-process program that owns a set of stage names and
//! implements two services:
//! - Deployment: stage discovery, version and strategy detection, stage
//!   planning and stage execution
//! - Livestate: reporting whether deployed resources match Git
//!
//! Every reply is a tagged union of a value or a [`PluginStatus`]; plugin
//! failures never travel as panics or untyped strings.

pub mod types;
pub mod wire;

pub use types::*;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::Code;
use crate::domain::command::StageCommand;

/// Error status returned by a plugin call
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct PluginStatus {
    pub code: Code,
    pub message: String,
}

impl PluginStatus {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

pub type PluginResult<T> = Result<T, PluginStatus>;

/// Wire form of a unary plugin reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RpcReply<T> {
    Ok { value: T },
    Error { status: PluginStatus },
}

impl<T> RpcReply<T> {
    pub fn into_result(self) -> PluginResult<T> {
        match self {
            Self::Ok { value } => Ok(value),
            Self::Error { status } => Err(status),
        }
    }
}

impl<T> From<PluginResult<T>> for RpcReply<T> {
    fn from(result: PluginResult<T>) -> Self {
        match result {
            Ok(value) => Self::Ok { value },
            Err(status) => Self::Error { status },
        }
    }
}

/// Deployment service every plugin provides
#[async_trait]
pub trait DeploymentService: Send + Sync {
    /// Stage names this plugin owns
    async fn fetch_defined_stages(&self) -> PluginResult<FetchDefinedStagesResponse>;

    async fn determine_versions(
        &self,
        req: DetermineVersionsRequest,
    ) -> PluginResult<DetermineVersionsResponse>;

    async fn determine_strategy(
        &self,
        req: DetermineStrategyRequest,
    ) -> PluginResult<DetermineStrategyResponse>;

    async fn build_pipeline_sync_stages(
        &self,
        req: BuildPipelineSyncStagesRequest,
    ) -> PluginResult<BuildStagesResponse>;

    async fn build_quick_sync_stages(
        &self,
        req: BuildQuickSyncStagesRequest,
    ) -> PluginResult<BuildStagesResponse>;

    /// Run one stage to completion
    ///
    /// Implementations stream logs and metadata through `events` and must
    /// return promptly once `cancel` fires, typically with a CANCELLED outcome.
    async fn execute_stage(
        &self,
        req: ExecuteStageRequest,
        events: StageEventSender,
        cancel: CancellationToken,
    ) -> PluginResult<StageOutcome>;
}

/// Livestate service; optional for plugins without drift support
#[async_trait]
pub trait LivestateService: Send + Sync {
    async fn get_livestate(&self, _req: GetLivestateRequest) -> PluginResult<GetLivestateResponse> {
        Err(PluginStatus::new(
            Code::Unimplemented,
            "livestate is not supported by this plugin",
        ))
    }
}

/// A complete plugin
pub trait Plugin: DeploymentService + LivestateService {}

impl<T: DeploymentService + LivestateService> Plugin for T {}

/// Where plugins read stage commands (approvals) from
#[async_trait]
pub trait StageCommandSource: Send + Sync {
    async fn list_stage_commands(
        &self,
        deployment_id: &str,
        stage_id: &str,
    ) -> PluginResult<Vec<StageCommand>>;
}
