//! Application spec model
//!
//! The declarative rules an application carries in its Git repository:
//! planner switches, commit matchers, the pipeline, trigger rules,
//! notifications, drift detection and chain configuration.

pub mod application;
pub mod duration;
pub mod loader;
pub mod notification;
pub mod stage;

pub use application::{
    ApplicationSpec, Attachment, ChainApplicationMatcher, CommitMatcher, DeploymentChainSpec,
    DeploymentPipeline, DeploymentPlanner, DriftDetection, OnChain, OnCommand, OnCommit,
    OnOutOfSync, PostSync, SecretEncryption, Trigger,
};
pub use loader::{LoadedSpec, load_application_spec, parse_application_spec};
pub use notification::{DeploymentNotification, NotificationEventType, NotificationMention};
pub use stage::{PipelineStage, SkipOptions, WAIT_APPROVAL, WaitApprovalStageOptions};

use thiserror::Error;

use crate::Code;

/// Errors raised while loading or validating an application spec
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("application config file {0} was not found in Git")]
    NotFound(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse application spec: {0}")]
    Parse(String),

    #[error("invalid application kind in the application config file, got: {0}")]
    InvalidKind(String),

    #[error("invalid application spec: {0}")]
    Invalid(String),
}

impl SpecError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn code(&self) -> Code {
        match self {
            Self::NotFound(_) => Code::NotFound,
            Self::Io { .. } => Code::Internal,
            Self::Parse(_) | Self::InvalidKind(_) | Self::Invalid(_) => Code::InvalidArgument,
        }
    }
}
