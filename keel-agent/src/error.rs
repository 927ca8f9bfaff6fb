//! Agent error type

use keel_client::{ClientError, RetryError};
use keel_core::Code;
use keel_core::plugin::PluginStatus;
use keel_core::spec::SpecError;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("spec error: {0}")]
    Spec(#[from] SpecError),

    #[error("control plane error: {0}")]
    ControlPlane(#[from] ClientError),

    #[error("plugin {plugin}: {status}")]
    Plugin { plugin: String, status: PluginStatus },

    #[error("git error: {0}")]
    Git(String),

    #[error("datastore error: {0}")]
    Store(#[from] StoreError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    pub fn plugin(plugin: impl Into<String>, status: PluginStatus) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            status,
        }
    }

    pub fn code(&self) -> Code {
        match self {
            Self::Spec(e) => e.code(),
            Self::ControlPlane(e) => e.code(),
            Self::Plugin { status, .. } => status.code,
            Self::Git(_) => Code::Unavailable,
            Self::Store(e) => e.code(),
            Self::NotFound(_) => Code::NotFound,
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::FailedPrecondition(_) => Code::FailedPrecondition,
            Self::Cancelled(_) => Code::Cancelled,
            Self::Internal(_) => Code::Internal,
        }
    }
}

impl From<RetryError<ClientError>> for AgentError {
    fn from(err: RetryError<ClientError>) -> Self {
        match err {
            RetryError::Cancelled { .. } => Self::Cancelled("control plane call abandoned".into()),
            other => match other.into_inner() {
                Some(e) => Self::ControlPlane(e),
                None => Self::Internal("retry finished without an error".into()),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
