//! SDK error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("missing environment variable {0}; plugins must be launched by the agent")]
    MissingEnv(&'static str),

    #[error("failed to bind plugin listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("plugin server failed: {0}")]
    Serve(#[source] std::io::Error),
}
