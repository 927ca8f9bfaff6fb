//! Error taxonomy shared by the control-plane client, the plugin contract
//! and the agent.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a failed operation
///
/// Every error surfaced across a process boundary carries one of these codes.
/// Callers decide whether to retry from the code alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    /// Bad spec, bad enum, missing required field. Never retried.
    InvalidArgument,
    /// Unknown application, deployment or stage.
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    /// Plugin restarting or control plane temporarily unreachable.
    Unavailable,
    DeadlineExceeded,
    Cancelled,
    /// The peer went away in the middle of a call.
    Aborted,
    Unimplemented,
    Internal,
}

impl Code {
    /// Whether an operation failing with this code may succeed when retried
    pub fn is_retryable(self) -> bool {
        matches!(self, Code::Unavailable | Code::DeadlineExceeded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Unavailable => "UNAVAILABLE",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::Cancelled => "CANCELLED",
            Code::Aborted => "ABORTED",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
