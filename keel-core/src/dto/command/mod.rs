//! Command DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::command::{CommandMetadata, CommandStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListUnhandledCommands {
    pub piped_id: String,
}

/// Acknowledgement of a command the agent has processed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandHandled {
    pub command_id: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub metadata: CommandMetadata,
    pub handled_at: DateTime<Utc>,
}
