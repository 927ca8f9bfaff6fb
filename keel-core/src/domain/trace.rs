//! Deployment trace domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Links a deployment back to the commit that was traced through it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTrace {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub commit_message: String,
    pub commit_hash: String,
    pub commit_url: String,
    pub author: String,
    /// Seconds since the epoch
    pub commit_timestamp: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentTrace {
    /// Check the fields every stored trace must carry.
    /// Returns the name of the first missing field.
    pub fn validate(&self) -> Result<(), &'static str> {
        let required = [
            ("id", &self.id),
            ("project_id", &self.project_id),
            ("title", &self.title),
            ("commit_hash", &self.commit_hash),
            ("author", &self.author),
        ];
        for (name, value) in required {
            if value.is_empty() {
                return Err(name);
            }
        }
        if self.commit_timestamp <= 0 {
            return Err("commit_timestamp");
        }
        if self.updated_at < self.created_at {
            return Err("updated_at");
        }
        Ok(())
    }
}
