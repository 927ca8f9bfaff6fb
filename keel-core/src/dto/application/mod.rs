//! Application DTOs

use serde::{Deserialize, Serialize};

use crate::domain::application::DeploymentReference;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListApplications {
    pub piped_id: String,
}

/// Which most-recent deployment to record or look up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MostRecentKind {
    Any,
    Successful,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MostRecentDeployment {
    pub application_id: String,
    pub kind: MostRecentKind,
    pub deployment: DeploymentReference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetMostRecentDeployment {
    pub application_id: String,
    pub kind: MostRecentKind,
}
