//! Deployment reporting verbs

use keel_core::domain::deployment::Deployment;
use keel_core::dto::deployment::{
    CreateDeployment, DeploymentCompleted, DeploymentMetadata, DeploymentPlanned,
    DeploymentStatusChanged, ListNotCompletedDeployments, StageLogs, StageMetadata,
    StageStatusChanged,
};

use crate::ControlPlaneClient;
use crate::error::Result;

impl ControlPlaneClient {
    // =============================================================================
    // Deployment Lifecycle
    // =============================================================================

    pub(crate) async fn do_create_deployment(&self, deployment: &Deployment) -> Result<()> {
        let req = CreateDeployment {
            deployment: deployment.clone(),
        };
        self.send("create-deployment", &req).await
    }

    pub(crate) async fn do_report_deployment_planned(&self, req: DeploymentPlanned) -> Result<()> {
        self.send("report-deployment-planned", &req).await
    }

    pub(crate) async fn do_report_deployment_status_changed(
        &self,
        req: DeploymentStatusChanged,
    ) -> Result<()> {
        self.send("report-deployment-status-changed", &req).await
    }

    pub(crate) async fn do_report_stage_status_changed(&self, req: StageStatusChanged) -> Result<()> {
        self.send("report-deployment-stage-status-changed", &req).await
    }

    pub(crate) async fn do_report_deployment_completed(&self, req: DeploymentCompleted) -> Result<()> {
        self.send("report-deployment-completed", &req).await
    }

    pub(crate) async fn do_list_not_completed_deployments(&self) -> Result<Vec<Deployment>> {
        let req = ListNotCompletedDeployments {
            piped_id: self.piped_id().to_string(),
        };
        self.call("list-not-completed-deployments", &req).await
    }

    // =============================================================================
    // Metadata and Logs
    // =============================================================================

    pub(crate) async fn do_save_stage_metadata(&self, req: StageMetadata) -> Result<()> {
        self.send("save-stage-metadata", &req).await
    }

    pub(crate) async fn do_save_deployment_metadata(&self, req: DeploymentMetadata) -> Result<()> {
        self.send("save-deployment-metadata", &req).await
    }

    pub(crate) async fn do_report_stage_logs(&self, req: StageLogs) -> Result<()> {
        if req.entries.is_empty() {
            return Ok(());
        }
        self.send("report-stage-logs", &req).await
    }
}
