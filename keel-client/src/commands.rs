//! Command verbs and the `ControlPlane` impl

use async_trait::async_trait;
use keel_core::domain::application::{Application, DeploymentReference};
use keel_core::domain::command::Command;
use keel_core::domain::deployment::Deployment;
use keel_core::dto::application::{GetMostRecentDeployment, MostRecentDeployment};
use keel_core::dto::command::{CommandHandled, ListUnhandledCommands};
use keel_core::dto::deployment::{
    DeploymentCompleted, DeploymentMetadata, DeploymentPlanned, DeploymentStatusChanged,
    StageLogs, StageMetadata, StageStatusChanged,
};

use crate::error::Result;
use crate::{ControlPlane, ControlPlaneClient};

impl ControlPlaneClient {
    pub(crate) async fn do_list_unhandled_commands(&self) -> Result<Vec<Command>> {
        let req = ListUnhandledCommands {
            piped_id: self.piped_id().to_string(),
        };
        self.call("list-unhandled-commands", &req).await
    }

    pub(crate) async fn do_report_command_handled(&self, req: CommandHandled) -> Result<()> {
        self.send("report-command-handled", &req).await
    }
}

#[async_trait]
impl ControlPlane for ControlPlaneClient {
    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.do_create_deployment(deployment).await
    }

    async fn report_deployment_planned(&self, req: DeploymentPlanned) -> Result<()> {
        self.do_report_deployment_planned(req).await
    }

    async fn report_deployment_status_changed(&self, req: DeploymentStatusChanged) -> Result<()> {
        self.do_report_deployment_status_changed(req).await
    }

    async fn report_stage_status_changed(&self, req: StageStatusChanged) -> Result<()> {
        self.do_report_stage_status_changed(req).await
    }

    async fn report_deployment_completed(&self, req: DeploymentCompleted) -> Result<()> {
        self.do_report_deployment_completed(req).await
    }

    async fn report_application_most_recent_deployment(
        &self,
        req: MostRecentDeployment,
    ) -> Result<()> {
        self.do_report_most_recent_deployment(req).await
    }

    async fn get_application_most_recent_deployment(
        &self,
        req: GetMostRecentDeployment,
    ) -> Result<Option<DeploymentReference>> {
        self.do_get_most_recent_deployment(req).await
    }

    async fn list_applications(&self) -> Result<Vec<Application>> {
        self.do_list_applications().await
    }

    async fn save_stage_metadata(&self, req: StageMetadata) -> Result<()> {
        self.do_save_stage_metadata(req).await
    }

    async fn save_deployment_metadata(&self, req: DeploymentMetadata) -> Result<()> {
        self.do_save_deployment_metadata(req).await
    }

    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>> {
        self.do_list_not_completed_deployments().await
    }

    async fn list_unhandled_commands(&self) -> Result<Vec<Command>> {
        self.do_list_unhandled_commands().await
    }

    async fn report_command_handled(&self, req: CommandHandled) -> Result<()> {
        self.do_report_command_handled(req).await
    }

    async fn report_stage_logs(&self, req: StageLogs) -> Result<()> {
        self.do_report_stage_logs(req).await
    }
}
