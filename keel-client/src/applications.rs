//! Application verbs

use keel_core::domain::application::{Application, DeploymentReference};
use keel_core::dto::application::{GetMostRecentDeployment, ListApplications, MostRecentDeployment};

use crate::ControlPlaneClient;
use crate::error::Result;

impl ControlPlaneClient {
    pub(crate) async fn do_list_applications(&self) -> Result<Vec<Application>> {
        let req = ListApplications {
            piped_id: self.piped_id().to_string(),
        };
        self.call("list-applications", &req).await
    }

    pub(crate) async fn do_report_most_recent_deployment(&self, req: MostRecentDeployment) -> Result<()> {
        self.send("report-application-most-recent-deployment", &req).await
    }

    /// `None` when the application has never been deployed
    pub(crate) async fn do_get_most_recent_deployment(
        &self,
        req: GetMostRecentDeployment,
    ) -> Result<Option<DeploymentReference>> {
        match self
            .call::<_, DeploymentReference>("get-application-most-recent-deployment", &req)
            .await
        {
            Ok(r) => Ok(Some(r)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
