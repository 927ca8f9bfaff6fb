//! Persists deployment snapshots and reports them to the control plane
//!
//! Every transition is written to the local deployment store first, then
//! reported. Status and stage reports retry until the agent shuts down so a
//! cancelled deployment still reports CANCELLED; log and metadata reports
//! retry only while their deployment is alive.

use keel_client::{ControlPlane, Retry};
use keel_core::domain::application::DeploymentReference;
use keel_core::domain::deployment::{Deployment, DeploymentStatus};
use keel_core::domain::log::LogEntry;
use keel_core::dto::application::{MostRecentDeployment, MostRecentKind};
use keel_core::dto::deployment::{
    DeploymentCompleted, DeploymentMetadata, DeploymentPlanned, DeploymentStatusChanged,
    StageLogs, StageMetadata, StageStatusChanged,
};
use keel_core::spec::NotificationEventType;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::notifier::{NotificationEvent, Notifier};
use crate::store::DeploymentStore;

#[derive(Clone)]
pub struct Reporter {
    control_plane: Arc<dyn ControlPlane>,
    store: Arc<DeploymentStore>,
    notifier: Notifier,
    retry: Retry,
    shutdown: CancellationToken,
}

impl Reporter {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        store: Arc<DeploymentStore>,
        notifier: Notifier,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            control_plane,
            store,
            notifier,
            retry: Retry::control_plane(),
            shutdown,
        }
    }

    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<DeploymentStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    async fn call<F, Fut>(&self, what: &'static str, deployment_id: &str, cancel: &CancellationToken, op: F)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = keel_client::Result<()>>,
    {
        match self.retry.run(cancel, op).await {
            Ok(()) => debug!(deployment_id, "Reported {}", what),
            Err(e) if e.is_cancelled() => {
                warn!(deployment_id, "Dropped {} report: deployment context cancelled", what)
            }
            Err(e) => warn!(deployment_id, "Failed to report {}: {}", what, e),
        }
    }

    async fn persist(&self, deployment: &Deployment) {
        if let Err(e) = self.store.put(deployment).await {
            warn!(deployment_id = %deployment.id, "Failed to persist deployment snapshot: {}", e);
        }
    }

    /// A freshly created deployment becomes the application's most recent one
    pub async fn created(&self, deployment: &Deployment) {
        self.most_recent(deployment, MostRecentKind::Any).await;
        self.notifier.notify(NotificationEvent::new(
            NotificationEventType::DeploymentTriggered,
            deployment,
        ));
    }

    pub async fn planned(&self, deployment: &Deployment) {
        self.persist(deployment).await;
        let cp = &self.control_plane;
        self.call("deployment planned", &deployment.id, &self.shutdown, |_| {
            cp.report_deployment_planned(DeploymentPlanned::from_deployment(deployment))
        })
        .await;
        self.report_status(deployment).await;
        self.notifier.notify(NotificationEvent::new(
            NotificationEventType::DeploymentPlanned,
            deployment,
        ));
    }

    /// Report a status transition, plus completion for terminal ones
    pub async fn status_changed(&self, deployment: &Deployment) {
        self.persist(deployment).await;
        self.report_status(deployment).await;

        let event = match deployment.status {
            DeploymentStatus::RollingBack => Some(NotificationEventType::DeploymentRollingBack),
            DeploymentStatus::Success => Some(NotificationEventType::DeploymentSucceeded),
            DeploymentStatus::Failure => Some(NotificationEventType::DeploymentFailed),
            DeploymentStatus::Cancelled => Some(NotificationEventType::DeploymentCancelled),
            _ => None,
        };

        if deployment.is_terminal() {
            let cp = &self.control_plane;
            self.call("deployment completed", &deployment.id, &self.shutdown, |_| {
                cp.report_deployment_completed(DeploymentCompleted::from_deployment(deployment))
            })
            .await;
            self.most_recent(deployment, MostRecentKind::Any).await;
            if deployment.status == DeploymentStatus::Success {
                self.most_recent(deployment, MostRecentKind::Successful).await;
            }
        }

        if let Some(kind) = event {
            self.notifier.notify(NotificationEvent::new(kind, deployment));
        }
    }

    async fn report_status(&self, deployment: &Deployment) {
        let req = DeploymentStatusChanged {
            deployment_id: deployment.id.clone(),
            status: deployment.status,
            status_reason: deployment.status_reason.clone(),
            updated_at: deployment.updated_at,
        };
        let cp = &self.control_plane;
        self.call("deployment status", &deployment.id, &self.shutdown, |_| {
            cp.report_deployment_status_changed(req.clone())
        })
        .await;
    }

    async fn most_recent(&self, deployment: &Deployment, kind: MostRecentKind) {
        let req = MostRecentDeployment {
            application_id: deployment.application_id.clone(),
            kind,
            deployment: DeploymentReference {
                deployment_id: deployment.id.clone(),
                status: deployment.status,
                summary: deployment.summary.clone(),
                commit_hash: deployment.trigger.commit.hash.clone(),
                completed_at: deployment.completed_at,
            },
        };
        let cp = &self.control_plane;
        self.call("most recent deployment", &deployment.id, &self.shutdown, |_| {
            cp.report_application_most_recent_deployment(req.clone())
        })
        .await;
    }

    pub async fn stage_changed(&self, deployment: &Deployment, stage_id: &str) {
        self.persist(deployment).await;
        let Some(stage) = deployment.stage(stage_id) else {
            warn!(deployment_id = %deployment.id, stage_id, "Reporting an unknown stage");
            return;
        };
        let req = StageStatusChanged::from_stage(&deployment.id, stage);
        let cp = &self.control_plane;
        self.call("stage status", &deployment.id, &self.shutdown, |_| {
            cp.report_stage_status_changed(req.clone())
        })
        .await;
    }

    pub async fn stage_metadata(
        &self,
        deployment: &Deployment,
        stage_id: &str,
        cancel: &CancellationToken,
    ) {
        self.persist(deployment).await;
        let Some(stage) = deployment.stage(stage_id) else {
            return;
        };
        let req = StageMetadata {
            deployment_id: deployment.id.clone(),
            stage_id: stage_id.to_string(),
            metadata: stage.metadata.clone(),
        };
        let cp = &self.control_plane;
        self.call("stage metadata", &deployment.id, cancel, |_| {
            cp.save_stage_metadata(req.clone())
        })
        .await;
    }

    pub async fn deployment_metadata(&self, deployment: &Deployment, cancel: &CancellationToken) {
        self.persist(deployment).await;
        let req = DeploymentMetadata {
            deployment_id: deployment.id.clone(),
            metadata: deployment.metadata.clone(),
        };
        let cp = &self.control_plane;
        self.call("deployment metadata", &deployment.id, cancel, |_| {
            cp.save_deployment_metadata(req.clone())
        })
        .await;
    }

    pub async fn stage_logs(
        &self,
        deployment_id: &str,
        stage_id: &str,
        retried_count: u32,
        entries: Vec<LogEntry>,
        cancel: &CancellationToken,
    ) {
        if entries.is_empty() {
            return;
        }
        let req = StageLogs {
            deployment_id: deployment_id.to_string(),
            stage_id: stage_id.to_string(),
            retried_count,
            entries,
        };
        let cp = &self.control_plane;
        self.call("stage logs", deployment_id, cancel, |_| cp.report_stage_logs(req.clone()))
            .await;
    }
}
