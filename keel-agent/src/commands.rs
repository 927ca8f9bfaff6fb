//! Command intake
//!
//! Polls the control plane for commands addressed to this agent, dispatches
//! them and acknowledges each one as SUCCEEDED or FAILED.

use chrono::Utc;
use keel_client::{ControlPlane, Retry};
use keel_core::domain::command::{
    Command, CommandKind, CommandMetadata, CommandStatus, StageCommand,
};
use keel_core::dto::command::CommandHandled;
use keel_core::spec::NotificationEventType;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::callback::StageCommandStore;
use crate::controller::Controller;
use crate::error::{AgentError, Result};
use crate::executor::CancelRequest;
use crate::notifier::{NotificationEvent, Notifier};
use crate::store::DeploymentStore;
use crate::trigger::Trigger;

/// Metadata key carrying the deployment a SYNC command created
pub const METADATA_DEPLOYMENT_ID: &str = "DeploymentId";

pub struct CommandIntake {
    control_plane: Arc<dyn ControlPlane>,
    trigger: Arc<Trigger>,
    controller: Controller,
    stage_commands: Arc<StageCommandStore>,
    deployments: Arc<DeploymentStore>,
    notifier: Notifier,
    /// Commands already acknowledged; the control plane may list them again
    /// until the acknowledgement lands
    handled: Mutex<HashSet<String>>,
    retry: Retry,
    shutdown: CancellationToken,
}

impl CommandIntake {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        trigger: Arc<Trigger>,
        controller: Controller,
        stage_commands: Arc<StageCommandStore>,
        deployments: Arc<DeploymentStore>,
        notifier: Notifier,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            control_plane,
            trigger,
            controller,
            stage_commands,
            deployments,
            notifier,
            handled: Mutex::new(HashSet::new()),
            retry: Retry::control_plane(),
            shutdown,
        }
    }

    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    pub async fn run(self: Arc<Self>, interval: Duration) {
        info!("Starting command intake (interval: {:?})", interval);
        let mut ticker = time::interval(interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.poll_once().await {
                Ok(0) => {}
                Ok(n) => info!("Handled {} command(s)", n),
                Err(e) => error!("Failed to poll commands: {}", e),
            }
        }
        info!("Command intake stopped");
    }

    /// Fetch and handle every new command once; returns how many were handled
    pub async fn poll_once(&self) -> Result<usize> {
        let cp = &self.control_plane;
        let commands = self
            .retry
            .run(&self.shutdown, |_| cp.list_unhandled_commands())
            .await?;

        let mut handled = 0;
        for command in commands {
            if self.is_handled(&command.id) {
                continue;
            }
            let (status, metadata) = match self.dispatch(&command).await {
                Ok(metadata) => (CommandStatus::Succeeded, metadata),
                Err(e) => {
                    warn!(command_id = %command.id, kind = command.kind.name(), "Command failed: {}", e);
                    let metadata = CommandMetadata::from([("Error".to_string(), e.to_string())]);
                    (CommandStatus::Failed, metadata)
                }
            };
            self.acknowledge(&command, status, metadata).await;
            handled += 1;
        }
        Ok(handled)
    }

    fn is_handled(&self, command_id: &str) -> bool {
        self.handled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(command_id)
    }

    async fn dispatch(&self, command: &Command) -> Result<CommandMetadata> {
        debug!(command_id = %command.id, kind = command.kind.name(), commander = %command.commander, "Handling command");
        match &command.kind {
            CommandKind::Sync { application_id, strategy } => {
                let d = self
                    .trigger
                    .trigger_command(application_id, &command.commander, *strategy)
                    .await?;
                Ok(CommandMetadata::from([(METADATA_DEPLOYMENT_ID.to_string(), d.id)]))
            }
            CommandKind::ChainSync {
                application_id,
                chain_id,
                block_index,
            } => {
                let d = self
                    .trigger
                    .trigger_chain(application_id, chain_id, *block_index)
                    .await?;
                Ok(CommandMetadata::from([(METADATA_DEPLOYMENT_ID.to_string(), d.id)]))
            }
            CommandKind::CancelDeployment {
                deployment_id,
                force_rollback,
                force_no_rollback,
            } => {
                let request = CancelRequest {
                    commander: command.commander.clone(),
                    force_rollback: *force_rollback,
                    force_no_rollback: *force_no_rollback,
                };
                self.controller.cancel(deployment_id, request).await?;
                Ok(CommandMetadata::new())
            }
            CommandKind::ApproveStage {
                deployment_id,
                stage_id,
            } => {
                let deployment = self.deployments.get(deployment_id).await.map_err(|e| {
                    if e.is_not_found() {
                        AgentError::NotFound(format!("deployment {}", deployment_id))
                    } else {
                        e.into()
                    }
                })?;
                if deployment.stage(stage_id).is_none() {
                    return Err(AgentError::NotFound(format!(
                        "stage {} of deployment {}",
                        stage_id, deployment_id
                    )));
                }
                self.stage_commands.add(StageCommand {
                    command_id: command.id.clone(),
                    deployment_id: deployment_id.clone(),
                    stage_id: stage_id.clone(),
                    commander: command.commander.clone(),
                    created_at: command.created_at,
                });
                self.notifier.notify(
                    NotificationEvent::new(NotificationEventType::DeploymentApproved, &deployment)
                        .with_commander(&command.commander),
                );
                Ok(CommandMetadata::new())
            }
        }
    }

    async fn acknowledge(&self, command: &Command, status: CommandStatus, metadata: CommandMetadata) {
        let cp = &self.control_plane;
        let req = CommandHandled {
            command_id: command.id.clone(),
            status,
            metadata,
            handled_at: Utc::now(),
        };
        self.handled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(command.id.clone());
        if let Err(e) = self
            .retry
            .run(&self.shutdown, |_| cp.report_command_handled(req.clone()))
            .await
        {
            warn!(command_id = %command.id, "Failed to acknowledge command: {}", e);
        }
    }
}
