//! Stage executor
//!
//! One worker per deployment walks its stages in index order. Each stage is
//! a streaming `ExecuteStage` call to the owning plugin. A failed stage rolls
//! back through its plugin's rollback stage when auto-rollback is on; a
//! cancel stops the active stage and ends the deployment CANCELLED.

pub mod control;
pub mod log_persister;
pub mod selection;
mod stage;

pub use control::{CancelRequest, ControlHandle, ControlSignals, control_channel};
pub use log_persister::LogPersister;

use chrono::Utc;
use keel_client::Retry;
use keel_core::domain::deployment::{
    Deployment, DeploymentStatus, METADATA_ROLLBACK_INTERRUPTED, RollbackOutcome,
};
use keel_core::domain::stage::StageStatus;
use std::sync::Arc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::plugin::PluginRegistry;
use crate::reporter::Reporter;
use crate::spec_source::ResolvedSpec;

use stage::StageEnd;

pub const RUNNING_REASON: &str = "The deployment is running";
pub const SUCCESS_REASON: &str = "The deployment completed successfully";
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(30);

/// Shared by every deployment worker
#[derive(Clone)]
pub struct Executor {
    registry: Arc<PluginRegistry>,
    reporter: Reporter,
    log_send_interval: Duration,
    cancel_grace: Duration,
    stage_retry: Retry,
    shutdown: CancellationToken,
}

impl Executor {
    pub fn new(registry: Arc<PluginRegistry>, reporter: Reporter, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            reporter,
            log_send_interval: Duration::from_secs(5),
            cancel_grace: DEFAULT_CANCEL_GRACE,
            stage_retry: Retry::plugin_stage(),
            shutdown,
        }
    }

    pub fn with_log_send_interval(mut self, interval: Duration) -> Self {
        self.log_send_interval = interval;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_stage_retry(mut self, retry: Retry) -> Self {
        self.stage_retry = retry;
        self
    }

    /// Drive a planned deployment to a terminal status
    ///
    /// Returns the last snapshot. On agent shutdown the deployment is left
    /// non-terminal so the next start can recover it.
    pub async fn run(
        &self,
        deployment: Deployment,
        resolved: ResolvedSpec,
        changed_files: Vec<String>,
        signals: ControlSignals,
    ) -> Deployment {
        let logs = LogPersister::new(&deployment.id, self.reporter.clone(), signals.token().clone());
        let stop_sender = CancellationToken::new();
        let sender = logs.spawn_sender(self.log_send_interval, stop_sender.clone());
        let deadline = Instant::now() + resolved.spec.timeout;

        let mut run = DeploymentRun {
            executor: self,
            deployment,
            resolved,
            changed_files,
            signals,
            logs: Arc::clone(&logs),
            deadline,
        };
        run.execute().await;

        stop_sender.cancel();
        if let Err(e) = sender.await {
            warn!(deployment_id = %run.deployment.id, "Log sender stopped abnormally: {}", e);
            logs.flush().await;
        }
        run.deployment
    }
}

struct DeploymentRun<'a> {
    executor: &'a Executor,
    deployment: Deployment,
    resolved: ResolvedSpec,
    changed_files: Vec<String>,
    signals: ControlSignals,
    logs: Arc<LogPersister>,
    deadline: Instant,
}

impl DeploymentRun<'_> {
    async fn execute(&mut self) {
        if self.deployment.status == DeploymentStatus::Planned {
            if self.signals.token().is_cancelled() {
                self.on_cancel(None).await;
                return;
            }
            if !self.transition(DeploymentStatus::Running, RUNNING_REASON).await {
                return;
            }
        }
        if self.deployment.status != DeploymentStatus::Running {
            warn!(deployment_id = %self.deployment.id, status = %self.deployment.status, "Deployment is not runnable");
            return;
        }
        info!(deployment_id = %self.deployment.id, "Executing deployment");

        loop {
            if self.executor.shutdown.is_cancelled() {
                return;
            }
            if self.signals.token().is_cancelled() {
                self.on_cancel(None).await;
                return;
            }
            let Some(idx) = selection::next_stage(&self.deployment) else {
                self.transition(DeploymentStatus::Success, SUCCESS_REASON).await;
                return;
            };

            if self.should_skip(idx) {
                let now = Utc::now();
                let stage = &mut self.deployment.stages[idx];
                stage.set_status(StageStatus::Skipped, "Skipped by the skipOn options", now);
                let stage_id = stage.id.clone();
                self.deployment.touch(now);
                self.executor.reporter.stage_changed(&self.deployment, &stage_id).await;
                continue;
            }

            let cancel = self.signals.token().clone();
            match self.run_stage(idx, cancel).await {
                StageEnd::Shutdown => return,
                StageEnd::Finished(StageStatus::Success | StageStatus::Skipped) => continue,
                StageEnd::Finished(StageStatus::Exited) => {
                    let name = self.deployment.stages[idx].name.clone();
                    let skipped = selection::skip_remaining(
                        &mut self.deployment,
                        &format!("Skipped because stage {} exited the pipeline", name),
                        Utc::now(),
                    );
                    for stage_id in skipped {
                        self.executor.reporter.stage_changed(&self.deployment, &stage_id).await;
                    }
                    self.transition(
                        DeploymentStatus::Success,
                        format!("The deployment exited early at stage {}", name),
                    )
                    .await;
                    return;
                }
                StageEnd::Finished(StageStatus::Cancelled) => {
                    self.on_cancel(Some(idx)).await;
                    return;
                }
                StageEnd::Finished(_) => {
                    self.on_failure(idx).await;
                    return;
                }
            }
        }
    }

    fn should_skip(&self, idx: usize) -> bool {
        let stage = &self.deployment.stages[idx];
        if stage.skip_on.is_empty() {
            return false;
        }
        let message = &self.deployment.trigger.commit.message;
        match stage.skip_on.should_skip(message, &self.changed_files) {
            Ok(skip) => skip,
            Err(e) => {
                warn!(deployment_id = %self.deployment.id, stage_id = %stage.id, "Invalid skipOn options: {}", e);
                false
            }
        }
    }

    /// Apply and report a status change; false when the state machine refuses
    async fn transition(&mut self, next: DeploymentStatus, reason: impl Into<String>) -> bool {
        if let Err(e) = self.deployment.transition(next, reason, Utc::now()) {
            error!("{}", e);
            return false;
        }
        if next.is_terminal() {
            info!(deployment_id = %self.deployment.id, status = %next, "Deployment finished: {}", self.deployment.status_reason);
        }
        self.executor.reporter.status_changed(&self.deployment).await;
        true
    }

    async fn on_failure(&mut self, failed_idx: usize) {
        let failed = self.deployment.stages[failed_idx].clone();
        let reason = format!(
            "Failed at stage {} (plugin {}): {}",
            failed.name, failed.plugin, failed.status_reason
        );

        let requested = self.signals.request().is_some_and(|r| r.wants_rollback());
        let rollback = (self.resolved.spec.planner.auto_rollback || requested)
            .then(|| selection::rollback_stage_for(&self.deployment, &failed))
            .flatten();
        let Some(rollback_idx) = rollback else {
            self.transition(DeploymentStatus::Failure, reason).await;
            return;
        };

        if !self.transition(DeploymentStatus::RollingBack, reason.clone()).await {
            return;
        }
        match self.roll_back(rollback_idx).await {
            Some(RollbackOutcome::Interrupted) => {
                let reason = self.cancel_reason("while rolling back");
                self.transition(DeploymentStatus::Cancelled, reason).await;
            }
            Some(_) => {
                self.transition(DeploymentStatus::Failure, reason).await;
            }
            None => {}
        }
    }

    async fn on_cancel(&mut self, active_idx: Option<usize>) {
        let request = self.signals.request().unwrap_or_default();
        let rollback = if request.wants_rollback() {
            active_idx
                .or_else(|| selection::last_run_stage(&self.deployment))
                .map(|i| self.deployment.stages[i].clone())
                .and_then(|s| selection::rollback_stage_for(&self.deployment, &s))
        } else {
            None
        };

        let reason = self.cancel_reason("");
        let can_roll_back = self.deployment.status == DeploymentStatus::Running;
        if let (Some(rollback_idx), true) = (rollback, can_roll_back) {
            if !self.transition(DeploymentStatus::RollingBack, reason.clone()).await {
                return;
            }
            if self.roll_back(rollback_idx).await.is_none() {
                return;
            }
        }
        self.transition(DeploymentStatus::Cancelled, reason).await;
    }

    fn cancel_reason(&self, suffix: &str) -> String {
        self.signals.cancel_reason(suffix)
    }

    /// Run a rollback stage; a new cancel request interrupts it.
    /// `None` means the agent is shutting down.
    async fn roll_back(&mut self, idx: usize) -> Option<RollbackOutcome> {
        let (cancel, watcher) = self.signals.next_cancel();
        let end = self.run_stage(idx, cancel.clone()).await;
        watcher.abort();

        let outcome = match end {
            StageEnd::Shutdown => return None,
            _ if cancel.is_cancelled() => RollbackOutcome::Interrupted,
            StageEnd::Finished(StageStatus::Success) => RollbackOutcome::Succeeded,
            StageEnd::Finished(_) => RollbackOutcome::Failed,
        };
        self.deployment.rollback = Some(outcome);
        if outcome == RollbackOutcome::Interrupted {
            warn!(deployment_id = %self.deployment.id, "Rollback interrupted by cancel");
            self.deployment
                .metadata
                .insert(METADATA_ROLLBACK_INTERRUPTED.to_string(), "true".to_string());
            self.deployment.touch(Utc::now());
            self.executor
                .reporter
                .deployment_metadata(&self.deployment, &self.executor.shutdown)
                .await;
        }
        Some(outcome)
    }
}
