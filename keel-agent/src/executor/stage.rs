//! Running a single stage against its plugin

use chrono::Utc;
use futures::future::OptionFuture;
use keel_core::domain::log::LogLevel;
use keel_core::domain::stage::StageStatus;
use keel_core::plugin::{
    ExecuteStageRequest, PluginResult, StageEvent, StageEventSender, StageOutcome,
};
use keel_core::spec::{NotificationEventType, WAIT_APPROVAL};
use std::pin::Pin;
use tokio::time::{self, Instant, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::DeploymentRun;
use crate::notifier::NotificationEvent;

const EVENT_BUFFER: usize = 256;

pub(super) enum StageEnd {
    Finished(StageStatus),
    /// The agent is shutting down; the stage stays as it was
    Shutdown,
}

/// How one `ExecuteStage` attempt ended
enum Attempt {
    Replied(PluginResult<StageOutcome>),
    GraceExpired,
    TimedOut,
    Shutdown,
}

impl DeploymentRun<'_> {
    /// Execute the stage at `idx`, retrying transient plugin errors
    ///
    /// `cancel` is handed to the plugin; once it fires the plugin has the
    /// grace window to answer before the stage is forced CANCELLED.
    pub(super) async fn run_stage(&mut self, idx: usize, cancel: CancellationToken) -> StageEnd {
        let executor = self.executor;
        let (stage_id, plugin_name) = {
            let stage = &mut self.deployment.stages[idx];
            stage.set_status(StageStatus::Running, "", Utc::now());
            (stage.id.clone(), stage.plugin.clone())
        };
        self.deployment.touch(Utc::now());
        executor.reporter.stage_changed(&self.deployment, &stage_id).await;

        let stage = self.deployment.stages[idx].clone();
        info!(deployment_id = %self.deployment.id, stage_id = %stage.id, plugin = %plugin_name, "Running stage {}", stage.name);
        if stage.name == WAIT_APPROVAL {
            executor.reporter.notifier().notify(NotificationEvent::new(
                NotificationEventType::DeploymentWaitApproval,
                &self.deployment,
            ));
        }

        let plugin = match executor.registry.get(&plugin_name) {
            Ok(plugin) => plugin,
            Err(e) => return self.finish_stage(idx, StageStatus::Failure, e.to_string()).await,
        };

        let stage_budget = stage
            .timeout_secs
            .map(time::Duration::from_secs)
            .map(|t| Instant::now() + t);
        let deadline = match stage_budget {
            Some(at) => at.min(self.deadline),
            None => self.deadline,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let retried_count = self.deployment.stages[idx].retried_count;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let request = ExecuteStageRequest {
                execution_id: Uuid::new_v4().to_string(),
                deployment_id: self.deployment.id.clone(),
                stage_id: stage.id.clone(),
                stage_name: stage.name.clone(),
                stage_index: stage.index,
                rollback: stage.rollback,
                config: stage.config.clone(),
                input: self.resolved.input.clone(),
                deploy_targets: self.deployment.deploy_targets(&plugin_name).to_vec(),
                timeout_secs: remaining.as_secs().max(1),
                running_commit_hash: self.deployment.running_commit_hash.clone(),
            };

            let call_cancel = cancel.child_token();
            let (events_tx, mut events) = StageEventSender::channel(EVENT_BUFFER);
            let exec = plugin.execute_stage(request, events_tx, call_cancel.clone());
            tokio::pin!(exec);

            let mut grace: OptionFuture<Pin<Box<Sleep>>> = None.into();
            let mut cancel_seen = false;
            let mut events_open = true;

            let result = loop {
                tokio::select! {
                    reply = &mut exec => break Attempt::Replied(reply),
                    event = events.recv(), if events_open => match event {
                        Some(event) => self.on_event(idx, retried_count, event).await,
                        None => events_open = false,
                    },
                    _ = cancel.cancelled(), if !cancel_seen => {
                        cancel_seen = true;
                        debug!(stage_id = %stage.id, "Cancel requested, waiting for the plugin");
                        grace = Some(Box::pin(time::sleep(executor.cancel_grace))).into();
                    }
                    Some(()) = &mut grace => break Attempt::GraceExpired,
                    _ = time::sleep_until(deadline) => break Attempt::TimedOut,
                    _ = executor.shutdown.cancelled() => break Attempt::Shutdown,
                }
            };
            call_cancel.cancel();
            drop(exec);
            while let Ok(event) = events.try_recv() {
                self.on_event(idx, retried_count, event).await;
            }

            match result {
                Attempt::Shutdown => return StageEnd::Shutdown,
                Attempt::GraceExpired => {
                    let reason = format!(
                        "Plugin {} did not acknowledge the cancel within {:?}",
                        plugin_name, executor.cancel_grace
                    );
                    return self.finish_stage(idx, StageStatus::Cancelled, reason).await;
                }
                Attempt::TimedOut => {
                    let reason = if stage_budget.is_some_and(|at| at <= self.deadline) {
                        format!("Stage timed out after {}s", stage.timeout_secs.unwrap_or_default())
                    } else {
                        "Deployment timed out".to_string()
                    };
                    return self.finish_stage(idx, StageStatus::Failure, reason).await;
                }
                Attempt::Replied(Ok(outcome)) => {
                    let status = if outcome.status.is_terminal() {
                        outcome.status
                    } else {
                        StageStatus::Failure
                    };
                    let reason = if status == outcome.status {
                        outcome.reason
                    } else {
                        format!("plugin {} returned non-terminal status {}", plugin_name, outcome.status)
                    };
                    return self.finish_stage(idx, status, reason).await;
                }
                Attempt::Replied(Err(status)) => {
                    if cancel.is_cancelled() {
                        return self
                            .finish_stage(idx, StageStatus::Cancelled, format!("plugin {}: {}", plugin_name, status))
                            .await;
                    }
                    let delay = executor.stage_retry.delay_for(attempt);
                    let retryable = status.is_retryable()
                        && attempt < executor.stage_retry.max_attempts()
                        && Instant::now() + delay < deadline;
                    if !retryable {
                        return self
                            .finish_stage(idx, StageStatus::Failure, format!("plugin {}: {}", plugin_name, status))
                            .await;
                    }

                    warn!(
                        deployment_id = %self.deployment.id,
                        stage_id = %stage.id,
                        attempt,
                        "Stage call failed, retrying in {:?}: {}",
                        delay,
                        status
                    );
                    self.logs.note(
                        &stage.id,
                        retried_count,
                        LogLevel::Error,
                        format!("plugin {}: {}; retrying", plugin_name, status),
                    );
                    {
                        let s = &mut self.deployment.stages[idx];
                        s.retried_count += 1;
                        s.set_status(StageStatus::Running, format!("Retrying after: {}", status), Utc::now());
                    }
                    self.deployment.touch(Utc::now());
                    executor.reporter.stage_changed(&self.deployment, &stage_id).await;

                    tokio::select! {
                        _ = time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return self
                                .finish_stage(idx, StageStatus::Cancelled, "Cancelled while waiting to retry")
                                .await;
                        }
                        _ = executor.shutdown.cancelled() => return StageEnd::Shutdown,
                    }
                }
            }
        }
    }

    async fn finish_stage(&mut self, idx: usize, status: StageStatus, reason: impl Into<String>) -> StageEnd {
        let now = Utc::now();
        let stage = &mut self.deployment.stages[idx];
        stage.set_status(status, reason, now);
        let stage_id = stage.id.clone();
        info!(deployment_id = %self.deployment.id, stage_id = %stage_id, status = %status, "Stage finished");
        self.deployment.touch(now);
        self.logs.flush().await;
        self.executor.reporter.stage_changed(&self.deployment, &stage_id).await;
        StageEnd::Finished(status)
    }

    async fn on_event(&mut self, idx: usize, retried_count: u32, event: StageEvent) {
        match event {
            StageEvent::Log(entry) => {
                let stage_id = &self.deployment.stages[idx].id;
                self.logs.add(stage_id, retried_count, entry);
            }
            StageEvent::Metadata { key, value } => {
                let now = Utc::now();
                let stage = &mut self.deployment.stages[idx];
                stage.metadata.insert(key, value);
                stage.updated_at = stage.updated_at.max(now);
                let stage_id = stage.id.clone();
                self.deployment.touch(now);
                let cancel = self.signals.token().clone();
                self.executor
                    .reporter
                    .stage_metadata(&self.deployment, &stage_id, &cancel)
                    .await;
            }
        }
    }
}
