//! `WAIT_APPROVAL` stage support
//!
//! Polls the agent for `APPROVE_STAGE` commands until enough distinct
//! approvers have approved, the stage times out, or the stage is cancelled.

use keel_core::domain::stage::StageStatus;
use keel_core::plugin::{StageCommandSource, StageEventSender, StageOutcome};
use keel_core::spec::WaitApprovalStageOptions;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Metadata key holding the comma-separated approver list
pub const APPROVERS_METADATA_KEY: &str = "Approvers";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Block until the approval gate resolves
pub async fn wait_approval(
    source: &dyn StageCommandSource,
    deployment_id: &str,
    stage_id: &str,
    opts: &WaitApprovalStageOptions,
    events: &StageEventSender,
    cancel: &CancellationToken,
    poll_interval: Duration,
) -> StageOutcome {
    let deadline = Instant::now() + opts.timeout;
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut approvers: Vec<String> = Vec::new();
    events
        .info(format!(
            "Waiting for {} approval(s) from {}",
            opts.min_approver_num,
            if opts.approvers.is_empty() {
                "any user".to_string()
            } else {
                opts.approvers.join(", ")
            }
        ))
        .await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                return StageOutcome::cancelled("Approval wait was cancelled");
            }
            _ = tokio::time::sleep_until(deadline) => {
                events.error("Timed out waiting for approval").await;
                return StageOutcome::failure(format!(
                    "Timed out after waiting {}s for approval",
                    opts.timeout.as_secs()
                ));
            }
            _ = ticker.tick() => {}
        }

        let commands = match source.list_stage_commands(deployment_id, stage_id).await {
            Ok(commands) => commands,
            Err(status) => {
                warn!(deployment_id, stage_id, error = %status, "Failed to list stage commands");
                continue;
            }
        };

        for cmd in commands {
            if approvers.contains(&cmd.commander) {
                continue;
            }
            if !opts.approvers.is_empty() && !opts.approvers.contains(&cmd.commander) {
                events
                    .info(format!("{} is not allowed to approve this stage", cmd.commander))
                    .await;
                continue;
            }
            events.info(format!("Got approval from {}", cmd.commander)).await;
            approvers.push(cmd.commander);
        }

        if approvers.len() as u32 >= opts.min_approver_num {
            events
                .metadata(APPROVERS_METADATA_KEY, approvers.join(","))
                .await;
            events
                .success(format!("Approved by {}", approvers.join(", ")))
                .await;
            return StageOutcome::new(StageStatus::Success, "");
        }
    }
}
