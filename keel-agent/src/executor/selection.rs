//! Which stage runs next

use chrono::{DateTime, Utc};
use keel_core::domain::deployment::Deployment;
use keel_core::domain::stage::{Stage, StageStatus};

/// Position of the lowest-index stage still to run, rollback stages aside
pub fn next_stage(deployment: &Deployment) -> Option<usize> {
    deployment
        .stages
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.rollback && !s.is_terminal())
        .min_by_key(|(_, s)| s.index)
        .map(|(i, _)| i)
}

/// Rollback stage of the plugin that owns `failed`
///
/// Prefers the rollback stage sharing the failed stage's index, then the
/// plugin's lowest-index one.
pub fn rollback_stage_for(deployment: &Deployment, failed: &Stage) -> Option<usize> {
    let candidates = || {
        deployment
            .stages
            .iter()
            .enumerate()
            .filter(|(_, s)| s.rollback && s.plugin == failed.plugin && !s.is_terminal())
    };
    candidates()
        .find(|(_, s)| s.index == failed.index)
        .or_else(|| candidates().min_by_key(|(_, s)| s.index))
        .map(|(i, _)| i)
}

/// The most recent forward stage that actually ran
pub fn last_run_stage(deployment: &Deployment) -> Option<usize> {
    deployment
        .stages
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.rollback && !matches!(s.status, StageStatus::NotStarted | StageStatus::Skipped))
        .max_by_key(|(_, s)| s.index)
        .map(|(i, _)| i)
}

/// Mark every forward stage still to run as SKIPPED; returns their ids
pub fn skip_remaining(deployment: &mut Deployment, reason: &str, now: DateTime<Utc>) -> Vec<String> {
    let mut skipped = Vec::new();
    for stage in deployment.stages.iter_mut().filter(|s| !s.rollback && !s.is_terminal()) {
        stage.set_status(StageStatus::Skipped, reason, now);
        skipped.push(stage.id.clone());
    }
    deployment.touch(now);
    skipped
}
