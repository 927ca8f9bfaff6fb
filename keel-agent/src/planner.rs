//! Planner coordinator
//!
//! Asks the involved plugins for artifact versions, a strategy and stages,
//! then merges their answers into one ordered stage list. Any plugin error
//! aborts the plan; partial answers are discarded.

use chrono::{DateTime, Utc};
use keel_core::Code;
use keel_core::domain::deployment::{ArtifactVersion, Deployment, SyncStrategy, TransitionError, DeploymentStatus};
use keel_core::domain::stage::{Stage, StageStatus};
use keel_core::plugin::{
    BuildPipelineSyncStagesRequest, BuildQuickSyncStagesRequest, DetermineStrategyRequest,
    DetermineVersionsRequest, PlannedStage, PluginResult, PluginStatus, RequestedStage,
};
use keel_core::spec::{ApplicationSpec, PipelineStage};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AgentError, Result};
use crate::plugin::PluginRegistry;
use crate::spec_source::ResolvedSpec;

pub const QUICK_SYNC_BY_TRIGGER: &str = "Quick sync as requested by the trigger";
pub const PIPELINE_SYNC: &str = "Sync with the specified pipeline";
pub const QUICK_SYNC_BY_DEFAULT: &str = "Quick sync by default since no plugin chose a strategy";
pub const QUICK_SYNC_NO_PIPELINE: &str = "Quick sync because the application has no pipeline";
pub const PLANNED_REASON: &str = "The deployment has been planned";

/// Outcome of planning a deployment
#[derive(Debug, Clone)]
pub struct Plan {
    pub strategy: SyncStrategy,
    pub summary: String,
    pub versions: Vec<ArtifactVersion>,
    pub stages: Vec<Stage>,
}

impl Plan {
    /// Record the plan on the deployment and move it to PLANNED
    pub fn apply(self, deployment: &mut Deployment, now: DateTime<Utc>) -> std::result::Result<(), TransitionError> {
        deployment.transition(DeploymentStatus::Planned, PLANNED_REASON, now)?;
        deployment.sync_strategy = self.strategy;
        deployment.summary = self.summary;
        deployment.versions = self.versions;
        deployment.stages = self.stages;
        Ok(())
    }
}

pub struct PlannerCoordinator {
    registry: Arc<PluginRegistry>,
}

impl PlannerCoordinator {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub async fn plan(
        &self,
        deployment: &Deployment,
        resolved: &ResolvedSpec,
        cancel: &CancellationToken,
    ) -> Result<Plan> {
        let spec = &resolved.spec;
        let timeout = spec.timeout;
        let plugins: Vec<&str> = deployment.plugin_names().collect();
        if plugins.is_empty() {
            return Err(AgentError::FailedPrecondition(format!(
                "application {} has no deploy targets",
                deployment.application_id
            )));
        }

        let mut versions = BTreeSet::new();
        for name in &plugins {
            let plugin = self.registry.get(name)?;
            let resp = bounded(name, timeout, cancel, plugin.determine_versions(DetermineVersionsRequest {
                deployment_id: deployment.id.clone(),
                input: resolved.input.clone(),
                deploy_targets: deployment.deploy_targets(name).to_vec(),
            }))
            .await?;
            versions.extend(resp.versions);
        }

        let (strategy, summary) = self.choose_strategy(deployment, resolved, &plugins, cancel).await?;
        debug!(deployment_id = %deployment.id, ?strategy, "Strategy chosen: {}", summary);

        let now = Utc::now();
        let stages = match strategy {
            SyncStrategy::PipelineSync => self.pipeline_stages(deployment, resolved, cancel, now).await?,
            _ => self.quick_sync_stages(deployment, resolved, &plugins, cancel, now).await?,
        };

        info!(
            deployment_id = %deployment.id,
            stages = stages.len(),
            "Planned deployment: {}",
            summary
        );
        Ok(Plan {
            strategy,
            summary,
            versions: versions.into_iter().collect(),
            stages,
        })
    }

    async fn choose_strategy(
        &self,
        deployment: &Deployment,
        resolved: &ResolvedSpec,
        plugins: &[&str],
        cancel: &CancellationToken,
    ) -> Result<(SyncStrategy, String)> {
        let trigger = &deployment.trigger;
        let chosen = match trigger.sync_strategy {
            SyncStrategy::QuickSync => (
                SyncStrategy::QuickSync,
                non_empty_or(&trigger.strategy_summary, QUICK_SYNC_BY_TRIGGER),
            ),
            SyncStrategy::PipelineSync => (
                SyncStrategy::PipelineSync,
                non_empty_or(&trigger.strategy_summary, PIPELINE_SYNC),
            ),
            SyncStrategy::Auto => {
                let mut answers = Vec::with_capacity(plugins.len());
                for name in plugins {
                    let plugin = self.registry.get(name)?;
                    let resp = bounded(name, resolved.spec.timeout, cancel, plugin.determine_strategy(DetermineStrategyRequest {
                        deployment_id: deployment.id.clone(),
                        input: resolved.input.clone(),
                        deploy_targets: deployment.deploy_targets(name).to_vec(),
                        running_commit_hash: deployment.running_commit_hash.clone(),
                    }))
                    .await?;
                    answers.push((resp.strategy, resp.summary));
                }
                combine_strategies(answers)
            }
        };

        if chosen.0 == SyncStrategy::PipelineSync && !resolved.spec.has_pipeline() {
            return Ok((SyncStrategy::QuickSync, QUICK_SYNC_NO_PIPELINE.to_string()));
        }
        Ok(chosen)
    }

    async fn pipeline_stages(
        &self,
        deployment: &Deployment,
        resolved: &ResolvedSpec,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<Vec<Stage>> {
        let spec = &resolved.spec;
        let mut by_owner: BTreeMap<&str, Vec<RequestedStage>> = BTreeMap::new();
        for (i, stage) in spec.stages().iter().enumerate() {
            let owner = self.registry.owner_of(&stage.name).ok_or_else(|| {
                AgentError::FailedPrecondition(format!("no plugin owns stage {}", stage.name))
            })?;
            by_owner.entry(owner).or_default().push(RequestedStage {
                index: i as u32,
                name: stage.name.clone(),
                desc: stage.desc.clone(),
                config: stage.config_bytes().into(),
            });
        }

        let mut answers = Vec::with_capacity(by_owner.len());
        for (owner, requested) in by_owner {
            let plugin = self.registry.get(owner)?;
            let resp = bounded(owner, spec.timeout, cancel, plugin.build_pipeline_sync_stages(BuildPipelineSyncStagesRequest {
                deployment_id: deployment.id.clone(),
                input: resolved.input.clone(),
                deploy_targets: deployment.deploy_targets(owner).to_vec(),
                stages: requested,
                // A cancel may ask for a rollback even when autoRollback is off
                rollback: true,
            }))
            .await?;
            answers.push((owner.to_string(), resp.stages));
        }

        merge_stages(answers, Some(spec), now).map_err(AgentError::FailedPrecondition)
    }

    async fn quick_sync_stages(
        &self,
        deployment: &Deployment,
        resolved: &ResolvedSpec,
        plugins: &[&str],
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<Vec<Stage>> {
        let mut answers = Vec::with_capacity(plugins.len());
        for name in plugins {
            let plugin = self.registry.get(name)?;
            let resp = bounded(name, resolved.spec.timeout, cancel, plugin.build_quick_sync_stages(BuildQuickSyncStagesRequest {
                deployment_id: deployment.id.clone(),
                input: resolved.input.clone(),
                deploy_targets: deployment.deploy_targets(name).to_vec(),
                rollback: true,
            }))
            .await?;
            answers.push((name.to_string(), resp.stages));
        }
        merge_stages(reindex_quick_sync(answers), None, now).map_err(AgentError::FailedPrecondition)
    }
}

fn non_empty_or(s: &str, fallback: &str) -> String {
    if s.is_empty() { fallback.to_string() } else { s.to_string() }
}

/// Run a plugin call under the plan deadline and the deployment context
async fn bounded<T>(
    plugin: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    call: impl Future<Output = PluginResult<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AgentError::Cancelled("planning was cancelled".into())),
        r = time::timeout(timeout, call) => match r {
            Ok(reply) => reply.map_err(|status| AgentError::plugin(plugin, status)),
            Err(_) => Err(AgentError::plugin(
                plugin,
                PluginStatus::new(Code::DeadlineExceeded, "planning timed out"),
            )),
        },
    }
}

/// Pipeline wins over quick sync; silence means quick sync
pub fn combine_strategies(answers: Vec<(Option<SyncStrategy>, String)>) -> (SyncStrategy, String) {
    let pick = |wanted: SyncStrategy, fallback: &str| {
        answers
            .iter()
            .find(|(s, _)| *s == Some(wanted))
            .map(|(_, summary)| (wanted, non_empty_or(summary, fallback)))
    };
    pick(SyncStrategy::PipelineSync, PIPELINE_SYNC)
        .or_else(|| pick(SyncStrategy::QuickSync, QUICK_SYNC_BY_TRIGGER))
        .unwrap_or_else(|| (SyncStrategy::QuickSync, QUICK_SYNC_BY_DEFAULT.to_string()))
}

/// Shift each plugin's quick-sync indices past the previous plugin's stages
///
/// A plugin's block spans from its lowest index to its highest forward
/// index, gaps included, so the next plugin starts after all of it.
pub fn reindex_quick_sync(answers: Vec<(String, Vec<PlannedStage>)>) -> Vec<(String, Vec<PlannedStage>)> {
    let mut offset = 0;
    answers
        .into_iter()
        .map(|(plugin, mut stages)| {
            let base = stages.iter().map(|s| s.index).min().unwrap_or(0);
            for stage in &mut stages {
                stage.index = stage.index - base + offset;
            }
            if let Some(last) = stages.iter().filter(|s| !s.rollback).map(|s| s.index).max() {
                offset = last + 1;
            }
            (plugin, stages)
        })
        .collect()
}

pub fn stage_id(index: u32) -> String {
    format!("stage-{}", index)
}

pub fn rollback_stage_id(index: u32, plugin: &str) -> String {
    format!("stage-{}-rollback-{}", index, plugin)
}

/// Merge per-plugin stage answers into one plan
///
/// With a spec, every pipeline index must be present exactly once. Rollback
/// stages need a non-rollback sibling from the same plugin.
pub fn merge_stages(
    answers: Vec<(String, Vec<PlannedStage>)>,
    spec: Option<&ApplicationSpec>,
    now: DateTime<Utc>,
) -> std::result::Result<Vec<Stage>, String> {
    let mut owners: BTreeMap<u32, String> = BTreeMap::new();
    for (plugin, stages) in &answers {
        if stages.is_empty() {
            return Err(format!("plugin {} returned no stages", plugin));
        }
        for stage in stages.iter().filter(|s| !s.rollback) {
            if let Some(other) = owners.insert(stage.index, plugin.clone()) {
                return Err(format!(
                    "stage index {} is planned by both {} and {}",
                    stage.index, other, plugin
                ));
            }
        }
    }

    let pipeline: &[PipelineStage] = spec.map(ApplicationSpec::stages).unwrap_or_default();
    if spec.is_some() {
        for i in 0..pipeline.len() as u32 {
            if !owners.contains_key(&i) {
                return Err(format!("stage index {} is missing from the plan", i));
            }
        }
        if let Some(extra) = owners.keys().find(|i| **i as usize >= pipeline.len()) {
            return Err(format!("stage index {} is not in the pipeline", extra));
        }
    }

    let mut merged = Vec::new();
    for (plugin, stages) in answers {
        let forward: Vec<String> = owners
            .iter()
            .filter(|(_, owner)| **owner == plugin)
            .map(|(i, _)| stage_id(*i))
            .collect();

        for planned in stages {
            if planned.rollback && forward.is_empty() {
                return Err(format!(
                    "rollback stage {} of plugin {} has nothing to roll back",
                    planned.name, plugin
                ));
            }
            let from_spec = pipeline.get(planned.index as usize).filter(|_| !planned.rollback);
            let (id, predecessors) = if planned.rollback {
                (rollback_stage_id(planned.index, &plugin), forward.clone())
            } else {
                let previous = owners
                    .range(..planned.index)
                    .next_back()
                    .map(|(i, _)| stage_id(*i));
                (stage_id(planned.index), previous.into_iter().collect())
            };
            let desc = match (&planned.desc, from_spec) {
                (d, Some(s)) if d.is_empty() => s.desc.clone(),
                (d, _) => d.clone(),
            };

            merged.push(Stage {
                id,
                name: planned.name,
                desc,
                index: planned.index,
                plugin: plugin.clone(),
                rollback: planned.rollback,
                config: planned.config,
                status: StageStatus::NotStarted,
                status_reason: String::new(),
                predecessors,
                retried_count: 0,
                timeout_secs: from_spec.and_then(|s| s.timeout).map(|t| t.as_secs()),
                skip_on: from_spec.map(|s| s.skip_on.clone()).unwrap_or_default(),
                metadata: BTreeMap::new(),
                created_at: now,
                updated_at: now,
                completed_at: None,
            });
        }
    }

    merged.sort_by(|a, b| (a.index, a.rollback, &a.plugin).cmp(&(b.index, b.rollback, &b.plugin)));
    Ok(merged)
}
