//! Fixtures shared by unit tests

use async_trait::async_trait;
use chrono::Utc;
use keel_client::{ControlPlane, Result};
use keel_core::domain::application::{Application, DeploymentReference, GitPath, GitRepository};
use keel_core::domain::command::Command;
use keel_core::domain::deployment::{
    Commit, Deployment, DeploymentStatus, DeploymentTrigger, SyncStrategy,
};
use keel_core::domain::stage::{Stage, StageStatus};
use keel_core::dto::application::{GetMostRecentDeployment, MostRecentDeployment};
use keel_core::dto::command::CommandHandled;
use keel_core::dto::deployment::{
    DeploymentCompleted, DeploymentMetadata, DeploymentPlanned, DeploymentStatusChanged,
    StageLogs, StageMetadata, StageStatusChanged,
};
use keel_core::plugin::{
    BuildPipelineSyncStagesRequest, BuildQuickSyncStagesRequest, BuildStagesResponse,
    DeploymentService, DetermineStrategyRequest, DetermineStrategyResponse,
    DetermineVersionsRequest, DetermineVersionsResponse, ExecuteStageRequest,
    FetchDefinedStagesResponse, LivestateService, PlannedStage, PluginResult, StageEventSender,
    StageOutcome,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::notifier::Notifier;
use crate::reporter::Reporter;
use crate::store::{DeploymentStore, MemoryDataStore};

fn git_path() -> GitPath {
    GitPath {
        repo: GitRepository {
            id: "repo".into(),
            remote: "https://github.com/org/repo.git".into(),
            branch: "main".into(),
        },
        path: "apps/web".into(),
        config_filename: None,
    }
}

pub fn application(id: &str, name: &str) -> Application {
    Application {
        id: id.into(),
        name: name.into(),
        project_id: "proj".into(),
        piped_id: "piped-1".into(),
        kind: "KUBERNETES".into(),
        labels: BTreeMap::new(),
        git_path: git_path(),
        deploy_targets_by_plugin: BTreeMap::from([("kube".to_string(), vec!["cluster-1".to_string()])]),
        disabled: false,
        most_recent_successful_deployment: None,
        most_recent_deployment: None,
    }
}

pub fn deployment(id: &str, application_id: &str) -> Deployment {
    let now = Utc::now();
    Deployment {
        id: id.into(),
        application_id: application_id.into(),
        application_name: "web".into(),
        application_kind: "KUBERNETES".into(),
        project_id: "proj".into(),
        piped_id: "piped-1".into(),
        trigger: DeploymentTrigger {
            commit: Commit {
                hash: "c1".into(),
                message: "update image".into(),
                author: "dev".into(),
                branch: "main".into(),
                url: String::new(),
                created_at: now,
            },
            commander: String::new(),
            timestamp: now,
            sync_strategy: SyncStrategy::Auto,
            strategy_summary: String::new(),
        },
        sync_strategy: SyncStrategy::Auto,
        summary: String::new(),
        git_path: git_path(),
        deploy_targets_by_plugin: BTreeMap::from([("kube".to_string(), vec!["cluster-1".to_string()])]),
        labels: BTreeMap::new(),
        status: DeploymentStatus::Pending,
        status_reason: String::new(),
        versions: Vec::new(),
        metadata: BTreeMap::new(),
        stages: Vec::new(),
        rollback: None,
        deployment_chain_id: None,
        block_index: 0,
        trace_commit_hash: String::new(),
        running_commit_hash: String::new(),
        created_at: now,
        updated_at: now,
        completed_at: None,
    }
}

pub fn stage(index: u32, plugin: &str, rollback: bool) -> Stage {
    let now = Utc::now();
    let (id, name) = if rollback {
        (format!("stage-{}-rollback-{}", index, plugin), "ROLLBACK".to_string())
    } else {
        (format!("stage-{}", index), "SYNC".to_string())
    };
    Stage {
        id,
        name,
        desc: String::new(),
        index,
        plugin: plugin.into(),
        rollback,
        config: Default::default(),
        status: StageStatus::NotStarted,
        status_reason: String::new(),
        predecessors: Vec::new(),
        retried_count: 0,
        timeout_secs: None,
        skip_on: Default::default(),
        metadata: BTreeMap::new(),
        created_at: now,
        updated_at: now,
        completed_at: None,
    }
}

pub fn reporter(shutdown: CancellationToken) -> Reporter {
    reporter_with(Arc::new(RecordingControlPlane::default()), shutdown)
}

pub fn reporter_with(control_plane: Arc<RecordingControlPlane>, shutdown: CancellationToken) -> Reporter {
    let store = Arc::new(DeploymentStore::new(Arc::new(MemoryDataStore::new())));
    Reporter::new(control_plane, store, Notifier::disabled(), shutdown)
}

/// Control plane that accepts everything and remembers status reports
#[derive(Default)]
pub struct RecordingControlPlane {
    pub applications: Mutex<Vec<Application>>,
    pub commands: Mutex<Vec<Command>>,
    pub created: Mutex<Vec<String>>,
    pub statuses: Mutex<Vec<(String, DeploymentStatus)>>,
    pub stages: Mutex<Vec<(String, StageStatus)>>,
    pub handled: Mutex<Vec<CommandHandled>>,
    pub logs: Mutex<Vec<StageLogs>>,
}

impl RecordingControlPlane {
    pub fn statuses_of(&self, deployment_id: &str) -> Vec<DeploymentStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == deployment_id)
            .map(|(_, s)| *s)
            .collect()
    }
}

#[async_trait]
impl ControlPlane for RecordingControlPlane {
    async fn create_deployment(&self, deployment: &Deployment) -> Result<()> {
        self.created.lock().unwrap().push(deployment.id.clone());
        Ok(())
    }

    async fn report_deployment_planned(&self, _req: DeploymentPlanned) -> Result<()> {
        Ok(())
    }

    async fn report_deployment_status_changed(&self, req: DeploymentStatusChanged) -> Result<()> {
        self.statuses.lock().unwrap().push((req.deployment_id, req.status));
        Ok(())
    }

    async fn report_stage_status_changed(&self, req: StageStatusChanged) -> Result<()> {
        self.stages.lock().unwrap().push((req.stage_id, req.status));
        Ok(())
    }

    async fn report_deployment_completed(&self, _req: DeploymentCompleted) -> Result<()> {
        Ok(())
    }

    async fn report_application_most_recent_deployment(&self, _req: MostRecentDeployment) -> Result<()> {
        Ok(())
    }

    async fn get_application_most_recent_deployment(
        &self,
        _req: GetMostRecentDeployment,
    ) -> Result<Option<DeploymentReference>> {
        Ok(None)
    }

    async fn list_applications(&self) -> Result<Vec<Application>> {
        Ok(self.applications.lock().unwrap().clone())
    }

    async fn save_stage_metadata(&self, _req: StageMetadata) -> Result<()> {
        Ok(())
    }

    async fn save_deployment_metadata(&self, _req: DeploymentMetadata) -> Result<()> {
        Ok(())
    }

    async fn list_not_completed_deployments(&self) -> Result<Vec<Deployment>> {
        Ok(Vec::new())
    }

    async fn list_unhandled_commands(&self) -> Result<Vec<Command>> {
        Ok(self.commands.lock().unwrap().clone())
    }

    async fn report_command_handled(&self, req: CommandHandled) -> Result<()> {
        self.handled.lock().unwrap().push(req);
        Ok(())
    }

    async fn report_stage_logs(&self, req: StageLogs) -> Result<()> {
        self.logs.lock().unwrap().push(req);
        Ok(())
    }
}

/// Plugin owning a fixed set of stages; stage outcomes are queued per
/// stage name and default to SUCCESS
pub struct ScriptedPlugin {
    stages: Vec<String>,
    outcomes: Mutex<HashMap<String, VecDeque<PluginResult<StageOutcome>>>>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedPlugin {
    pub fn new(stages: &[&str]) -> Self {
        Self {
            stages: stages.iter().map(|s| s.to_string()).collect(),
            outcomes: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, stage: &str, outcome: PluginResult<StageOutcome>) -> Self {
        self.outcomes
            .lock()
            .unwrap()
            .entry(stage.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    /// Stage IDs in execution order
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeploymentService for ScriptedPlugin {
    async fn fetch_defined_stages(&self) -> PluginResult<FetchDefinedStagesResponse> {
        Ok(FetchDefinedStagesResponse {
            stages: self.stages.clone(),
        })
    }

    async fn determine_versions(&self, _req: DetermineVersionsRequest) -> PluginResult<DetermineVersionsResponse> {
        Ok(DetermineVersionsResponse::default())
    }

    async fn determine_strategy(&self, _req: DetermineStrategyRequest) -> PluginResult<DetermineStrategyResponse> {
        Ok(DetermineStrategyResponse::default())
    }

    async fn build_pipeline_sync_stages(
        &self,
        req: BuildPipelineSyncStagesRequest,
    ) -> PluginResult<BuildStagesResponse> {
        let mut stages: Vec<PlannedStage> = req
            .stages
            .into_iter()
            .map(|s| PlannedStage {
                index: s.index,
                name: s.name,
                desc: s.desc,
                rollback: false,
                config: s.config,
            })
            .collect();
        if req.rollback {
            if let Some(first) = stages.first().map(|s| s.index) {
                stages.push(PlannedStage {
                    index: first,
                    name: "ROLLBACK".into(),
                    desc: String::new(),
                    rollback: true,
                    config: Default::default(),
                });
            }
        }
        Ok(BuildStagesResponse { stages })
    }

    async fn build_quick_sync_stages(&self, req: BuildQuickSyncStagesRequest) -> PluginResult<BuildStagesResponse> {
        let Some(name) = self.stages.first() else {
            return Ok(BuildStagesResponse::default());
        };
        let mut stages = vec![PlannedStage {
            index: 0,
            name: name.clone(),
            desc: "Sync by applying all manifests".into(),
            rollback: false,
            config: Default::default(),
        }];
        if req.rollback {
            stages.push(PlannedStage {
                index: 0,
                name: "ROLLBACK".into(),
                desc: String::new(),
                rollback: true,
                config: Default::default(),
            });
        }
        Ok(BuildStagesResponse { stages })
    }

    async fn execute_stage(
        &self,
        req: ExecuteStageRequest,
        events: StageEventSender,
        _cancel: CancellationToken,
    ) -> PluginResult<StageOutcome> {
        self.executed.lock().unwrap().push(req.stage_id.clone());
        events.info(format!("running {}", req.stage_name)).await;
        let next = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&req.stage_name)
            .and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| Ok(StageOutcome::success()))
    }
}

impl LivestateService for ScriptedPlugin {}
