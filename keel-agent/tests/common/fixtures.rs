//! Test fixtures: applications, spec files and in-process plugins.

use async_trait::async_trait;
use chrono::Utc;
use keel_core::domain::application::{Application, GitPath, GitRepository};
use keel_core::domain::deployment::{Commit, Deployment, DeploymentStatus, DeploymentTrigger, SyncStrategy};
use keel_core::domain::stage::StageStatus;
use keel_core::plugin::{
    BuildPipelineSyncStagesRequest, BuildQuickSyncStagesRequest, BuildStagesResponse,
    DeploymentService, DetermineStrategyRequest, DetermineStrategyResponse,
    DetermineVersionsRequest, DetermineVersionsResponse, ExecuteStageRequest,
    FetchDefinedStagesResponse, LivestateService, PlannedStage, PluginResult, PluginStatus,
    StageCommandSource, StageEventSender, StageOutcome,
};
use keel_core::spec::{WAIT_APPROVAL, WaitApprovalStageOptions, parse_application_spec};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::REPO_ID;

pub const KUBE_STAGES: [&str; 4] = [
    "K8S_SYNC",
    "K8S_CANARY_ROLLOUT",
    "K8S_PRIMARY_ROLLOUT",
    "K8S_ROLLBACK",
];

/// An application deployed by the `kube` plugin from `dir` in the test repository
pub fn application(id: &str, name: &str, dir: &str) -> Application {
    Application {
        id: id.into(),
        name: name.into(),
        project_id: "proj".into(),
        piped_id: "piped-1".into(),
        kind: "KUBERNETES".into(),
        labels: BTreeMap::new(),
        git_path: GitPath {
            repo: GitRepository {
                id: REPO_ID.into(),
                remote: "https://github.com/org/repo.git".into(),
                branch: "main".into(),
            },
            path: dir.into(),
            config_filename: None,
        },
        deploy_targets_by_plugin: BTreeMap::from([("kube".to_string(), vec!["cluster-1".to_string()])]),
        disabled: false,
        most_recent_successful_deployment: None,
        most_recent_deployment: None,
    }
}

/// A deployment of `app` left in `status` by a previous agent run
pub fn deployment(id: &str, app: &Application, status: DeploymentStatus) -> Deployment {
    let now = Utc::now();
    Deployment {
        id: id.into(),
        application_id: app.id.clone(),
        application_name: app.name.clone(),
        application_kind: app.kind.clone(),
        project_id: app.project_id.clone(),
        piped_id: app.piped_id.clone(),
        trigger: DeploymentTrigger {
            commit: Commit {
                hash: "c0".into(),
                message: "initial".into(),
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
        sync_strategy: SyncStrategy::QuickSync,
        summary: String::new(),
        git_path: app.git_path.clone(),
        deploy_targets_by_plugin: app.deploy_targets_by_plugin.clone(),
        labels: app.labels.clone(),
        status,
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

/// Spec path of an application directory
pub fn spec_path(dir: &str) -> String {
    match dir.trim_matches('/') {
        "" | "." => "app.pipecd.yaml".to_string(),
        dir => format!("{}/app.pipecd.yaml", dir),
    }
}

pub const QUICK_SPEC: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: Application
spec:
  name: web
"#;

pub const CANARY_APPROVAL_SPEC: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: Application
spec:
  name: api
  pipeline:
    stages:
      - name: K8S_CANARY_ROLLOUT
        with:
          replicas: 1
      - name: WAIT_APPROVAL
        with:
          minApproverNum: 2
          timeout: 1h
      - name: K8S_PRIMARY_ROLLOUT
"#;

pub const CANARY_SPEC: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: Application
spec:
  name: api
  pipeline:
    stages:
      - name: K8S_CANARY_ROLLOUT
      - name: K8S_PRIMARY_ROLLOUT
"#;

pub const AUTO_ROLLBACK_OFF_SPEC: &str = r#"
apiVersion: pipecd.dev/v1beta1
kind: Application
spec:
  name: api
  planner:
    autoRollback: false
  pipeline:
    stages:
      - name: K8S_CANARY_ROLLOUT
      - name: K8S_PRIMARY_ROLLOUT
"#;

/// What the kube plugin does when asked to run a stage
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(String),
    /// Stop the pipeline here without failing it
    Exit,
    /// Block until cancelled, then answer CANCELLED after `ack_after`
    UntilCancelled { ack_after: Duration },
    /// Block until cancelled, then report the rollout as failed
    FailOnCancel,
    /// Never answer, not even to a cancel
    Hang,
    /// Answer UNAVAILABLE for the first `times` calls, then succeed
    Unavailable { times: usize },
}

/// In-process stand-in for a Kubernetes deploy plugin
#[derive(Default)]
pub struct KubePlugin {
    behaviors: Mutex<HashMap<String, Behavior>>,
    executed: Mutex<Vec<String>>,
    calls: Mutex<Vec<(String, Instant)>>,
    versions_delay: Option<Duration>,
}

impl KubePlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, stage: &str, behavior: Behavior) -> Self {
        self.behaviors.lock().unwrap().insert(stage.to_string(), behavior);
        self
    }

    /// Take `delay` to answer DetermineVersions
    pub fn slow_versions(mut self, delay: Duration) -> Self {
        self.versions_delay = Some(delay);
        self
    }

    /// Stage names in execution order
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    /// When each ExecuteStage call for `stage` arrived
    pub fn calls_of(&self, stage: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == stage)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl DeploymentService for KubePlugin {
    async fn fetch_defined_stages(&self) -> PluginResult<FetchDefinedStagesResponse> {
        Ok(FetchDefinedStagesResponse {
            stages: KUBE_STAGES.iter().map(|s| s.to_string()).collect(),
        })
    }

    async fn determine_versions(&self, _req: DetermineVersionsRequest) -> PluginResult<DetermineVersionsResponse> {
        if let Some(delay) = self.versions_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(DetermineVersionsResponse::default())
    }

    /// Progressive delivery whenever the application declares a pipeline
    async fn determine_strategy(&self, req: DetermineStrategyRequest) -> PluginResult<DetermineStrategyResponse> {
        let loaded = parse_application_spec(req.input.spec_yaml.as_slice(), &req.input.spec_filename)
            .map_err(|e| PluginStatus::invalid_argument(e.to_string()))?;
        if !loaded.spec.has_pipeline() {
            return Ok(DetermineStrategyResponse::default());
        }
        Ok(DetermineStrategyResponse {
            strategy: Some(SyncStrategy::PipelineSync),
            summary: "Sync progressively because the application has a pipeline".into(),
        })
    }

    async fn build_pipeline_sync_stages(
        &self,
        req: BuildPipelineSyncStagesRequest,
    ) -> PluginResult<BuildStagesResponse> {
        let first = req.stages.first().map(|s| s.index);
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
        if let (true, Some(index)) = (req.rollback, first) {
            stages.push(rollback_stage(index));
        }
        Ok(BuildStagesResponse { stages })
    }

    async fn build_quick_sync_stages(&self, req: BuildQuickSyncStagesRequest) -> PluginResult<BuildStagesResponse> {
        let mut stages = vec![PlannedStage {
            index: 0,
            name: "K8S_SYNC".into(),
            desc: "Sync by applying all manifests".into(),
            rollback: false,
            config: Default::default(),
        }];
        if req.rollback {
            stages.push(rollback_stage(0));
        }
        Ok(BuildStagesResponse { stages })
    }

    async fn execute_stage(
        &self,
        req: ExecuteStageRequest,
        events: StageEventSender,
        cancel: CancellationToken,
    ) -> PluginResult<StageOutcome> {
        self.executed.lock().unwrap().push(req.stage_name.clone());
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((req.stage_name.clone(), Instant::now()));
            calls.iter().filter(|(name, _)| *name == req.stage_name).count()
        };
        events.info(format!("Running {}", req.stage_name)).await;
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&req.stage_name)
            .cloned()
            .unwrap_or(Behavior::Succeed);
        match behavior {
            Behavior::Succeed => Ok(StageOutcome::success()),
            Behavior::Fail(reason) => {
                events.error(reason.clone()).await;
                Ok(StageOutcome::failure(reason))
            }
            Behavior::Exit => Ok(StageOutcome::new(StageStatus::Exited, "Nothing left to roll out")),
            Behavior::UntilCancelled { ack_after } => {
                cancel.cancelled().await;
                tokio::time::sleep(ack_after).await;
                Ok(StageOutcome::cancelled("Stopped rolling out on cancel"))
            }
            Behavior::FailOnCancel => {
                cancel.cancelled().await;
                Ok(StageOutcome::failure("Rollout aborted halfway"))
            }
            Behavior::Hang => std::future::pending().await,
            Behavior::Unavailable { times } if call <= times => {
                Err(PluginStatus::unavailable("cluster API is not reachable"))
            }
            Behavior::Unavailable { .. } => Ok(StageOutcome::success()),
        }
    }
}

impl LivestateService for KubePlugin {}

fn rollback_stage(index: u32) -> PlannedStage {
    PlannedStage {
        index,
        name: "K8S_ROLLBACK".into(),
        desc: "Rollback the deployment".into(),
        rollback: true,
        config: Default::default(),
    }
}

/// Owns WAIT_APPROVAL and reads approvals from the agent's stage command store
#[derive(Default)]
pub struct ApprovalPlugin {
    source: OnceLock<Arc<dyn StageCommandSource>>,
}

impl ApprovalPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect the plugin to where approvals are held
    pub fn connect(&self, source: Arc<dyn StageCommandSource>) {
        let _ = self.source.set(source);
    }
}

#[async_trait]
impl DeploymentService for ApprovalPlugin {
    async fn fetch_defined_stages(&self) -> PluginResult<FetchDefinedStagesResponse> {
        Ok(FetchDefinedStagesResponse {
            stages: vec![WAIT_APPROVAL.to_string()],
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
        let stages = req
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
        Ok(BuildStagesResponse { stages })
    }

    async fn build_quick_sync_stages(&self, _req: BuildQuickSyncStagesRequest) -> PluginResult<BuildStagesResponse> {
        Ok(BuildStagesResponse::default())
    }

    async fn execute_stage(
        &self,
        req: ExecuteStageRequest,
        events: StageEventSender,
        cancel: CancellationToken,
    ) -> PluginResult<StageOutcome> {
        let source = self
            .source
            .get()
            .ok_or_else(|| PluginStatus::unavailable("not connected to the agent"))?;
        let opts: WaitApprovalStageOptions = serde_json::from_slice(req.config.as_slice())
            .map_err(|e| PluginStatus::invalid_argument(e.to_string()))?;
        Ok(keel_plugin_sdk::wait_approval(
            source.as_ref(),
            &req.deployment_id,
            &req.stage_id,
            &opts,
            &events,
            &cancel,
            Duration::from_secs(10),
        )
        .await)
    }
}

impl LivestateService for ApprovalPlugin {}
