//! Common test utilities for agent integration tests.

pub mod fixtures;

use async_trait::async_trait;
use keel_agent::config::{Config, RepositoryConfig};
use keel_agent::git::{GitClient, GitCommit};
use keel_agent::notifier::Notifier;
use keel_agent::plugin::PluginRegistry;
use keel_agent::store::{DataStore, MemoryDataStore};
use keel_agent::{Agent, AgentError, AgentParts};
use keel_client::{ControlPlane, Retry};
use keel_core::domain::application::{Application, DeploymentReference};
use keel_core::domain::command::Command;
use keel_core::domain::deployment::{Deployment, DeploymentStatus};
use keel_core::domain::stage::StageStatus;
use keel_core::dto::application::{GetMostRecentDeployment, MostRecentDeployment, MostRecentKind};
use keel_core::dto::command::CommandHandled;
use keel_core::dto::deployment::{
    DeploymentCompleted, DeploymentMetadata, DeploymentPlanned, DeploymentStatusChanged,
    StageLogs, StageMetadata, StageStatusChanged,
};
use keel_core::plugin::Plugin;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const REPO_ID: &str = "repo";

/// Control plane kept in memory; records every report it receives.
#[derive(Default)]
pub struct FakeControlPlane {
    pub applications: Mutex<Vec<Application>>,
    pub commands: Mutex<Vec<Command>>,
    pub created: Mutex<Vec<Deployment>>,
    pub statuses: Mutex<Vec<DeploymentStatusChanged>>,
    pub stages: Mutex<Vec<StageStatusChanged>>,
    pub stage_metadata: Mutex<Vec<StageMetadata>>,
    pub handled: Mutex<Vec<CommandHandled>>,
    pub not_completed: Mutex<Vec<Deployment>>,
    most_recent: Mutex<HashMap<(String, bool), DeploymentReference>>,
}

impl FakeControlPlane {
    pub fn with_applications(apps: Vec<Application>) -> Self {
        let cp = Self::default();
        *cp.applications.lock().unwrap() = apps;
        cp
    }

    pub fn push_command(&self, command: Command) {
        self.commands.lock().unwrap().push(command);
    }

    pub fn created_for(&self, application_id: &str) -> Vec<Deployment> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.application_id == application_id)
            .cloned()
            .collect()
    }

    pub fn statuses_of(&self, deployment_id: &str) -> Vec<DeploymentStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.deployment_id == deployment_id)
            .map(|s| s.status)
            .collect()
    }

    /// Last reported status and reason
    pub fn last_status(&self, deployment_id: &str) -> Option<(DeploymentStatus, String)> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| s.deployment_id == deployment_id)
            .map(|s| (s.status, s.status_reason.clone()))
    }

    /// Every status a stage went through, in order
    pub fn stage_history(&self, deployment_id: &str, stage_id: &str) -> Vec<StageStatus> {
        self.stages
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.deployment_id == deployment_id && s.stage_id == stage_id)
            .map(|s| s.status)
            .collect()
    }

    /// Stage IDs in the order they first started running
    pub fn started_stages(&self, deployment_id: &str) -> Vec<String> {
        let mut started: Vec<String> = Vec::new();
        for s in self.stages.lock().unwrap().iter() {
            if s.deployment_id == deployment_id
                && s.status == StageStatus::Running
                && !started.contains(&s.stage_id)
            {
                started.push(s.stage_id.clone());
            }
        }
        started
    }

    pub fn most_recent(&self, application_id: &str, successful: bool) -> Option<DeploymentReference> {
        self.most_recent
            .lock()
            .unwrap()
            .get(&(application_id.to_string(), successful))
            .cloned()
    }

    pub fn handled(&self, command_id: &str) -> Option<CommandHandled> {
        self.handled
            .lock()
            .unwrap()
            .iter()
            .find(|h| h.command_id == command_id)
            .cloned()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn create_deployment(&self, deployment: &Deployment) -> keel_client::Result<()> {
        self.created.lock().unwrap().push(deployment.clone());
        Ok(())
    }

    async fn report_deployment_planned(&self, _req: DeploymentPlanned) -> keel_client::Result<()> {
        Ok(())
    }

    async fn report_deployment_status_changed(&self, req: DeploymentStatusChanged) -> keel_client::Result<()> {
        self.statuses.lock().unwrap().push(req);
        Ok(())
    }

    async fn report_stage_status_changed(&self, req: StageStatusChanged) -> keel_client::Result<()> {
        self.stages.lock().unwrap().push(req);
        Ok(())
    }

    async fn report_deployment_completed(&self, _req: DeploymentCompleted) -> keel_client::Result<()> {
        Ok(())
    }

    async fn report_application_most_recent_deployment(
        &self,
        req: MostRecentDeployment,
    ) -> keel_client::Result<()> {
        let successful = req.kind == MostRecentKind::Successful;
        self.most_recent
            .lock()
            .unwrap()
            .insert((req.application_id, successful), req.deployment);
        Ok(())
    }

    async fn get_application_most_recent_deployment(
        &self,
        req: GetMostRecentDeployment,
    ) -> keel_client::Result<Option<DeploymentReference>> {
        let successful = req.kind == MostRecentKind::Successful;
        Ok(self.most_recent(&req.application_id, successful))
    }

    async fn list_applications(&self) -> keel_client::Result<Vec<Application>> {
        Ok(self.applications.lock().unwrap().clone())
    }

    async fn save_stage_metadata(&self, req: StageMetadata) -> keel_client::Result<()> {
        self.stage_metadata.lock().unwrap().push(req);
        Ok(())
    }

    async fn save_deployment_metadata(&self, _req: DeploymentMetadata) -> keel_client::Result<()> {
        Ok(())
    }

    async fn list_not_completed_deployments(&self) -> keel_client::Result<Vec<Deployment>> {
        Ok(self.not_completed.lock().unwrap().clone())
    }

    async fn list_unhandled_commands(&self) -> keel_client::Result<Vec<Command>> {
        let handled: Vec<String> = self
            .handled
            .lock()
            .unwrap()
            .iter()
            .map(|h| h.command_id.clone())
            .collect();
        Ok(self
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !handled.contains(&c.id))
            .cloned()
            .collect())
    }

    async fn report_command_handled(&self, req: CommandHandled) -> keel_client::Result<()> {
        self.handled.lock().unwrap().push(req);
        Ok(())
    }

    async fn report_stage_logs(&self, _req: StageLogs) -> keel_client::Result<()> {
        Ok(())
    }
}

/// A linear history on a single branch. Every file exists at every commit.
#[derive(Default)]
pub struct FakeGit {
    files: Mutex<HashMap<String, Vec<u8>>>,
    history: Mutex<Vec<(GitCommit, Vec<String>)>>,
}

impl FakeGit {
    pub fn write(&self, path: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.as_bytes().to_vec());
    }

    /// Append a commit touching `changed` and make it HEAD
    pub fn commit(&self, hash: &str, message: &str, changed: &[&str]) {
        let commit = GitCommit {
            hash: hash.to_string(),
            author: "dev".to_string(),
            timestamp: 1_700_000_000,
            message: message.to_string(),
        };
        self.history
            .lock()
            .unwrap()
            .push((commit, changed.iter().map(|f| f.to_string()).collect()));
    }
}

#[async_trait]
impl GitClient for FakeGit {
    async fn head(&self, _repo: &RepositoryConfig) -> keel_agent::Result<GitCommit> {
        self.history
            .lock()
            .unwrap()
            .last()
            .map(|(c, _)| c.clone())
            .ok_or_else(|| AgentError::Git("empty repository".into()))
    }

    async fn changed_files(
        &self,
        _repo: &RepositoryConfig,
        from: &str,
        to: &str,
    ) -> keel_agent::Result<Vec<String>> {
        let history = self.history.lock().unwrap();
        let start = history.iter().position(|(c, _)| c.hash == from);
        let end = history
            .iter()
            .position(|(c, _)| c.hash == to)
            .ok_or_else(|| AgentError::Git(format!("unknown commit {}", to)))?;
        let first = start.map_or(0, |i| i + 1);
        let mut files: Vec<String> = Vec::new();
        for (_, changed) in history.iter().take(end + 1).skip(first) {
            for f in changed {
                if !files.contains(f) {
                    files.push(f.clone());
                }
            }
        }
        Ok(files)
    }

    async fn read_file(
        &self,
        _repo: &RepositoryConfig,
        _commit: &str,
        path: &str,
    ) -> keel_agent::Result<Option<Vec<u8>>> {
        Ok(self.files.lock().unwrap().get(path).cloned())
    }
}

/// A fully wired agent over fakes. Background loops are not started; tests
/// drive the trigger and command intake by hand.
pub struct TestAgent {
    pub agent: Agent,
    pub control_plane: Arc<FakeControlPlane>,
    pub git: Arc<FakeGit>,
    pub datastore: Arc<dyn DataStore>,
    pub shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl TestAgent {
    pub async fn start(
        control_plane: Arc<FakeControlPlane>,
        git: Arc<FakeGit>,
        plugins: Vec<(&str, Arc<dyn Plugin>)>,
    ) -> Self {
        let mut registry = PluginRegistry::new();
        for (name, plugin) in plugins {
            registry.register(name, plugin).unwrap();
        }
        registry.load_stages().await.unwrap();

        let mut config = Config::new("piped-1".into(), "proj".into(), "http://localhost:9080".into());
        config.repositories.push(RepositoryConfig {
            id: REPO_ID.into(),
            remote: "https://github.com/org/repo.git".into(),
            branch: "main".into(),
            path: "/tmp/repo".into(),
        });
        config.log_send_interval = Duration::from_secs(1);

        let datastore: Arc<dyn DataStore> = Arc::new(MemoryDataStore::new());
        let shutdown = CancellationToken::new();
        let retry = Retry::new(3)
            .with_initial_delay(Duration::from_millis(10))
            .without_jitter();
        let mut agent = Agent::with_retry(
            config,
            AgentParts {
                control_plane: Arc::clone(&control_plane) as Arc<dyn ControlPlane>,
                git: Arc::clone(&git) as Arc<dyn GitClient>,
                registry: Arc::new(registry),
                datastore: Arc::clone(&datastore),
                notifier: Notifier::disabled(),
            },
            retry,
            shutdown.clone(),
        );
        let handles = agent.start();

        Self {
            agent,
            control_plane,
            git,
            datastore,
            shutdown,
            handles,
        }
    }

    /// Run one trigger scan over the given applications
    pub async fn scan(&self, apps: &[Application]) -> usize {
        self.agent.trigger().scan(apps).await
    }

    /// Wait for the deployment to report a terminal status
    pub async fn wait_terminal(&self, deployment_id: &str) -> (DeploymentStatus, String) {
        let cp = Arc::clone(&self.control_plane);
        tokio::time::timeout(Duration::from_secs(12 * 3600), async move {
            loop {
                if let Some((status, reason)) = cp.last_status(deployment_id) {
                    if status.is_terminal() {
                        return (status, reason);
                    }
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("deployment did not finish")
    }

    /// Wait until a stage reports the given status
    pub async fn wait_stage(&self, deployment_id: &str, stage_id: &str, status: StageStatus) {
        let cp = Arc::clone(&self.control_plane);
        tokio::time::timeout(Duration::from_secs(12 * 3600), async move {
            while !cp.stage_history(deployment_id, stage_id).contains(&status) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("stage did not reach the expected status");
    }

    /// Wait until the control plane has seen `n` deployments for an application
    pub async fn wait_created(&self, application_id: &str, n: usize) -> Vec<Deployment> {
        let cp = Arc::clone(&self.control_plane);
        tokio::time::timeout(Duration::from_secs(3600), async move {
            loop {
                let created = cp.created_for(application_id);
                if created.len() >= n {
                    return created;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .expect("deployment was not created")
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        drop(self.agent);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
