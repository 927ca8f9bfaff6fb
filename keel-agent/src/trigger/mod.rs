//! Trigger
//!
//! Turns new commits, user commands, chain activations and drift into
//! PENDING deployments. Nothing is written until the control plane accepts
//! `CreateDeployment`; the last-triggered commit only moves after that.

pub mod builder;
pub mod gates;

use chrono::Utc;
use keel_client::{ControlPlane, Retry};
use keel_core::domain::application::{Application, DeploymentReference};
use keel_core::domain::chain::{ChainNode, DeploymentChain};
use keel_core::domain::deployment::{Deployment, DeploymentStatus, SyncStrategy};
use keel_core::dto::application::{GetMostRecentDeployment, MostRecentKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::git::GitCommit;
use crate::reporter::Reporter;
use crate::spec_source::{ResolvedSpec, SpecSource};
use crate::store::{
    DataStore, DeploymentChainStore, DeploymentStore, DeploymentTraceStore, StoreError,
    TriggerStateStore,
};

use builder::DeploymentRequest;

/// Why a deployment is being created
#[derive(Debug, Clone)]
enum Origin {
    Commit,
    Command { commander: String },
    Chain { chain_id: String, block_index: u32 },
    OutOfSync { reason: String },
}

pub struct Trigger {
    control_plane: Arc<dyn ControlPlane>,
    specs: Arc<SpecSource>,
    deployments: Arc<DeploymentStore>,
    chains: DeploymentChainStore,
    traces: DeploymentTraceStore,
    state: TriggerStateStore,
    reporter: Reporter,
    intake: mpsc::Sender<Deployment>,
    retry: Retry,
    shutdown: CancellationToken,
}

impl Trigger {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        specs: Arc<SpecSource>,
        datastore: Arc<dyn DataStore>,
        reporter: Reporter,
        intake: mpsc::Sender<Deployment>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            control_plane,
            specs,
            deployments: Arc::clone(reporter.store()),
            chains: DeploymentChainStore::new(Arc::clone(&datastore)),
            traces: DeploymentTraceStore::new(Arc::clone(&datastore)),
            state: TriggerStateStore::new(datastore),
            reporter,
            intake,
            retry: Retry::control_plane(),
            shutdown,
        }
    }

    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    /// Scan for new commits every `interval` until shutdown
    pub async fn run(self: Arc<Self>, interval: Duration) {
        info!("Starting trigger (interval: {:?})", interval);
        let mut ticker = time::interval(interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.list_applications().await {
                Ok(apps) => {
                    let created = self.scan(&apps).await;
                    if created > 0 {
                        info!("Triggered {} deployment(s) this cycle", created);
                    }
                }
                Err(e) => error!("Failed to list applications: {}", e),
            }
        }
        info!("Trigger stopped");
    }

    pub async fn list_applications(&self) -> Result<Vec<Application>> {
        let cp = &self.control_plane;
        let apps = self
            .retry
            .run(&self.shutdown, |_| cp.list_applications())
            .await?;
        Ok(apps.into_iter().filter(|a| !a.disabled).collect())
    }

    pub async fn find_application(&self, application_id: &str) -> Result<Application> {
        self.list_applications()
            .await?
            .into_iter()
            .find(|a| a.id == application_id)
            .ok_or_else(|| AgentError::NotFound(format!("application {}", application_id)))
    }

    /// Evaluate the commit gates for every application once
    ///
    /// HEAD is fetched once per repository. Returns how many deployments were
    /// created.
    pub async fn scan(&self, apps: &[Application]) -> usize {
        let mut by_repo: BTreeMap<&str, Vec<&Application>> = BTreeMap::new();
        for app in apps {
            by_repo.entry(app.git_path.repo.id.as_str()).or_default().push(app);
        }

        let mut created = 0;
        for (repo_id, apps) in by_repo {
            let head = match self.head(apps[0]).await {
                Ok(head) => head,
                Err(e) => {
                    warn!(repository = repo_id, "Failed to fetch HEAD: {}", e);
                    continue;
                }
            };
            for app in apps {
                match self.on_commit(app, &head).await {
                    Ok(Some(d)) => {
                        info!(application_id = %app.id, deployment_id = %d.id, commit = %head.hash, "Triggered deployment for new commit");
                        created += 1;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(application_id = %app.id, "Failed to evaluate commit trigger: {}", e),
                }
            }
        }
        created
    }

    async fn head(&self, app: &Application) -> Result<GitCommit> {
        let repo = self.specs.repository(&app.git_path)?;
        self.specs.git().head(repo).await
    }

    async fn most_recent(&self, application_id: &str) -> Result<Option<DeploymentReference>> {
        let cp = &self.control_plane;
        let req = GetMostRecentDeployment {
            application_id: application_id.to_string(),
            kind: MostRecentKind::Any,
        };
        Ok(self
            .retry
            .run(&self.shutdown, |_| cp.get_application_most_recent_deployment(req.clone()))
            .await?)
    }

    async fn on_commit(&self, app: &Application, head: &GitCommit) -> Result<Option<Deployment>> {
        let last = match self.state.last_triggered(&app.id).await? {
            Some(commit) => Some(commit),
            None => match &app.most_recent_deployment {
                Some(r) => Some(r.commit_hash.clone()),
                None => self.most_recent(&app.id).await?.map(|r| r.commit_hash),
            },
        };
        if last.as_deref() == Some(head.hash.as_str()) {
            return Ok(None);
        }

        let resolved = self.specs.load(app, &head.hash).await?;
        let on_commit = &resolved.spec.trigger.on_commit;
        if on_commit.disabled {
            debug!(application_id = %app.id, "Commit trigger is disabled");
            self.state.set_last_triggered(&app.id, &head.hash, Utc::now()).await?;
            return Ok(None);
        }

        if let Some(last) = last.as_deref().filter(|c| !c.is_empty()) {
            let repo = self.specs.repository(&app.git_path)?;
            let changed = self.specs.git().changed_files(repo, last, &head.hash).await?;
            if !gates::touches_application(&app.git_path, on_commit, &changed)? {
                debug!(application_id = %app.id, commit = %head.hash, "No relevant changes");
                return Ok(None);
            }
        }

        let (strategy, summary) = gates::commit_strategy(&resolved.spec, &head.message)?;
        let d = self
            .create(app, head, &resolved, Origin::Commit, strategy, summary)
            .await?;
        self.state.set_last_triggered(&app.id, &head.hash, Utc::now()).await?;
        Ok(Some(d))
    }

    /// Trigger from a SYNC command; path filters do not apply
    pub async fn trigger_command(
        &self,
        application_id: &str,
        commander: &str,
        strategy: SyncStrategy,
    ) -> Result<Deployment> {
        let app = self.find_application(application_id).await?;
        let head = self.head(&app).await?;
        let resolved = self.specs.load(&app, &head.hash).await?;
        if resolved.spec.trigger.on_command.disabled {
            return Err(AgentError::FailedPrecondition(format!(
                "command trigger is disabled for application {}",
                app.id
            )));
        }
        let summary = match strategy {
            SyncStrategy::Auto => String::new(),
            _ => format!("Sync requested by {}", commander),
        };
        let origin = Origin::Command {
            commander: commander.to_string(),
        };
        let d = self
            .create(&app, &head, &resolved, origin, strategy, summary)
            .await?;
        self.state.set_last_triggered(&app.id, &head.hash, Utc::now()).await?;
        Ok(d)
    }

    /// Trigger an application as a node of a chain block
    pub async fn trigger_chain(
        &self,
        application_id: &str,
        chain_id: &str,
        block_index: u32,
    ) -> Result<Deployment> {
        let app = self.find_application(application_id).await?;
        self.trigger_chain_app(&app, chain_id, block_index).await
    }

    pub async fn trigger_chain_app(
        &self,
        app: &Application,
        chain_id: &str,
        block_index: u32,
    ) -> Result<Deployment> {
        let head = self.head(app).await?;
        let resolved = self.specs.load(app, &head.hash).await?;
        if resolved.spec.trigger.on_chain.disabled {
            return Err(AgentError::FailedPrecondition(format!(
                "chain trigger is disabled for application {}",
                app.id
            )));
        }
        let origin = Origin::Chain {
            chain_id: chain_id.to_string(),
            block_index,
        };
        self.create(app, &head, &resolved, origin, SyncStrategy::Auto, String::new())
            .await
    }

    /// Resync an application whose live state drifted from Git
    ///
    /// Returns `None` when the out-of-sync trigger is disabled, a deployment
    /// is still in progress, or the last one finished too recently.
    pub async fn trigger_out_of_sync(
        &self,
        app: &Application,
        reason: &str,
    ) -> Result<Option<Deployment>> {
        let head = self.head(app).await?;
        let resolved = self.specs.load(app, &head.hash).await?;
        let on_out_of_sync = &resolved.spec.trigger.on_out_of_sync;
        if on_out_of_sync.disabled {
            return Ok(None);
        }

        let local = self.deployments.list_by_application(&app.id).await?;
        if local.iter().any(|d| !d.is_terminal()) {
            debug!(application_id = %app.id, "Deployment in progress, skipping out-of-sync trigger");
            return Ok(None);
        }
        let most_recent = self.most_recent(&app.id).await?;
        if !gates::out_of_sync_window_passed(most_recent.as_ref(), on_out_of_sync.min_window, Utc::now()) {
            debug!(application_id = %app.id, "Out-of-sync trigger within minimum window");
            return Ok(None);
        }

        let origin = Origin::OutOfSync {
            reason: reason.to_string(),
        };
        let summary = format!("Resync because the application is out of sync: {}", reason);
        let d = self
            .create(app, &head, &resolved, origin, SyncStrategy::Auto, summary)
            .await?;
        Ok(Some(d))
    }

    async fn create(
        &self,
        app: &Application,
        head: &GitCommit,
        resolved: &ResolvedSpec,
        origin: Origin,
        strategy: SyncStrategy,
        strategy_summary: String,
    ) -> Result<Deployment> {
        let now = Utc::now();
        let chain_matchers = match origin {
            Origin::Commit => resolved.spec.chain_matchers(),
            _ => None,
        };
        let chain = match (&origin, chain_matchers) {
            (Origin::Chain { chain_id, block_index }, _) => Some((chain_id.clone(), *block_index)),
            (_, Some(_)) => Some((Uuid::new_v4().to_string(), 0)),
            _ => None,
        };
        let commander = match &origin {
            Origin::Command { commander } => commander.as_str(),
            _ => "",
        };

        let deployment = builder::build_deployment(DeploymentRequest {
            app,
            commit: head,
            commander,
            strategy,
            strategy_summary,
            notification: resolved.spec.notification.as_ref(),
            chain,
            now,
        })?;

        let cp = &self.control_plane;
        self.retry
            .run(&self.shutdown, |_| cp.create_deployment(&deployment))
            .await?;
        self.deployments.add(&deployment).await?;

        if let (Some(matchers), Some(chain_id)) = (chain_matchers, &deployment.deployment_chain_id) {
            let origin_node = ChainNode {
                application_id: app.id.clone(),
                application_name: app.name.clone(),
                deployment_id: Some(deployment.id.clone()),
                status: Some(DeploymentStatus::Pending),
            };
            let chain =
                DeploymentChain::new(chain_id, &app.project_id, origin_node, matchers.to_vec(), now);
            if let Err(e) = self.chains.add(&chain).await {
                warn!(deployment_id = %deployment.id, chain_id = %chain_id, "Failed to store deployment chain: {}", e);
            }
        }

        if let Some(trace) = builder::build_trace(&deployment) {
            match self.traces.add(trace, now).await {
                Ok(_) | Err(StoreError::AlreadyExists { .. }) => {}
                Err(e) => warn!(deployment_id = %deployment.id, "Failed to store deployment trace: {}", e),
            }
        }

        if let Origin::OutOfSync { reason } = &origin {
            info!(application_id = %app.id, deployment_id = %deployment.id, "Triggered out-of-sync deployment: {}", reason);
        }

        self.reporter.created(&deployment).await;
        if self.intake.send(deployment.clone()).await.is_err() {
            warn!(deployment_id = %deployment.id, "Controller is gone, deployment stays PENDING until restart");
        }
        Ok(deployment)
    }
}
