//! Agent wiring
//!
//! Builds every component from the configuration and runs the background
//! loops until shutdown:
//! - trigger: scans Git for new commits
//! - controller: plans and executes deployments
//! - command intake: handles user commands
//! - chain controller: advances deployment chains
//! - drift watcher: resyncs applications whose live state drifted

use anyhow::{Context, Result};
use keel_client::{ControlPlane, ControlPlaneClient, Retry};
use keel_core::domain::deployment::Deployment;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::callback::{self, StageCommandStore};
use crate::chain::ChainController;
use crate::commands::CommandIntake;
use crate::config::Config;
use crate::controller::Controller;
use crate::drift::DriftWatcher;
use crate::executor::Executor;
use crate::git::{GitCli, GitClient};
use crate::notifier::{Notifier, Route};
use crate::planner::PlannerCoordinator;
use crate::plugin::{PluginRegistry, ProcessPlugin};
use crate::reporter::Reporter;
use crate::spec_source::SpecSource;
use crate::store::{DataStore, DeploymentStore, MemoryDataStore, PostgresDataStore};
use crate::trigger::Trigger;

const INTAKE_CAPACITY: usize = 64;
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// External collaborators the agent is built from
pub struct AgentParts {
    pub control_plane: Arc<dyn ControlPlane>,
    pub git: Arc<dyn GitClient>,
    /// Plugins registered and with their stages loaded
    pub registry: Arc<PluginRegistry>,
    pub datastore: Arc<dyn DataStore>,
    pub notifier: Notifier,
}

pub struct Agent {
    config: Config,
    control_plane: Arc<dyn ControlPlane>,
    deployments: Arc<DeploymentStore>,
    trigger: Arc<Trigger>,
    controller: Controller,
    chains: Arc<ChainController>,
    commands: Arc<CommandIntake>,
    drift: Arc<DriftWatcher>,
    stage_commands: Arc<StageCommandStore>,
    intake: Option<mpsc::Receiver<Deployment>>,
    completions: Option<mpsc::Receiver<Deployment>>,
    retry: Retry,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn from_parts(config: Config, parts: AgentParts, shutdown: CancellationToken) -> Self {
        Self::with_retry(config, parts, Retry::control_plane(), shutdown)
    }

    /// Like [`Agent::from_parts`] with a custom control-plane retry envelope
    pub fn with_retry(config: Config, parts: AgentParts, retry: Retry, shutdown: CancellationToken) -> Self {
        let AgentParts {
            control_plane,
            git,
            registry,
            datastore,
            notifier,
        } = parts;

        let deployments = Arc::new(DeploymentStore::new(Arc::clone(&datastore)));
        let specs = Arc::new(SpecSource::new(git, &config.repositories));
        let reporter = Reporter::new(
            Arc::clone(&control_plane),
            Arc::clone(&deployments),
            notifier.clone(),
            shutdown.clone(),
        )
        .with_retry(retry);

        let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);
        let (completions_tx, completions_rx) = mpsc::channel(INTAKE_CAPACITY);

        let trigger = Arc::new(
            Trigger::new(
                Arc::clone(&control_plane),
                Arc::clone(&specs),
                Arc::clone(&datastore),
                reporter.clone(),
                intake_tx,
                shutdown.clone(),
            )
            .with_retry(retry),
        );

        let executor = Executor::new(Arc::clone(&registry), reporter.clone(), shutdown.clone())
            .with_log_send_interval(config.log_send_interval)
            .with_cancel_grace(config.cancel_grace);
        let controller = Controller::builder(
            Arc::clone(&control_plane),
            Arc::clone(&specs),
            PlannerCoordinator::new(Arc::clone(&registry)),
            executor,
            reporter,
            shutdown.clone(),
        )
        .max_parallel(config.max_parallel_deployments)
        .completions(completions_tx)
        .retry(retry)
        .build();

        let chains = Arc::new(ChainController::new(
            Arc::clone(&trigger),
            datastore,
            Arc::clone(&deployments),
            shutdown.clone(),
        ));
        let stage_commands = Arc::new(StageCommandStore::new());
        let commands = Arc::new(
            CommandIntake::new(
                Arc::clone(&control_plane),
                Arc::clone(&trigger),
                controller.clone(),
                Arc::clone(&stage_commands),
                Arc::clone(&deployments),
                notifier,
                shutdown.clone(),
            )
            .with_retry(retry),
        );
        let drift = Arc::new(DriftWatcher::new(
            config.piped_id.clone(),
            Arc::clone(&trigger),
            specs,
            registry,
            shutdown.clone(),
        ));

        Self {
            config,
            control_plane,
            deployments,
            trigger,
            controller,
            chains,
            commands,
            drift,
            stage_commands,
            intake: Some(intake_rx),
            completions: Some(completions_rx),
            retry,
            shutdown,
        }
    }

    pub fn trigger(&self) -> &Arc<Trigger> {
        &self.trigger
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn commands(&self) -> &Arc<CommandIntake> {
        &self.commands
    }

    pub fn chains(&self) -> &Arc<ChainController> {
        &self.chains
    }

    pub fn drift(&self) -> &Arc<DriftWatcher> {
        &self.drift
    }

    pub fn stage_commands(&self) -> &Arc<StageCommandStore> {
        &self.stage_commands
    }

    pub fn deployments(&self) -> &Arc<DeploymentStore> {
        &self.deployments
    }

    /// Resume deployments a previous run left unfinished
    ///
    /// The control plane's view wins; deployments only known locally are
    /// resumed too.
    pub async fn recover(&self) -> Result<usize> {
        let cp = &self.control_plane;
        let remote = self
            .retry
            .run(&self.shutdown, |_| cp.list_not_completed_deployments())
            .await
            .context("Failed to list unfinished deployments")?;
        let local = self
            .deployments
            .list_not_completed()
            .await
            .context("Failed to read local deployments")?;

        let mut by_id: HashMap<String, Deployment> = local.into_iter().map(|d| (d.id.clone(), d)).collect();
        for d in remote {
            if !by_id.contains_key(&d.id) {
                if let Err(e) = self.deployments.add(&d).await {
                    warn!(deployment_id = %d.id, "Failed to store recovered deployment: {}", e);
                }
            }
            by_id.insert(d.id.clone(), d);
        }
        let mut pending: Vec<Deployment> = by_id.into_values().collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let count = pending.len();
        self.controller.recover(pending).await;
        Ok(count)
    }

    /// Start the tasks that react to new and finished deployments
    ///
    /// Idempotent; later calls start nothing.
    pub fn start(&mut self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(rx) = self.intake.take() {
            let controller = self.controller.clone();
            handles.push(tokio::spawn(async move { controller.run_intake(rx).await }));
        }
        if let Some(mut rx) = self.completions.take() {
            let chains = Arc::clone(&self.chains);
            let stage_commands = Arc::clone(&self.stage_commands);
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    // Finish what already arrived before honouring shutdown
                    let d = tokio::select! {
                        biased;
                        next = rx.recv() => match next {
                            Some(d) => d,
                            None => break,
                        },
                        _ = shutdown.cancelled() => break,
                    };
                    stage_commands.forget(&d.id);
                    if let Err(e) = chains.on_finished(&d).await {
                        warn!(deployment_id = %d.id, "Failed to advance deployment chain: {}", e);
                    }
                }
                debug!("Completion handler stopped");
            }));
        }
        handles
    }

    /// Run every loop until shutdown
    pub async fn run(mut self) -> Result<()> {
        let mut handles = self.start();
        match self.recover().await {
            Ok(0) => {}
            Ok(n) => info!("Recovered {} unfinished deployment(s)", n),
            Err(e) => warn!("Recovery skipped: {:#}", e),
        }

        handles.push(tokio::spawn(Arc::clone(&self.trigger).run(self.config.sync_interval)));
        handles.push(tokio::spawn(Arc::clone(&self.commands).run(self.config.command_poll_interval)));
        handles.push(tokio::spawn(Arc::clone(&self.chains).run(self.config.sync_interval)));
        handles.push(tokio::spawn(Arc::clone(&self.drift).run(self.config.drift_interval)));
        info!(piped_id = %self.config.piped_id, "Agent running");

        self.shutdown.cancelled().await;
        info!("Shutting down");
        drop(self);
        for handle in handles {
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                warn!("A background task did not stop in time");
            }
        }
        Ok(())
    }
}

/// Build the production agent from `config` and run it until `shutdown`
pub async fn run(config: Config, shutdown: CancellationToken) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    let datastore: Arc<dyn DataStore> = match &config.datastore_url {
        Some(url) => Arc::new(
            PostgresDataStore::connect(url)
                .await
                .context("Failed to connect to the datastore")?,
        ),
        None => {
            info!("No datastore configured, keeping state in memory");
            Arc::new(MemoryDataStore::new())
        }
    };

    let listener = TcpListener::bind(config.callback_socket_addr()?)
        .await
        .with_context(|| format!("Failed to bind callback address {}", config.callback_addr))?;
    let callback_url = format!("http://{}", listener.local_addr()?);

    let mut registry = PluginRegistry::new();
    let mut secrets = BTreeMap::new();
    for plugin_config in &config.plugins {
        let plugin = ProcessPlugin::spawn(plugin_config.clone(), &callback_url, shutdown.clone())
            .await
            .with_context(|| format!("Failed to start plugin {}", plugin_config.name))?;
        secrets.insert(plugin.name().to_string(), plugin.secret().to_string());
        registry.register(plugin.name().to_string(), plugin)?;
    }
    registry
        .load_stages()
        .await
        .context("Failed to load plugin stages")?;
    info!("Loaded {} plugin(s)", registry.len());

    let routes = config
        .notifications
        .receivers
        .iter()
        .cloned()
        .map(Route::from_receiver)
        .collect();
    let (notifier, notifier_task) = Notifier::start(routes, shutdown.clone());

    let control_plane: Arc<dyn ControlPlane> = Arc::new(ControlPlaneClient::new(
        &config.control_plane_url,
        &config.piped_id,
        &config.api_key,
    ));
    let agent = Agent::from_parts(
        config,
        AgentParts {
            control_plane,
            git: Arc::new(GitCli::new()),
            registry: Arc::new(registry),
            datastore,
            notifier,
        },
        shutdown.clone(),
    );

    let router = callback::router(Arc::clone(agent.stage_commands()), secrets);
    let server = tokio::spawn(callback::serve(listener, router, shutdown.clone()));

    agent.run().await?;

    match server.await {
        Ok(Err(e)) => warn!("Callback API stopped with an error: {}", e),
        Err(e) => warn!("Callback API task failed: {}", e),
        Ok(Ok(())) => {}
    }
    let _ = notifier_task.await;
    info!("Agent stopped");
    Ok(())
}
