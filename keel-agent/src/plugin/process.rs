//! Plugin child-process supervision
//!
//! Each configured plugin runs as a child process. The agent hands it a name,
//! a random secret and the callback URL through the environment, then waits
//! for the `KEEL_PLUGIN_READY <addr>` line. A supervisor task watches the
//! child and its `/healthz` endpoint; on exit or a failed probe it fails every
//! in-flight stage with "plugin crashed" and restarts the child with
//! exponential backoff. Callers see `Unavailable` while it is down.

use async_trait::async_trait;
use keel_core::Code;
use keel_core::plugin::*;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::remote::RemotePlugin;
use crate::config::PluginConfig;
use crate::error::{AgentError, Result};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// How long a broken stage stream waits for the supervisor to confirm a crash
const CRASH_SETTLE: Duration = Duration::from_millis(500);

pub const PLUGIN_CRASHED: &str = "plugin crashed";

struct Running {
    child: Child,
    remote: RemotePlugin,
}

struct Slot {
    remote: Option<RemotePlugin>,
    /// Fired when the current incarnation dies
    crashed: CancellationToken,
}

/// A supervised plugin process
pub struct ProcessPlugin {
    config: PluginConfig,
    secret: String,
    callback_url: String,
    slot: RwLock<Slot>,
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

impl ProcessPlugin {
    /// Launch the plugin and start supervising it. Fails if the first launch
    /// does not complete the handshake.
    pub async fn spawn(
        config: PluginConfig,
        callback_url: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>> {
        let plugin = Arc::new(Self {
            secret: generate_secret(),
            callback_url: callback_url.into(),
            slot: RwLock::new(Slot {
                remote: None,
                crashed: CancellationToken::new(),
            }),
            config,
        });

        let running = plugin.launch().await?;
        plugin.install(running.remote.clone());
        info!(plugin = %plugin.config.name, "Plugin started");

        tokio::spawn(Arc::clone(&plugin).supervise(running, shutdown));
        Ok(plugin)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Secret the plugin presents on agent callbacks
    pub fn secret(&self) -> &str {
        &self.secret
    }

    async fn launch(&self) -> Result<Running> {
        let name = &self.config.name;
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .envs(&self.config.env)
            .env(wire::ENV_PLUGIN_NAME, name)
            .env(wire::ENV_PLUGIN_SECRET, &self.secret)
            .env(wire::ENV_CALLBACK_URL, &self.callback_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                AgentError::Internal(format!(
                    "failed to start plugin {} ({}): {}",
                    name,
                    self.config.command.display(),
                    e
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Internal(format!("plugin {} has no stdout", name)))?;
        let mut lines = BufReader::new(stdout).lines();

        let handshake = time::timeout(HANDSHAKE_TIMEOUT, async {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(addr) = wire::parse_ready_line(&line) {
                    return Some(addr);
                }
                debug!(plugin = %name, "{}", line);
            }
            None
        })
        .await;

        let addr = match handshake {
            Ok(Some(addr)) => addr,
            Ok(None) => {
                let _ = child.kill().await;
                return Err(AgentError::Internal(format!(
                    "plugin {} exited before announcing its address",
                    name
                )));
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(AgentError::Internal(format!(
                    "plugin {} did not announce its address within {:?}",
                    name, HANDSHAKE_TIMEOUT
                )));
            }
        };

        // Keep draining stdout so the child never blocks on a full pipe
        let plugin = name.clone();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(plugin = %plugin, "{}", line);
            }
        });

        info!(plugin = %name, %addr, "Plugin handshake completed");
        Ok(Running {
            child,
            remote: RemotePlugin::new(name.clone(), addr, self.secret.clone()),
        })
    }

    fn install(&self, remote: RemotePlugin) {
        if let Ok(mut slot) = self.slot.write() {
            slot.remote = Some(remote);
            slot.crashed = CancellationToken::new();
        }
    }

    fn mark_crashed(&self) {
        if let Ok(mut slot) = self.slot.write() {
            slot.remote = None;
            slot.crashed.cancel();
        }
    }

    fn current(&self) -> PluginResult<(RemotePlugin, CancellationToken)> {
        let slot = self
            .slot
            .read()
            .map_err(|_| PluginStatus::internal("plugin slot lock poisoned"))?;
        match &slot.remote {
            Some(remote) => Ok((remote.clone(), slot.crashed.clone())),
            None => Err(PluginStatus::unavailable(format!(
                "plugin {} is restarting",
                self.config.name
            ))),
        }
    }

    async fn supervise(self: Arc<Self>, mut running: Running, shutdown: CancellationToken) {
        let name = self.config.name.clone();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let started = Instant::now();
            let Some(reason) = Self::watch(&mut running, &shutdown).await else {
                info!(plugin = %name, "Stopping plugin");
                let _ = running.child.kill().await;
                self.mark_crashed();
                return;
            };

            error!(plugin = %name, reason = %reason, "Plugin crashed");
            self.mark_crashed();
            let _ = running.child.kill().await;
            if started.elapsed() > MAX_BACKOFF {
                backoff = INITIAL_BACKOFF;
            }

            running = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                match self.launch().await {
                    Ok(running) => break running,
                    Err(e) => warn!(plugin = %name, error = %e, "Plugin restart failed"),
                }
            };
            self.install(running.remote.clone());
            info!(plugin = %name, "Plugin restarted");
        }
    }

    /// Wait for the child to die or stop answering; `None` on shutdown
    async fn watch(running: &mut Running, shutdown: &CancellationToken) -> Option<String> {
        let mut ticker = time::interval(HEALTH_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                status = running.child.wait() => {
                    return Some(match status {
                        Ok(status) => format!("process exited ({})", status),
                        Err(e) => format!("failed to wait on process: {}", e),
                    });
                }
                _ = ticker.tick() => {
                    if !running.remote.healthz(HEALTH_TIMEOUT).await {
                        return Some("health check failed".to_string());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DeploymentService for ProcessPlugin {
    async fn fetch_defined_stages(&self) -> PluginResult<FetchDefinedStagesResponse> {
        self.current()?.0.fetch_defined_stages().await
    }

    async fn determine_versions(
        &self,
        req: DetermineVersionsRequest,
    ) -> PluginResult<DetermineVersionsResponse> {
        self.current()?.0.determine_versions(req).await
    }

    async fn determine_strategy(
        &self,
        req: DetermineStrategyRequest,
    ) -> PluginResult<DetermineStrategyResponse> {
        self.current()?.0.determine_strategy(req).await
    }

    async fn build_pipeline_sync_stages(
        &self,
        req: BuildPipelineSyncStagesRequest,
    ) -> PluginResult<BuildStagesResponse> {
        self.current()?.0.build_pipeline_sync_stages(req).await
    }

    async fn build_quick_sync_stages(
        &self,
        req: BuildQuickSyncStagesRequest,
    ) -> PluginResult<BuildStagesResponse> {
        self.current()?.0.build_quick_sync_stages(req).await
    }

    async fn execute_stage(
        &self,
        req: ExecuteStageRequest,
        events: StageEventSender,
        cancel: CancellationToken,
    ) -> PluginResult<StageOutcome> {
        let (remote, crashed) = self.current()?;
        tokio::select! {
            result = remote.execute_stage(req, events, cancel) => match result {
                Err(status) if status.code == Code::Unavailable => {
                    // The stream usually breaks just before the supervisor notices
                    if time::timeout(CRASH_SETTLE, crashed.cancelled()).await.is_ok() {
                        Ok(StageOutcome::failure(PLUGIN_CRASHED))
                    } else {
                        Err(status)
                    }
                }
                other => other,
            },
            _ = crashed.cancelled() => Ok(StageOutcome::failure(PLUGIN_CRASHED)),
        }
    }
}

#[async_trait]
impl LivestateService for ProcessPlugin {
    async fn get_livestate(&self, req: GetLivestateRequest) -> PluginResult<GetLivestateResponse> {
        self.current()?.0.get_livestate(req).await
    }
}
