//! Drift watcher
//!
//! Periodically asks every plugin whether the live state of each application
//! still matches what was last deployed from Git. An application reported
//! OUT_OF_SYNC becomes an out-of-sync trigger candidate.

use keel_core::Code;
use keel_core::domain::application::Application;
use keel_core::plugin::{GetLivestateRequest, SyncState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, Result};
use crate::plugin::PluginRegistry;
use crate::spec_source::SpecSource;
use crate::trigger::Trigger;

const LIVESTATE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct DriftWatcher {
    piped_id: String,
    trigger: Arc<Trigger>,
    specs: Arc<SpecSource>,
    registry: Arc<PluginRegistry>,
    shutdown: CancellationToken,
}

impl DriftWatcher {
    pub fn new(
        piped_id: impl Into<String>,
        trigger: Arc<Trigger>,
        specs: Arc<SpecSource>,
        registry: Arc<PluginRegistry>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            piped_id: piped_id.into(),
            trigger,
            specs,
            registry,
            shutdown,
        }
    }

    pub async fn run(self: Arc<Self>, interval: Duration) {
        info!("Starting drift watcher (interval: {:?})", interval);
        let mut ticker = time::interval(interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.trigger.list_applications().await {
                Ok(apps) => {
                    let triggered = self.check(&apps).await;
                    if triggered > 0 {
                        info!("Triggered {} out-of-sync deployment(s)", triggered);
                    }
                }
                Err(e) => error!("Failed to list applications: {}", e),
            }
        }
        info!("Drift watcher stopped");
    }

    /// Check every application once; returns how many resyncs were triggered
    pub async fn check(&self, apps: &[Application]) -> usize {
        let mut triggered = 0;
        for app in apps {
            let reason = match self.out_of_sync_reason(app).await {
                Ok(Some(reason)) => reason,
                Ok(None) => continue,
                Err(e) => {
                    warn!(application_id = %app.id, "Failed to check live state: {}", e);
                    continue;
                }
            };
            match self.trigger.trigger_out_of_sync(app, &reason).await {
                Ok(Some(_)) => triggered += 1,
                Ok(None) => {}
                Err(e) => warn!(application_id = %app.id, "Failed to trigger resync: {}", e),
            }
        }
        triggered
    }

    /// `Some(reason)` when any plugin sees the application out of sync
    async fn out_of_sync_reason(&self, app: &Application) -> Result<Option<String>> {
        if app.deploy_targets_by_plugin.is_empty() {
            return Ok(None);
        }
        let Some(running) = &app.most_recent_successful_deployment else {
            debug!(application_id = %app.id, "Nothing deployed yet, skipping drift check");
            return Ok(None);
        };

        let resolved = self.specs.load(app, &running.commit_hash).await?;
        let ignore_fields = resolved
            .spec
            .drift_detection
            .as_ref()
            .map(|d| d.ignore_fields.clone())
            .unwrap_or_default();

        let mut reasons = Vec::new();
        for name in app.plugin_names() {
            let plugin = self.registry.get(name)?;
            let req = GetLivestateRequest {
                piped_id: self.piped_id.clone(),
                application_id: app.id.clone(),
                deploy_targets: app.deploy_targets(name).to_vec(),
                input: resolved.input.clone(),
                ignore_fields: ignore_fields.clone(),
            };
            let reply = match time::timeout(LIVESTATE_TIMEOUT, plugin.get_livestate(req)).await {
                Ok(reply) => reply,
                Err(_) => {
                    warn!(application_id = %app.id, plugin = %name, "Live state request timed out");
                    continue;
                }
            };
            match reply {
                Ok(resp) if resp.sync_state == SyncState::OutOfSync => {
                    let reason = if resp.reason.is_empty() {
                        format!("{} reports drift", name)
                    } else {
                        resp.reason
                    };
                    reasons.push(reason);
                }
                Ok(resp) => {
                    debug!(application_id = %app.id, plugin = %name, state = ?resp.sync_state, "Live state checked");
                }
                Err(status) if status.code == Code::Unimplemented => {
                    debug!(plugin = %name, "Plugin does not report live state");
                }
                Err(status) => return Err(AgentError::plugin(name, status)),
            }
        }

        if reasons.is_empty() {
            return Ok(None);
        }
        Ok(Some(reasons.join("; ")))
    }
}
