//! Deployment chain controller
//!
//! A chain starts with the deployment that declared it and continues block
//! by block: once every deployment of a block succeeds, the applications
//! matched by the next block are triggered. A failed or cancelled deployment
//! fails the whole chain.

use chrono::Utc;
use keel_core::domain::chain::{ChainNode, ChainProgress, DeploymentChain};
use keel_core::domain::deployment::{Deployment, DeploymentStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::store::{DataStore, DeploymentChainStore, DeploymentStore};
use crate::trigger::Trigger;

pub struct ChainController {
    trigger: Arc<Trigger>,
    chains: DeploymentChainStore,
    deployments: Arc<DeploymentStore>,
    shutdown: CancellationToken,
}

impl ChainController {
    pub fn new(
        trigger: Arc<Trigger>,
        datastore: Arc<dyn DataStore>,
        deployments: Arc<DeploymentStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            trigger,
            chains: DeploymentChainStore::new(datastore),
            deployments,
            shutdown,
        }
    }

    /// Re-check running chains every `interval` until shutdown
    pub async fn run(self: Arc<Self>, interval: Duration) {
        info!("Starting chain controller (interval: {:?})", interval);
        let mut ticker = time::interval(interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sync().await {
                error!("Chain sync failed: {}", e);
            }
        }
        info!("Chain controller stopped");
    }

    /// Record a finished deployment on its chain and advance it
    pub async fn on_finished(&self, deployment: &Deployment) -> Result<()> {
        let Some(chain_id) = &deployment.deployment_chain_id else {
            return Ok(());
        };
        let mut chain = self.chains.get(chain_id).await?;
        if chain.is_completed() {
            return Ok(());
        }
        if !chain.update_node(&deployment.id, deployment.status) {
            debug!(chain_id = %chain.id, deployment_id = %deployment.id, "Deployment is not a node of the chain");
            return Ok(());
        }
        self.advance(&mut chain).await
    }

    /// Refresh node statuses from the local store and advance every running chain
    pub async fn sync(&self) -> Result<usize> {
        let running = self.chains.list_running().await?;
        let count = running.len();
        for mut chain in running {
            self.refresh(&mut chain).await;
            if let Err(e) = self.advance(&mut chain).await {
                warn!(chain_id = %chain.id, "Failed to advance deployment chain: {}", e);
            }
        }
        Ok(count)
    }

    async fn refresh(&self, chain: &mut DeploymentChain) {
        let ids: Vec<String> = chain
            .blocks
            .iter()
            .flat_map(|b| b.nodes.iter())
            .filter_map(|n| n.deployment_id.clone())
            .collect();
        for id in ids {
            match self.deployments.get(&id).await {
                Ok(d) => {
                    chain.update_node(&id, d.status);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(chain_id = %chain.id, deployment_id = %id, "Failed to read deployment: {}", e),
            }
        }
    }

    async fn advance(&self, chain: &mut DeploymentChain) -> Result<()> {
        loop {
            match chain.observe(Utc::now()) {
                ChainProgress::Activate(index) => self.activate(chain, index).await,
                ChainProgress::Waiting => break,
                ChainProgress::Completed => {
                    info!(chain_id = %chain.id, "Deployment chain completed");
                    break;
                }
                ChainProgress::Failed => {
                    warn!(chain_id = %chain.id, "Deployment chain failed: {}", chain.status_reason);
                    break;
                }
            }
        }
        self.chains.put(chain).await?;
        Ok(())
    }

    /// Trigger every application matched by block `index`
    ///
    /// A block matching nothing fails the chain, as does any trigger error.
    async fn activate(&self, chain: &mut DeploymentChain, index: u32) {
        let now = Utc::now();
        let Some(block) = chain.blocks.get(index as usize) else {
            chain.fail(format!("block {} does not exist", index), now);
            return;
        };
        let matchers = block.matchers.clone();

        let apps = match self.trigger.list_applications().await {
            Ok(apps) => apps,
            Err(e) => {
                chain.fail(format!("failed to list applications for block {}: {}", index, e), now);
                return;
            }
        };
        let matched: Vec<_> = apps
            .iter()
            .filter(|app| matchers.iter().any(|m| m.matches(app)))
            .collect();
        if matched.is_empty() {
            chain.fail(format!("no application matched block {}", index), now);
            return;
        }

        let mut nodes = Vec::with_capacity(matched.len());
        for app in matched {
            match self.trigger.trigger_chain_app(app, &chain.id, index).await {
                Ok(d) => {
                    info!(chain_id = %chain.id, block = index, application_id = %app.id, deployment_id = %d.id, "Triggered chain deployment");
                    nodes.push(ChainNode {
                        application_id: app.id.clone(),
                        application_name: app.name.clone(),
                        deployment_id: Some(d.id),
                        status: Some(DeploymentStatus::Pending),
                    });
                }
                Err(e) => {
                    chain.fail(
                        format!("failed to trigger {} for block {}: {}", app.name, index, e),
                        Utc::now(),
                    );
                    return;
                }
            }
        }
        chain.activate_block(index, nodes, Utc::now());
    }
}
