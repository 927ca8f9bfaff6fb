//! Plugin registry
//!
//! Holds a handle to every plugin keyed by name, and the stage-ownership map
//! built from each plugin's `FetchDefinedStages` reply. Built once at startup
//! and shared read-only afterwards.

use keel_core::plugin::Plugin;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

use crate::error::{AgentError, Result};

#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn Plugin>>,
    stage_owners: HashMap<String, String>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin under a unique name
    pub fn register(&mut self, name: impl Into<String>, plugin: Arc<dyn Plugin>) -> Result<()> {
        let name = name.into();
        if self.plugins.contains_key(&name) {
            return Err(AgentError::InvalidArgument(format!(
                "plugin {} is registered twice",
                name
            )));
        }
        self.plugins.insert(name, plugin);
        Ok(())
    }

    /// Ask every plugin for its stage names and build the ownership map.
    /// Two plugins claiming one stage name is a startup error.
    pub async fn load_stages(&mut self) -> Result<()> {
        let mut owners: HashMap<String, String> = HashMap::new();
        for (name, plugin) in &self.plugins {
            let defined = plugin
                .fetch_defined_stages()
                .await
                .map_err(|status| AgentError::plugin(name, status))?;

            for stage in defined.stages {
                if let Some(other) = owners.get(&stage) {
                    if other != name {
                        return Err(AgentError::FailedPrecondition(format!(
                            "stage {} is claimed by both {} and {}",
                            stage, other, name
                        )));
                    }
                    continue;
                }
                owners.insert(stage, name.clone());
            }
            info!(plugin = %name, "Plugin registered");
        }
        self.stage_owners = owners;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Plugin>> {
        self.plugins
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(format!("plugin {} is not registered", name)))
    }

    /// Plugin owning a stage name
    pub fn owner_of(&self, stage: &str) -> Option<&str> {
        self.stage_owners.get(stage).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
