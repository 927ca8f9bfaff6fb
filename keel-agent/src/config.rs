//! Agent configuration
//!
//! Defines every tunable of the agent: identity, control-plane connection,
//! loop intervals, the repositories it watches, the plugins it launches and
//! where notifications go.

use keel_core::spec::NotificationEventType;
use keel_core::spec::duration::serde_duration;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Agent configuration
///
/// Loaded from a YAML file when one is given, otherwise from environment
/// variables with defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Identifier of this agent instance
    pub piped_id: String,

    pub project_id: String,

    /// Control-plane base URL (e.g., "https://cp.example.com")
    pub control_plane_url: String,

    pub api_key: String,

    /// How often the trigger scans Git
    #[serde(with = "serde_duration")]
    pub sync_interval: Duration,

    /// How often to poll the control plane for commands
    #[serde(with = "serde_duration")]
    pub command_poll_interval: Duration,

    /// How often to ask plugins for live state
    #[serde(with = "serde_duration")]
    pub drift_interval: Duration,

    /// How often to flush buffered stage logs
    #[serde(with = "serde_duration")]
    pub log_send_interval: Duration,

    /// How long a plugin has to honour a cancel before the stage is forced
    #[serde(with = "serde_duration")]
    pub cancel_grace: Duration,

    /// Deployments executed concurrently across applications
    pub max_parallel_deployments: usize,

    /// Where the plugin callback API listens
    pub callback_addr: String,

    /// Postgres URL; the in-memory store is used when unset
    pub datastore_url: Option<String>,

    pub repositories: Vec<RepositoryConfig>,

    pub plugins: Vec<PluginConfig>,

    pub notifications: NotificationsConfig,
}

/// A Git repository the agent keeps a local clone of
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    pub id: String,
    pub remote: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Local working copy
    pub path: PathBuf,
}

fn default_branch() -> String {
    "main".to_string()
}

/// A plugin executable to launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    pub name: String,
    pub command: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationsConfig {
    pub receivers: Vec<NotificationReceiver>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationReceiver {
    pub name: String,
    /// Slack incoming webhook; the receiver only logs when unset
    #[serde(default)]
    pub slack_webhook_url: Option<String>,
    /// Events to forward; empty means all
    #[serde(default)]
    pub events: Vec<NotificationEventType>,
}

impl NotificationReceiver {
    pub fn accepts(&self, event: NotificationEventType) -> bool {
        self.events.is_empty() || self.events.contains(&event)
    }
}

impl Config {
    /// Creates a new configuration with defaults
    pub fn new(piped_id: String, project_id: String, control_plane_url: String) -> Self {
        Self {
            piped_id,
            project_id,
            control_plane_url,
            api_key: String::new(),
            sync_interval: Duration::from_secs(60),
            command_poll_interval: Duration::from_secs(10),
            drift_interval: Duration::from_secs(60),
            log_send_interval: Duration::from_secs(5),
            cancel_grace: Duration::from_secs(30),
            max_parallel_deployments: 10,
            callback_addr: "127.0.0.1:9085".to_string(),
            datastore_url: None,
            repositories: Vec::new(),
            plugins: Vec::new(),
            notifications: NotificationsConfig::default(),
        }
    }

    /// Loads configuration from a YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {}", path.display(), e))?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Creates configuration from environment variables
    ///
    /// Expected environment variables:
    /// - KEEL_PIPED_ID (required)
    /// - KEEL_PROJECT_ID (required)
    /// - KEEL_CONTROL_PLANE_URL (required)
    /// - KEEL_API_KEY (optional)
    /// - KEEL_SYNC_INTERVAL, KEEL_COMMAND_POLL_INTERVAL, KEEL_DRIFT_INTERVAL,
    ///   KEEL_LOG_SEND_INTERVAL, KEEL_CANCEL_GRACE (optional, durations like "30s")
    /// - KEEL_MAX_PARALLEL_DEPLOYMENTS (optional, default: 10)
    /// - KEEL_CALLBACK_ADDR (optional, default: 127.0.0.1:9085)
    /// - KEEL_DATASTORE_URL (optional)
    pub fn from_env() -> anyhow::Result<Self> {
        let required = |key: &str| {
            std::env::var(key).map_err(|_| anyhow::anyhow!("{} environment variable not set", key))
        };
        let mut config = Self::new(
            required("KEEL_PIPED_ID")?,
            required("KEEL_PROJECT_ID")?,
            required("KEEL_CONTROL_PLANE_URL")?,
        );

        if let Ok(key) = std::env::var("KEEL_API_KEY") {
            config.api_key = key;
        }

        let duration = |key: &str, default: Duration| {
            std::env::var(key)
                .ok()
                .and_then(|s| keel_core::spec::duration::parse(&s).ok())
                .unwrap_or(default)
        };
        config.sync_interval = duration("KEEL_SYNC_INTERVAL", config.sync_interval);
        config.command_poll_interval =
            duration("KEEL_COMMAND_POLL_INTERVAL", config.command_poll_interval);
        config.drift_interval = duration("KEEL_DRIFT_INTERVAL", config.drift_interval);
        config.log_send_interval = duration("KEEL_LOG_SEND_INTERVAL", config.log_send_interval);
        config.cancel_grace = duration("KEEL_CANCEL_GRACE", config.cancel_grace);

        config.max_parallel_deployments = std::env::var("KEEL_MAX_PARALLEL_DEPLOYMENTS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(config.max_parallel_deployments);

        if let Ok(addr) = std::env::var("KEEL_CALLBACK_ADDR") {
            config.callback_addr = addr;
        }
        config.datastore_url = std::env::var("KEEL_DATASTORE_URL").ok();

        Ok(config)
    }

    pub fn callback_socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.callback_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid callback_addr {:?}: {}", self.callback_addr, e))
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.piped_id.is_empty() {
            anyhow::bail!("piped_id cannot be empty");
        }

        if self.project_id.is_empty() {
            anyhow::bail!("project_id cannot be empty");
        }

        if !self.control_plane_url.starts_with("http://")
            && !self.control_plane_url.starts_with("https://")
        {
            anyhow::bail!("control_plane_url must start with http:// or https://");
        }

        let intervals = [
            ("sync_interval", self.sync_interval),
            ("command_poll_interval", self.command_poll_interval),
            ("drift_interval", self.drift_interval),
            ("log_send_interval", self.log_send_interval),
            ("cancel_grace", self.cancel_grace),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than 0", name);
            }
        }

        if self.max_parallel_deployments == 0 {
            anyhow::bail!("max_parallel_deployments must be greater than 0");
        }

        self.callback_socket_addr()?;

        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            if plugin.name.is_empty() {
                anyhow::bail!("plugin name cannot be empty");
            }
            if !seen.insert(plugin.name.as_str()) {
                anyhow::bail!("duplicate plugin name {:?}", plugin.name);
            }
        }

        let mut seen = HashSet::new();
        for repo in &self.repositories {
            if !seen.insert(repo.id.as_str()) {
                anyhow::bail!("duplicate repository id {:?}", repo.id);
            }
        }

        for receiver in &self.notifications.receivers {
            if let Some(url) = &receiver.slack_webhook_url {
                if !url.starts_with("https://") && !url.starts_with("http://") {
                    anyhow::bail!("receiver {:?} has an invalid slack webhook URL", receiver.name);
                }
            }
        }

        Ok(())
    }

    pub fn repository(&self, id: &str) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|r| r.id == id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            "default".to_string(),
            "http://localhost:9080".to_string(),
        )
    }
}
