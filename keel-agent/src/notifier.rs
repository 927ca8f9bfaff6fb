//! Notification fan-out
//!
//! Deployment events are queued on a bounded channel and delivered to every
//! configured receiver that accepts them. Delivery is best-effort: a full
//! queue drops the event and a failing sink only logs.

use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use keel_core::domain::deployment::{Deployment, METADATA_NOTIFICATION};
use keel_core::spec::{DeploymentNotification, NotificationEventType};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NotificationReceiver;

const QUEUE_CAPACITY: usize = 256;
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub kind: NotificationEventType,
    pub deployment: Deployment,
    /// Who caused the event, when a user did
    pub commander: String,
}

impl NotificationEvent {
    pub fn new(kind: NotificationEventType, deployment: &Deployment) -> Self {
        Self {
            kind,
            deployment: deployment.clone(),
            commander: String::new(),
        }
    }

    pub fn with_commander(mut self, commander: impl Into<String>) -> Self {
        self.commander = commander.into();
        self
    }

    /// Mention rules captured on the deployment when it was built
    pub fn mentions(&self) -> Option<DeploymentNotification> {
        let raw = self.deployment.metadata.get(METADATA_NOTIFICATION)?;
        match serde_json::from_str(raw) {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(deployment_id = %self.deployment.id, "Malformed notification metadata: {}", e);
                None
            }
        }
    }

    pub fn summary(&self) -> String {
        let d = &self.deployment;
        let mut text = format!(
            "{}: application {} deployment {} is {}",
            self.kind.name(),
            d.application_name,
            d.id,
            d.status
        );
        if !d.status_reason.is_empty() {
            text.push_str(&format!(" ({})", d.status_reason));
        }
        if !self.commander.is_empty() {
            text.push_str(&format!(" by {}", self.commander));
        }
        text
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, event: &NotificationEvent) -> Result<()>;
}

/// Posts to a Slack incoming webhook
pub struct SlackSink {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackSink {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self {
            webhook_url: webhook_url.into(),
            client: reqwest::Client::new(),
        }
    }

    fn message(event: &NotificationEvent) -> serde_json::Value {
        let mut text = event.summary();
        if let Some(mentions) = event.mentions() {
            let users = mentions.find_slack_users(event.kind);
            let groups = mentions.find_slack_groups(event.kind);
            let tags: Vec<String> = users
                .iter()
                .map(|u| format!("<@{}>", u))
                .chain(groups.iter().map(|g| format!("<!subteam^{}>", g)))
                .collect();
            if !tags.is_empty() {
                text = format!("{} {}", tags.join(" "), text);
            }
        }
        let commit = &event.deployment.trigger.commit;
        json!({
            "text": text,
            "attachments": [{
                "fields": [
                    { "title": "Application", "value": event.deployment.application_name, "short": true },
                    { "title": "Commit", "value": commit.hash, "short": true },
                ],
                "title_link": commit.url,
            }],
        })
    }
}

#[async_trait]
impl NotificationSink for SlackSink {
    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .timeout(SEND_TIMEOUT)
            .json(&Self::message(event))
            .send()
            .await
            .context("Failed to reach Slack webhook")?;
        if !response.status().is_success() {
            anyhow::bail!("Slack webhook returned {}", response.status());
        }
        Ok(())
    }
}

/// Writes events to the agent log
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, event: &NotificationEvent) -> Result<()> {
        info!(deployment_id = %event.deployment.id, "{}", event.summary());
        Ok(())
    }
}

pub struct Route {
    pub receiver: NotificationReceiver,
    pub sink: Arc<dyn NotificationSink>,
}

impl Route {
    pub fn from_receiver(receiver: NotificationReceiver) -> Self {
        let sink: Arc<dyn NotificationSink> = match &receiver.slack_webhook_url {
            Some(url) => Arc::new(SlackSink::new(url.clone())),
            None => Arc::new(LogSink),
        };
        Self { receiver, sink }
    }
}

/// Cheap handle used to enqueue events
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<NotificationEvent>,
}

impl Notifier {
    /// Starts the delivery task
    pub fn start(routes: Vec<Route>, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(deliver(rx, routes, shutdown));
        (Self { tx }, handle)
    }

    /// A notifier whose events go nowhere
    pub fn disabled() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self { tx }
    }

    pub fn notify(&self, event: NotificationEvent) {
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    warn!(deployment_id = %event.deployment.id, kind = event.kind.name(), "Notification queue is full, dropping event");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!("Notifier is not running");
                }
            }
        }
    }
}

async fn deliver(
    mut rx: mpsc::Receiver<NotificationEvent>,
    routes: Vec<Route>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        for route in routes.iter().filter(|r| r.receiver.accepts(event.kind)) {
            if let Err(e) = route.sink.send(&event).await {
                warn!(
                    receiver = %route.receiver.name,
                    deployment_id = %event.deployment.id,
                    "Failed to send notification: {:#}",
                    e
                );
            }
        }
    }
    debug!("Notifier stopped");
}
