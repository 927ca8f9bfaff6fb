//! Construction of fresh deployment records

use chrono::{DateTime, Utc};
use keel_core::domain::application::Application;
use keel_core::domain::deployment::{
    Commit, Deployment, DeploymentStatus, DeploymentTrigger, METADATA_NOTIFICATION, SyncStrategy,
};
use keel_core::domain::trace::DeploymentTrace;
use keel_core::spec::DeploymentNotification;
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::git::GitCommit;

pub const WAITING_TO_BE_PLANNED: &str = "The deployment is waiting to be planned";

/// Commit trailer linking a deployment to the commit that caused it
pub const TRACE_TRAILER: &str = "Pipecd-Trace-Commit-Hash";

/// Everything a new deployment is built from
#[derive(Debug, Clone)]
pub struct DeploymentRequest<'a> {
    pub app: &'a Application,
    pub commit: &'a GitCommit,
    pub commander: &'a str,
    pub strategy: SyncStrategy,
    pub strategy_summary: String,
    pub notification: Option<&'a DeploymentNotification>,
    pub chain: Option<(String, u32)>,
    pub now: DateTime<Utc>,
}

pub fn build_deployment(req: DeploymentRequest<'_>) -> Result<Deployment> {
    let app = req.app;
    let commit_url = make_commit_url(&app.git_path.repo.remote, &req.commit.hash).unwrap_or_else(|| {
        warn!(remote = %app.git_path.repo.remote, "Cannot derive a commit URL from the remote");
        String::new()
    });

    let mut metadata = BTreeMap::new();
    if let Some(notification) = req.notification {
        let value = serde_json::to_string(notification).map_err(|e| {
            AgentError::Internal(format!("failed to encode notification config: {}", e))
        })?;
        metadata.insert(METADATA_NOTIFICATION.to_string(), value);
    }

    let (chain_id, block_index) = match req.chain {
        Some((id, index)) => (Some(id), index),
        None => (None, 0),
    };

    Ok(Deployment {
        id: Uuid::new_v4().to_string(),
        application_id: app.id.clone(),
        application_name: app.name.clone(),
        application_kind: app.kind.clone(),
        project_id: app.project_id.clone(),
        piped_id: app.piped_id.clone(),
        trigger: DeploymentTrigger {
            commit: Commit {
                hash: req.commit.hash.clone(),
                message: req.commit.message.clone(),
                author: req.commit.author.clone(),
                branch: app.git_path.repo.branch.clone(),
                url: commit_url,
                created_at: DateTime::from_timestamp(req.commit.timestamp, 0).unwrap_or(req.now),
            },
            commander: req.commander.to_string(),
            timestamp: req.now,
            sync_strategy: req.strategy,
            strategy_summary: req.strategy_summary,
        },
        sync_strategy: req.strategy,
        summary: String::new(),
        git_path: app.git_path.clone(),
        deploy_targets_by_plugin: app.deploy_targets_by_plugin.clone(),
        labels: app.labels.clone(),
        status: DeploymentStatus::Pending,
        status_reason: WAITING_TO_BE_PLANNED.to_string(),
        versions: Vec::new(),
        metadata,
        stages: Vec::new(),
        rollback: None,
        deployment_chain_id: chain_id,
        block_index,
        trace_commit_hash: trailer_value(&req.commit.message, TRACE_TRAILER).unwrap_or_default(),
        running_commit_hash: String::new(),
        created_at: req.now,
        updated_at: req.now,
        completed_at: None,
    })
}

/// Trace record for a deployment whose commit carries the trace trailer
pub fn build_trace(deployment: &Deployment) -> Option<DeploymentTrace> {
    if deployment.trace_commit_hash.is_empty() {
        return None;
    }
    let commit = &deployment.trigger.commit;
    Some(DeploymentTrace {
        id: deployment.trace_commit_hash.clone(),
        project_id: deployment.project_id.clone(),
        title: commit.message.lines().next().unwrap_or_default().to_string(),
        commit_message: commit.message.clone(),
        commit_hash: deployment.trace_commit_hash.clone(),
        commit_url: commit.url.clone(),
        author: commit.author.clone(),
        commit_timestamp: commit.created_at.timestamp(),
        created_at: DateTime::<Utc>::UNIX_EPOCH,
        updated_at: DateTime::<Utc>::UNIX_EPOCH,
    })
}

/// Value of the last `Key: value` trailer line with the given key
pub fn trailer_value(message: &str, key: &str) -> Option<String> {
    message
        .lines()
        .filter_map(|line| {
            let (k, v) = line.split_once(':')?;
            (k.trim() == key).then(|| v.trim().to_string())
        })
        .filter(|v| !v.is_empty())
        .last()
}

/// Web URL of a commit for `https`, `git@host:org/repo` and `ssh://` remotes
pub fn make_commit_url(remote: &str, hash: &str) -> Option<String> {
    let remote = remote.trim();
    let (host, path) = if let Some(rest) = remote
        .strip_prefix("https://")
        .or_else(|| remote.strip_prefix("http://"))
    {
        let rest = rest.rsplit_once('@').map_or(rest, |(_, r)| r);
        rest.split_once('/')?
    } else if let Some(rest) = remote.strip_prefix("ssh://") {
        let rest = rest.split_once('@').map_or(rest, |(_, r)| r);
        let (host, path) = rest.split_once('/')?;
        (host.split(':').next()?, path)
    } else {
        let rest = remote.split_once('@').map_or(remote, |(_, r)| r);
        let (host, path) = rest.split_once(':')?;
        if host.is_empty() || host.contains('/') {
            return None;
        }
        (host, path)
    };

    let path = path.trim_end_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path).trim_matches('/');
    if host.is_empty() || path.is_empty() {
        return None;
    }
    Some(format!("https://{}/{}/commit/{}", host, path, hash))
}
