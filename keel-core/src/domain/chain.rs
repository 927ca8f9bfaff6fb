//! Deployment chain domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::deployment::DeploymentStatus;
use crate::spec::ChainApplicationMatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainStatus {
    Running,
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockStatus {
    /// Matchers not yet resolved
    Waiting,
    Running,
    Success,
    Failure,
}

/// One deployment inside a chain block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainNode {
    pub application_id: String,
    pub application_name: String,
    pub deployment_id: Option<String>,
    pub status: Option<DeploymentStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainBlock {
    pub index: u32,
    /// Empty for block 0, which holds the originating deployment
    #[serde(default)]
    pub matchers: Vec<ChainApplicationMatcher>,
    #[serde(default)]
    pub nodes: Vec<ChainNode>,
    pub status: BlockStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// An ordered sequence of deployment blocks advanced one block at a time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentChain {
    pub id: String,
    pub project_id: String,
    pub status: ChainStatus,
    #[serde(default)]
    pub status_reason: String,
    pub blocks: Vec<ChainBlock>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// What the chain controller should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainProgress {
    /// The current block still has deployments in flight
    Waiting,
    /// Block at this index must be resolved and triggered
    Activate(u32),
    Completed,
    Failed,
}

impl DeploymentChain {
    /// Build a chain whose first block is the originating deployment and whose
    /// following blocks come one per matcher.
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        origin: ChainNode,
        matchers: Vec<ChainApplicationMatcher>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut blocks = vec![ChainBlock {
            index: 0,
            matchers: Vec::new(),
            nodes: vec![origin],
            status: BlockStatus::Running,
            started_at: Some(now),
            completed_at: None,
        }];
        blocks.extend(matchers.into_iter().enumerate().map(|(i, m)| ChainBlock {
            index: i as u32 + 1,
            matchers: vec![m],
            nodes: Vec::new(),
            status: BlockStatus::Waiting,
            started_at: None,
            completed_at: None,
        }));
        Self {
            id: id.into(),
            project_id: project_id.into(),
            status: ChainStatus::Running,
            status_reason: String::new(),
            blocks,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status != ChainStatus::Running
    }

    /// Record the latest status of a deployment belonging to this chain.
    /// Returns false when the deployment is not part of the chain.
    pub fn update_node(&mut self, deployment_id: &str, status: DeploymentStatus) -> bool {
        for block in &mut self.blocks {
            for node in &mut block.nodes {
                if node.deployment_id.as_deref() == Some(deployment_id) {
                    node.status = Some(status);
                    return true;
                }
            }
        }
        false
    }

    /// Attach resolved nodes to a waiting block and mark it running
    pub fn activate_block(&mut self, index: u32, nodes: Vec<ChainNode>, now: DateTime<Utc>) {
        if let Some(block) = self.blocks.get_mut(index as usize) {
            block.nodes = nodes;
            block.status = BlockStatus::Running;
            block.started_at = Some(now);
            self.updated_at = self.updated_at.max(now);
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = ChainStatus::Failure;
        self.status_reason = reason.into();
        self.updated_at = self.updated_at.max(now);
        self.completed_at = Some(self.updated_at);
    }

    /// Fold node statuses into block and chain statuses and say what comes next
    pub fn observe(&mut self, now: DateTime<Utc>) -> ChainProgress {
        if self.status == ChainStatus::Failure {
            return ChainProgress::Failed;
        }
        if self.status == ChainStatus::Success {
            return ChainProgress::Completed;
        }

        for i in 0..self.blocks.len() {
            let block = &mut self.blocks[i];
            match block.status {
                BlockStatus::Success => continue,
                BlockStatus::Failure => return ChainProgress::Failed,
                BlockStatus::Waiting => return ChainProgress::Activate(block.index),
                BlockStatus::Running => {}
            }

            let failed = block.nodes.iter().any(|n| {
                matches!(
                    n.status,
                    Some(DeploymentStatus::Failure | DeploymentStatus::Cancelled)
                )
            });
            if failed {
                block.status = BlockStatus::Failure;
                block.completed_at = Some(now);
                let index = block.index;
                self.fail(format!("block {} has a failed deployment", index), now);
                return ChainProgress::Failed;
            }

            let done = block
                .nodes
                .iter()
                .all(|n| n.status == Some(DeploymentStatus::Success));
            if !done {
                return ChainProgress::Waiting;
            }
            block.status = BlockStatus::Success;
            block.completed_at = Some(now);
        }

        self.status = ChainStatus::Success;
        self.updated_at = self.updated_at.max(now);
        self.completed_at = Some(self.updated_at);
        ChainProgress::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn node(app: &str, deployment: &str) -> ChainNode {
        ChainNode {
            application_id: app.into(),
            application_name: app.into(),
            deployment_id: Some(deployment.into()),
            status: Some(DeploymentStatus::Pending),
        }
    }

    fn backend_matcher() -> ChainApplicationMatcher {
        ChainApplicationMatcher {
            name: None,
            kind: None,
            labels: BTreeMap::from([("tier".to_string(), "backend".to_string())]),
        }
    }

    #[test]
    fn test_chain_advances_after_block_success() {
        let now = Utc::now();
        let mut chain = DeploymentChain::new("ch", "p", node("a1", "d1"), vec![backend_matcher()], now);
        assert_eq!(chain.observe(now), ChainProgress::Waiting);

        assert!(chain.update_node("d1", DeploymentStatus::Success));
        assert_eq!(chain.observe(now), ChainProgress::Activate(1));

        chain.activate_block(1, vec![node("a2", "d2")], now);
        assert_eq!(chain.observe(now), ChainProgress::Waiting);

        chain.update_node("d2", DeploymentStatus::Success);
        assert_eq!(chain.observe(now), ChainProgress::Completed);
        assert_eq!(chain.status, ChainStatus::Success);
    }

    #[test]
    fn test_cancelled_deployment_fails_chain() {
        let now = Utc::now();
        let mut chain = DeploymentChain::new("ch", "p", node("a1", "d1"), vec![backend_matcher()], now);
        chain.update_node("d1", DeploymentStatus::Cancelled);
        assert_eq!(chain.observe(now), ChainProgress::Failed);
        assert_eq!(chain.status, ChainStatus::Failure);
        assert_eq!(chain.blocks[1].status, BlockStatus::Waiting);
    }

    #[test]
    fn test_unknown_deployment_is_ignored() {
        let now = Utc::now();
        let mut chain = DeploymentChain::new("ch", "p", node("a1", "d1"), vec![], now);
        assert!(!chain.update_node("other", DeploymentStatus::Success));
    }
}
