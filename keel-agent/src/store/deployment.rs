use super::{Collection, CollectionStore, DataStore, Shard, StoreError, StoreResult};
use keel_core::domain::deployment::{Deployment, DeploymentStatus};
use std::sync::Arc;

pub struct DeploymentCollection;

impl Collection for DeploymentCollection {
    type Entity = Deployment;

    fn kind(&self) -> &'static str {
        "Deployment"
    }

    fn id_of(&self, entity: &Deployment) -> String {
        entity.id.clone()
    }

    fn shards_in_use(&self) -> &'static [Shard] {
        &[Shard::Client, Shard::Agent]
    }

    fn updatable_shard(&self) -> Shard {
        Shard::Agent
    }
}

/// Deployments as this agent last persisted them.
///
/// Every overwrite is checked against the stored copy: `updated_at` may not
/// go backwards and a status change must be a legal transition.
pub struct DeploymentStore {
    inner: CollectionStore<DeploymentCollection>,
}

impl DeploymentStore {
    pub fn new(ds: Arc<dyn DataStore>) -> Self {
        Self {
            inner: CollectionStore::new(ds, DeploymentCollection),
        }
    }

    pub async fn add(&self, deployment: &Deployment) -> StoreResult<()> {
        self.inner.create(deployment).await
    }

    pub async fn get(&self, id: &str) -> StoreResult<Deployment> {
        self.inner.get(id).await
    }

    pub async fn put(&self, deployment: &Deployment) -> StoreResult<()> {
        let current = match self.inner.get(&deployment.id).await {
            Ok(current) => current,
            Err(err) if err.is_not_found() => return self.inner.create(deployment).await,
            Err(err) => return Err(err),
        };
        check_update(&current, deployment)?;
        self.inner.put(deployment).await
    }

    pub async fn list(&self) -> StoreResult<Vec<Deployment>> {
        self.inner.find_all().await
    }

    pub async fn list_not_completed(&self) -> StoreResult<Vec<Deployment>> {
        let mut all = self.inner.find_all().await?;
        all.retain(|d| !d.is_terminal());
        Ok(all)
    }

    /// Deployments of one application, oldest first
    pub async fn list_by_application(&self, application_id: &str) -> StoreResult<Vec<Deployment>> {
        let mut all = self.inner.find_all().await?;
        all.retain(|d| d.application_id == application_id);
        all.sort_by_key(|d| d.created_at);
        Ok(all)
    }
}

fn check_update(current: &Deployment, next: &Deployment) -> StoreResult<()> {
    let reject = |message: String| StoreError::FailedPrecondition {
        kind: "Deployment",
        id: next.id.clone(),
        message,
    };

    if next.updated_at < current.updated_at {
        return Err(reject(format!(
            "updated_at moved backwards ({} < {})",
            next.updated_at, current.updated_at
        )));
    }
    if next.status != current.status && !legal_step(current.status, next.status) {
        return Err(reject(format!(
            "illegal status change {} -> {}",
            current.status, next.status
        )));
    }
    Ok(())
}

/// A snapshot may skip intermediate states that were never persisted, as long
/// as the path exists in the state machine.
fn legal_step(from: DeploymentStatus, to: DeploymentStatus) -> bool {
    let mut frontier = vec![from];
    let mut seen = Vec::new();
    while let Some(status) = frontier.pop() {
        if seen.contains(&status) {
            continue;
        }
        seen.push(status);
        for next in ALL_STATUSES {
            if status.can_transition_to(next) {
                if next == to {
                    return true;
                }
                frontier.push(next);
            }
        }
    }
    false
}

const ALL_STATUSES: [DeploymentStatus; 7] = [
    DeploymentStatus::Pending,
    DeploymentStatus::Planned,
    DeploymentStatus::Running,
    DeploymentStatus::RollingBack,
    DeploymentStatus::Success,
    DeploymentStatus::Failure,
    DeploymentStatus::Cancelled,
];
