use super::{Collection, CollectionStore, DataStore, ListOptions, Shard, StoreError, StoreResult};
use chrono::{DateTime, Utc};
use keel_core::domain::trace::DeploymentTrace;
use std::sync::Arc;

pub struct DeploymentTraceCollection;

impl Collection for DeploymentTraceCollection {
    type Entity = DeploymentTrace;

    fn kind(&self) -> &'static str {
        "DeploymentTrace"
    }

    fn id_of(&self, entity: &DeploymentTrace) -> String {
        entity.id.clone()
    }

    fn shards_in_use(&self) -> &'static [Shard] {
        &[Shard::Agent]
    }

    fn updatable_shard(&self) -> Shard {
        Shard::Agent
    }
}

pub struct DeploymentTraceStore {
    inner: CollectionStore<DeploymentTraceCollection>,
}

impl DeploymentTraceStore {
    pub fn new(ds: Arc<dyn DataStore>) -> Self {
        Self {
            inner: CollectionStore::new(ds, DeploymentTraceCollection),
        }
    }

    /// Insert a trace, filling unset timestamps with `now`
    pub async fn add(&self, mut trace: DeploymentTrace, now: DateTime<Utc>) -> StoreResult<DeploymentTrace> {
        if trace.created_at == DateTime::<Utc>::UNIX_EPOCH {
            trace.created_at = now;
        }
        if trace.updated_at == DateTime::<Utc>::UNIX_EPOCH {
            trace.updated_at = now;
        }
        trace.validate().map_err(|field| StoreError::InvalidArgument {
            kind: "DeploymentTrace",
            message: format!("{field} is required"),
        })?;
        self.inner.create(&trace).await?;
        Ok(trace)
    }

    pub async fn get(&self, id: &str) -> StoreResult<DeploymentTrace> {
        self.inner.get(id).await
    }

    /// One page of traces plus the cursor for the next page
    pub async fn list(&self, opts: &ListOptions) -> StoreResult<(Vec<DeploymentTrace>, String)> {
        let mut iter = self.inner.find(opts).await?;
        let cursor = iter.cursor().to_string();
        let traces = iter.by_ref().collect();
        Ok((traces, cursor))
    }
}
