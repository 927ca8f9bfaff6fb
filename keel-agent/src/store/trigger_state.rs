use super::{Collection, CollectionStore, DataStore, Shard, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Last commit a deployment was triggered for, per application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerState {
    pub application_id: String,
    pub commit_hash: String,
    pub updated_at: DateTime<Utc>,
}

struct TriggerStateCollection;

impl Collection for TriggerStateCollection {
    type Entity = TriggerState;

    fn kind(&self) -> &'static str {
        "TriggerState"
    }

    fn id_of(&self, entity: &TriggerState) -> String {
        entity.application_id.clone()
    }

    fn shards_in_use(&self) -> &'static [Shard] {
        &[Shard::Ops]
    }

    fn updatable_shard(&self) -> Shard {
        Shard::Ops
    }
}

pub struct TriggerStateStore {
    inner: CollectionStore<TriggerStateCollection>,
}

impl TriggerStateStore {
    pub fn new(ds: Arc<dyn DataStore>) -> Self {
        Self {
            inner: CollectionStore::new(ds, TriggerStateCollection),
        }
    }

    pub async fn last_triggered(&self, application_id: &str) -> StoreResult<Option<String>> {
        match self.inner.get(application_id).await {
            Ok(state) => Ok(Some(state.commit_hash)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn set_last_triggered(
        &self,
        application_id: &str,
        commit_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.inner
            .put(&TriggerState {
                application_id: application_id.to_string(),
                commit_hash: commit_hash.to_string(),
                updated_at: now,
            })
            .await
    }
}
