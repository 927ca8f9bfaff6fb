use super::{Collection, CollectionStore, DataStore, Shard, StoreResult};
use keel_core::domain::chain::DeploymentChain;
use std::sync::Arc;

pub struct DeploymentChainCollection;

impl Collection for DeploymentChainCollection {
    type Entity = DeploymentChain;

    fn kind(&self) -> &'static str {
        "DeploymentChain"
    }

    fn id_of(&self, entity: &DeploymentChain) -> String {
        entity.id.clone()
    }

    fn shards_in_use(&self) -> &'static [Shard] {
        &[Shard::Agent]
    }

    fn updatable_shard(&self) -> Shard {
        Shard::Agent
    }
}

pub struct DeploymentChainStore {
    inner: CollectionStore<DeploymentChainCollection>,
}

impl DeploymentChainStore {
    pub fn new(ds: Arc<dyn DataStore>) -> Self {
        Self {
            inner: CollectionStore::new(ds, DeploymentChainCollection),
        }
    }

    pub async fn add(&self, chain: &DeploymentChain) -> StoreResult<()> {
        self.inner.create(chain).await
    }

    pub async fn put(&self, chain: &DeploymentChain) -> StoreResult<()> {
        self.inner.put(chain).await
    }

    pub async fn get(&self, id: &str) -> StoreResult<DeploymentChain> {
        self.inner.get(id).await
    }

    pub async fn list_running(&self) -> StoreResult<Vec<DeploymentChain>> {
        let mut all = self.inner.find_all().await?;
        all.retain(|c| !c.is_completed());
        Ok(all)
    }
}
