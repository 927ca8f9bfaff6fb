//! Datastore abstraction
//!
//! Entities are stored as one encoded value per `(kind, id, shard)`. A
//! [`Collection`] knows how to encode its entity into the shards it uses and
//! decode it back; a [`DataStore`] backend only sees bytes. Typed stores
//! ([`DeploymentStore`], [`DeploymentTraceStore`], ...) layer domain rules on
//! top.

mod chain;
mod deployment;
mod memory;
mod postgres;
mod trace;
mod trigger_state;

pub use chain::{DeploymentChainCollection, DeploymentChainStore};
pub use deployment::{DeploymentCollection, DeploymentStore};
pub use memory::MemoryDataStore;
pub use postgres::PostgresDataStore;
pub use trace::{DeploymentTraceCollection, DeploymentTraceStore};
pub use trigger_state::{TriggerState, TriggerStateStore};

use async_trait::async_trait;
use keel_core::Code;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

/// Which part of the system owns a stored value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shard {
    Client,
    Agent,
    Ops,
}

impl Shard {
    pub fn as_str(self) -> &'static str {
        match self {
            Shard::Client => "client",
            Shard::Agent => "agent",
            Shard::Ops => "ops",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("invalid {kind}: {message}")]
    InvalidArgument { kind: &'static str, message: String },

    #[error("rejected update of {kind} {id}: {message}")]
    FailedPrecondition {
        kind: &'static str,
        id: String,
        message: String,
    },

    #[error("failed to encode or decode {kind}: {message}")]
    Codec { kind: &'static str, message: String },

    #[error("datastore backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn code(&self) -> Code {
        match self {
            Self::NotFound { .. } => Code::NotFound,
            Self::AlreadyExists { .. } => Code::AlreadyExists,
            Self::InvalidArgument { .. } => Code::InvalidArgument,
            Self::FailedPrecondition { .. } => Code::FailedPrecondition,
            Self::Codec { .. } => Code::Internal,
            Self::Backend(_) => Code::Unavailable,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Pagination of a `find` call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Maximum rows; 0 means no limit
    pub limit: usize,
    /// Cursor returned by a previous page; empty starts from the beginning
    pub cursor: String,
}

impl ListOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = cursor.into();
        self
    }
}

/// A page of raw rows plus the cursor to continue from
#[derive(Debug, Clone, Default)]
pub struct RawPage {
    pub rows: Vec<(String, Vec<u8>)>,
    /// Empty when the page is empty
    pub cursor: String,
}

/// Byte-level storage backend
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Insert a new value; fails with `AlreadyExists`
    async fn create(&self, kind: &'static str, id: &str, shard: Shard, data: Vec<u8>) -> StoreResult<()>;

    /// Full-document overwrite, inserting if absent
    async fn put(&self, kind: &'static str, id: &str, shard: Shard, data: Vec<u8>) -> StoreResult<()>;

    /// Fails with `NotFound`
    async fn get(&self, kind: &'static str, id: &str, shard: Shard) -> StoreResult<Vec<u8>>;

    /// Rows of a kind on a shard in insertion order
    async fn find(&self, kind: &'static str, shard: Shard, opts: &ListOptions) -> StoreResult<RawPage>;
}

/// How an entity kind is laid out in the datastore
pub trait Collection: Send + Sync + 'static {
    type Entity: Serialize + DeserializeOwned + Send + Sync;

    fn kind(&self) -> &'static str;

    fn id_of(&self, entity: &Self::Entity) -> String;

    fn shards_in_use(&self) -> &'static [Shard];

    /// Shard that overwrites go to and reads come from
    fn updatable_shard(&self) -> Shard;

    fn encode(&self, entity: &Self::Entity) -> StoreResult<BTreeMap<Shard, Vec<u8>>> {
        let bytes = serde_json::to_vec(entity).map_err(|e| StoreError::Codec {
            kind: self.kind(),
            message: e.to_string(),
        })?;
        Ok(self
            .shards_in_use()
            .iter()
            .map(|shard| (*shard, bytes.clone()))
            .collect())
    }

    fn decode(&self, _shard: Shard, bytes: &[u8]) -> StoreResult<Self::Entity> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Codec {
            kind: self.kind(),
            message: e.to_string(),
        })
    }
}

/// Typed results of a `find` call
#[derive(Debug)]
pub struct EntityIterator<T> {
    items: std::vec::IntoIter<T>,
    cursor: String,
}

impl<T> EntityIterator<T> {
    /// Cursor to continue after this page; empty when there were no rows
    pub fn cursor(&self) -> &str {
        &self.cursor
    }
}

impl<T> Iterator for EntityIterator<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.items.next()
    }
}

/// Typed access to one collection
pub struct CollectionStore<C: Collection> {
    ds: Arc<dyn DataStore>,
    collection: C,
    _entity: PhantomData<fn() -> C::Entity>,
}

impl<C: Collection> CollectionStore<C> {
    pub fn new(ds: Arc<dyn DataStore>, collection: C) -> Self {
        Self {
            ds,
            collection,
            _entity: PhantomData,
        }
    }

    pub fn collection(&self) -> &C {
        &self.collection
    }

    pub async fn create(&self, entity: &C::Entity) -> StoreResult<()> {
        let id = self.collection.id_of(entity);
        for (shard, bytes) in self.collection.encode(entity)? {
            self.ds.create(self.collection.kind(), &id, shard, bytes).await?;
        }
        Ok(())
    }

    pub async fn put(&self, entity: &C::Entity) -> StoreResult<()> {
        let id = self.collection.id_of(entity);
        let shard = self.collection.updatable_shard();
        let mut encoded = self.collection.encode(entity)?;
        let bytes = encoded.remove(&shard).ok_or_else(|| StoreError::Codec {
            kind: self.collection.kind(),
            message: format!("no encoding for shard {}", shard.as_str()),
        })?;
        self.ds.put(self.collection.kind(), &id, shard, bytes).await
    }

    pub async fn get(&self, id: &str) -> StoreResult<C::Entity> {
        let shard = self.collection.updatable_shard();
        let bytes = self.ds.get(self.collection.kind(), id, shard).await?;
        self.collection.decode(shard, &bytes)
    }

    pub async fn find(&self, opts: &ListOptions) -> StoreResult<EntityIterator<C::Entity>> {
        let shard = self.collection.updatable_shard();
        let page = self.ds.find(self.collection.kind(), shard, opts).await?;
        let items = page
            .rows
            .iter()
            .map(|(_, bytes)| self.collection.decode(shard, bytes))
            .collect::<StoreResult<Vec<_>>>()?;
        Ok(EntityIterator {
            items: items.into_iter(),
            cursor: page.cursor,
        })
    }

    /// Every entity of the collection, following cursors
    pub async fn find_all(&self) -> StoreResult<Vec<C::Entity>> {
        let mut out = Vec::new();
        let mut opts = ListOptions::default().with_limit(500);
        loop {
            let mut page = self.find(&opts).await?;
            let cursor = page.cursor().to_string();
            let before = out.len();
            out.extend(&mut page);
            if cursor.is_empty() || out.len() == before {
                return Ok(out);
            }
            opts = opts.after(cursor);
        }
    }
}
