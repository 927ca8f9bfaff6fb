//! In-memory datastore for tests and single-node runs

use super::{DataStore, ListOptions, RawPage, Shard, StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone)]
struct Row {
    seq: u64,
    data: Vec<u8>,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    rows: HashMap<(&'static str, Shard, String), Row>,
}

/// HashMap-backed [`DataStore`]
#[derive(Debug, Default)]
pub struct MemoryDataStore {
    inner: RwLock<Inner>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_error<T>(_: T) -> StoreError {
    StoreError::Backend("memory store lock poisoned".into())
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn create(&self, kind: &'static str, id: &str, shard: Shard, data: Vec<u8>) -> StoreResult<()> {
        let mut inner = self.inner.write().map_err(lock_error)?;
        let key = (kind, shard, id.to_string());
        if inner.rows.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind,
                id: id.to_string(),
            });
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.rows.insert(key, Row { seq, data });
        Ok(())
    }

    async fn put(&self, kind: &'static str, id: &str, shard: Shard, data: Vec<u8>) -> StoreResult<()> {
        let mut inner = self.inner.write().map_err(lock_error)?;
        let key = (kind, shard, id.to_string());
        if let Some(row) = inner.rows.get_mut(&key) {
            row.data = data;
            return Ok(());
        }
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.rows.insert(key, Row { seq, data });
        Ok(())
    }

    async fn get(&self, kind: &'static str, id: &str, shard: Shard) -> StoreResult<Vec<u8>> {
        let inner = self.inner.read().map_err(lock_error)?;
        inner
            .rows
            .get(&(kind, shard, id.to_string()))
            .map(|row| row.data.clone())
            .ok_or_else(|| StoreError::NotFound {
                kind,
                id: id.to_string(),
            })
    }

    async fn find(&self, kind: &'static str, shard: Shard, opts: &ListOptions) -> StoreResult<RawPage> {
        let after = parse_cursor(&opts.cursor)?;
        let inner = self.inner.read().map_err(lock_error)?;

        let mut rows: Vec<(u64, String, Vec<u8>)> = inner
            .rows
            .iter()
            .filter(|((k, s, _), row)| *k == kind && *s == shard && row.seq > after)
            .map(|((_, _, id), row)| (row.seq, id.clone(), row.data.clone()))
            .collect();
        rows.sort_by_key(|(seq, _, _)| *seq);
        if opts.limit > 0 {
            rows.truncate(opts.limit);
        }

        let cursor = rows
            .last()
            .map(|(seq, _, _)| seq.to_string())
            .unwrap_or_default();
        Ok(RawPage {
            rows: rows.into_iter().map(|(_, id, data)| (id, data)).collect(),
            cursor,
        })
    }
}

/// Cursors are the insertion sequence of the last row returned
pub(super) fn parse_cursor(cursor: &str) -> StoreResult<u64> {
    if cursor.is_empty() {
        return Ok(0);
    }
    cursor.parse().map_err(|_| StoreError::InvalidArgument {
        kind: "cursor",
        message: format!("malformed cursor {cursor:?}"),
    })
}
