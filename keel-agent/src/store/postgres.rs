//! PostgreSQL datastore backend

use super::memory::parse_cursor;
use super::{DataStore, ListOptions, RawPage, Shard, StoreError, StoreResult};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;

/// One `entities` table keyed by `(kind, shard, id)`
#[derive(Clone)]
pub struct PostgresDataStore {
    pool: PgPool,
}

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            seq BIGSERIAL UNIQUE,
            kind VARCHAR(64) NOT NULL,
            shard VARCHAR(16) NOT NULL,
            id VARCHAR(255) NOT NULL,
            data BYTEA NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (kind, shard, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_kind_seq ON entities(kind, shard, seq)")
        .execute(pool)
        .await?;

    tracing::info!("Datastore migrations completed");
    Ok(())
}

impl PostgresDataStore {
    /// Connect and make sure the schema exists
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = create_pool(database_url).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> StoreResult<Self> {
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl DataStore for PostgresDataStore {
    async fn create(&self, kind: &'static str, id: &str, shard: Shard, data: Vec<u8>) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO entities (kind, shard, id, data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (kind, shard, id) DO NOTHING
            "#,
        )
        .bind(kind)
        .bind(shard.as_str())
        .bind(id)
        .bind(data)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists {
                kind,
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn put(&self, kind: &'static str, id: &str, shard: Shard, data: Vec<u8>) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entities (kind, shard, id, data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (kind, shard, id)
            DO UPDATE SET data = EXCLUDED.data, updated_at = NOW()
            "#,
        )
        .bind(kind)
        .bind(shard.as_str())
        .bind(id)
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, kind: &'static str, id: &str, shard: Shard) -> StoreResult<Vec<u8>> {
        let row = sqlx::query("SELECT data FROM entities WHERE kind = $1 AND shard = $2 AND id = $3")
            .bind(kind)
            .bind(shard.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.get("data")),
            None => Err(StoreError::NotFound {
                kind,
                id: id.to_string(),
            }),
        }
    }

    async fn find(&self, kind: &'static str, shard: Shard, opts: &ListOptions) -> StoreResult<RawPage> {
        let after = parse_cursor(&opts.cursor)? as i64;
        let limit = if opts.limit == 0 { i64::MAX } else { opts.limit as i64 };

        let rows = sqlx::query(
            r#"
            SELECT seq, id, data FROM entities
            WHERE kind = $1 AND shard = $2 AND seq > $3
            ORDER BY seq ASC
            LIMIT $4
            "#,
        )
        .bind(kind)
        .bind(shard.as_str())
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let cursor = rows
            .last()
            .map(|row| row.get::<i64, _>("seq").to_string())
            .unwrap_or_default();
        Ok(RawPage {
            rows: rows
                .into_iter()
                .map(|row| (row.get("id"), row.get("data")))
                .collect(),
            cursor,
        })
    }
}
