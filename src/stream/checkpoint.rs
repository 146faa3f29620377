//! Two-tier checkpoint storage for partition read positions.
//!
//! The short-term tier caches the exact position to resume from and expires
//! quickly. The long-term tier keeps the last durable marker for much longer
//! and is used to rebuild a position when the short-term entry is gone.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use tokio::time::Instant;
use tracing::debug;

use crate::error::CheckpointError;

use super::reader::PartitionReader;

/// Fast, expiring store for exact read positions.
#[async_trait]
pub trait ShortTermStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CheckpointError>;

    async fn set(&self, key: &str, position: &str, ttl: Duration) -> Result<(), CheckpointError>;

    async fn clear(&self, key: &str) -> Result<(), CheckpointError>;
}

/// Durable store for the last processed marker of a partition.
#[async_trait]
pub trait LongTermStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CheckpointError>;

    async fn set(&self, key: &str, marker: &str) -> Result<(), CheckpointError>;
}

/// Resolves and records partition read positions across both tiers.
#[derive(Clone)]
pub struct CheckpointStore {
    short_term: Arc<dyn ShortTermStore>,
    long_term: Arc<dyn LongTermStore>,
    short_term_ttl: Duration,
}

impl CheckpointStore {
    pub fn new(
        short_term: Arc<dyn ShortTermStore>,
        long_term: Arc<dyn LongTermStore>,
        short_term_ttl: Duration,
    ) -> Self {
        Self {
            short_term,
            long_term,
            short_term_ttl,
        }
    }

    /// Position to read from: the cached position, else the position after
    /// the durable marker, else the start of the partition.
    pub async fn resolve(
        &self,
        key: &str,
        reader: &dyn PartitionReader,
    ) -> Result<String, CheckpointError> {
        if let Some(position) = self.short_term.get(key).await? {
            debug!(key = key, position = %position, "Resuming from short-term checkpoint");
            return Ok(position);
        }

        if let Some(marker) = self.long_term.get(key).await? {
            debug!(key = key, marker = %marker, "Resuming after long-term marker");
            return Ok(reader.position_after(&marker));
        }

        debug!(key = key, "No checkpoint, starting from the beginning");
        Ok(reader.start_position())
    }

    /// Records the outcome of a read.
    ///
    /// `next_position == None` clears the short-term entry. The long-term
    /// marker is only written when the read produced one.
    pub async fn update(
        &self,
        key: &str,
        next_position: Option<&str>,
        durable_marker: Option<&str>,
    ) -> Result<(), CheckpointError> {
        match next_position {
            Some(position) => {
                self.short_term
                    .set(key, position, self.short_term_ttl)
                    .await?
            }
            None => self.short_term.clear(key).await?,
        }

        if let Some(marker) = durable_marker {
            self.long_term.set(key, marker).await?;
        }
        Ok(())
    }

    pub async fn short_term_position(&self, key: &str) -> Result<Option<String>, CheckpointError> {
        self.short_term.get(key).await
    }

    pub async fn long_term_marker(&self, key: &str) -> Result<Option<String>, CheckpointError> {
        self.long_term.get(key).await
    }
}

/// Short-term positions in Redis (`SET EX`).
#[derive(Clone)]
pub struct RedisShortTermStore {
    redis: ConnectionManager,
}

impl RedisShortTermStore {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl ShortTermStore for RedisShortTermStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CheckpointError> {
        let mut conn = self.redis.clone();
        let position: Option<String> = conn.get(key).await?;
        Ok(position)
    }

    async fn set(&self, key: &str, position: &str, ttl: Duration) -> Result<(), CheckpointError> {
        let mut conn = self.redis.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(position)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), CheckpointError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS partition_markers (
    partition_key   TEXT    NOT NULL PRIMARY KEY,
    marker          TEXT    NOT NULL,
    expires_at      INTEGER NOT NULL,
    updated_at      TEXT    NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_partition_markers_expiry ON partition_markers(expires_at);
"#;

/// Long-term markers in SQLite, kept for a fixed retention period.
#[derive(Clone)]
pub struct SqliteMarkerStore {
    pool: SqlitePool,
    retention: Duration,
}

impl SqliteMarkerStore {
    /// Opens (or creates) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>, retention: Duration) -> Result<Self, CheckpointError> {
        let path = path.as_ref().display().to_string();
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        let store = Self::init(pool, retention).await?;
        tracing::info!(path = %path, "Checkpoint database opened");
        Ok(store)
    }

    /// Opens a private in-memory database.
    pub async fn open_in_memory(retention: Duration) -> Result<Self, CheckpointError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // Every connection would get its own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        Self::init(pool, retention).await
    }

    async fn init(pool: SqlitePool, retention: Duration) -> Result<Self, CheckpointError> {
        sqlx::query(SCHEMA_SQL).execute(&pool).await?;
        let store = Self { pool, retention };

        let purged = store.purge_expired().await?;
        if purged > 0 {
            debug!(purged = purged, "Purged expired partition markers");
        }
        Ok(store)
    }

    /// Deletes markers past their retention. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64, CheckpointError> {
        let result = sqlx::query("DELETE FROM partition_markers WHERE expires_at <= ?1")
            .bind(now_secs())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LongTermStore for SqliteMarkerStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CheckpointError> {
        let row = sqlx::query(
            "SELECT marker FROM partition_markers WHERE partition_key = ?1 AND expires_at > ?2",
        )
        .bind(key)
        .bind(now_secs())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<String, _>("marker")))
    }

    async fn set(&self, key: &str, marker: &str) -> Result<(), CheckpointError> {
        let expires_at = now_secs() + self.retention.as_secs() as i64;
        sqlx::query(
            "INSERT INTO partition_markers (partition_key, marker, expires_at, updated_at)
             VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(partition_key) DO UPDATE SET
                marker = excluded.marker,
                expires_at = excluded.expires_at,
                updated_at = datetime('now')",
        )
        .bind(key)
        .bind(marker)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Value with an expiry on tokio's clock.
#[derive(Debug, Clone)]
struct Expiring {
    value: String,
    expires_at: Instant,
}

type ExpiringMap = Arc<Mutex<HashMap<String, Expiring>>>;

fn get_live(map: &ExpiringMap, key: &str) -> Option<String> {
    let mut entries = map.lock().unwrap_or_else(|e| e.into_inner());
    if entries
        .get(key)
        .is_some_and(|entry| entry.expires_at <= Instant::now())
    {
        entries.remove(key);
    }
    entries.get(key).map(|entry| entry.value.clone())
}

fn put(map: &ExpiringMap, key: &str, value: &str, ttl: Duration) {
    map.lock().unwrap_or_else(|e| e.into_inner()).insert(
        key.to_string(),
        Expiring {
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        },
    );
}

/// Process-local short-term store. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShortTermStore {
    entries: ExpiringMap,
}

impl InMemoryShortTermStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ShortTermStore for InMemoryShortTermStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CheckpointError> {
        Ok(get_live(&self.entries, key))
    }

    async fn set(&self, key: &str, position: &str, ttl: Duration) -> Result<(), CheckpointError> {
        put(&self.entries, key, position, ttl);
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), CheckpointError> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

/// Process-local long-term store with a retention period. Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryLongTermStore {
    entries: ExpiringMap,
    retention: Duration,
}

impl InMemoryLongTermStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: ExpiringMap::default(),
            retention,
        }
    }
}

#[async_trait]
impl LongTermStore for InMemoryLongTermStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CheckpointError> {
        Ok(get_live(&self.entries, key))
    }

    async fn set(&self, key: &str, marker: &str) -> Result<(), CheckpointError> {
        put(&self.entries, key, marker, self.retention);
        Ok(())
    }
}
