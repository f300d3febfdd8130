//! Value store behind the semantic cache
//!
//! Records are addressed by the query fingerprint and carry their own expiry.
//! Writes overwrite on key; readers decide expiry against their own clock.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sdk::errors::EngineError;
use sdk::types::Source;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// Cached answer for one normalised query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub query: String,
    pub answer: String,
    /// Retrieved passages the answer was generated from
    pub contexts: Vec<String>,
    pub sources: Vec<Source>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// A record is expired from `expires_at` onwards
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Live/expired record counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub live: u64,
    pub expired: u64,
}

#[async_trait]
pub trait ValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, EngineError>;

    /// Insert or overwrite the record for `entry.key`
    async fn put(&self, entry: &CacheEntry) -> Result<(), EngineError>;

    /// Returns whether a record was deleted
    async fn delete(&self, key: &str) -> Result<bool, EngineError>;

    /// Delete every record expired at `now`, returning their keys
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, EngineError>;

    async fn counts(&self, now: DateTime<Utc>) -> Result<StoreCounts, EngineError>;
}

/// `ValueStore` on the engine's SQLite database (`cache_entries` table)
pub struct SqliteValueStore {
    pool: SqlitePool,
}

impl SqliteValueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn store_err(context: &str) -> impl Fn(sqlx::Error) -> EngineError + '_ {
    move |e| EngineError::ValueStore(format!("{}: {}", context, e))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, EngineError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| EngineError::ValueStore(format!("Invalid timestamp {}", ms)))
}

#[async_trait]
impl ValueStore for SqliteValueStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, EngineError> {
        let row = sqlx::query(
            "SELECT cache_key, query, answer, contexts, sources, created_at, expires_at
             FROM cache_entries WHERE cache_key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err("Failed to read cache entry"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let contexts: String = row.get("contexts");
        let sources: String = row.get("sources");
        let parse_err =
            |e: serde_json::Error| EngineError::ValueStore(format!("Corrupt cache entry {}: {}", key, e));

        Ok(Some(CacheEntry {
            key: row.get("cache_key"),
            query: row.get("query"),
            answer: row.get("answer"),
            contexts: serde_json::from_str(&contexts).map_err(parse_err)?,
            sources: serde_json::from_str(&sources).map_err(parse_err)?,
            created_at: from_millis(row.get("created_at"))?,
            expires_at: from_millis(row.get("expires_at"))?,
        }))
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), EngineError> {
        let contexts = serde_json::to_string(&entry.contexts)
            .map_err(|e| EngineError::ValueStore(e.to_string()))?;
        let sources = serde_json::to_string(&entry.sources)
            .map_err(|e| EngineError::ValueStore(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO cache_entries (cache_key, query, answer, contexts, sources, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(cache_key) DO UPDATE SET
                query = excluded.query,
                answer = excluded.answer,
                contexts = excluded.contexts,
                sources = excluded.sources,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&entry.key)
        .bind(&entry.query)
        .bind(&entry.answer)
        .bind(contexts)
        .bind(sources)
        .bind(entry.created_at.timestamp_millis())
        .bind(entry.expires_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(store_err("Failed to write cache entry"))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, EngineError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE cache_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(store_err("Failed to delete cache entry"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, EngineError> {
        let rows = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= ? RETURNING cache_key")
            .bind(now.timestamp_millis())
            .fetch_all(&self.pool)
            .await
            .map_err(store_err("Failed to purge expired cache entries"))?;

        Ok(rows.iter().map(|row| row.get("cache_key")).collect())
    }

    async fn counts(&self, now: DateTime<Utc>) -> Result<StoreCounts, EngineError> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN expires_at > ?1 THEN 1 ELSE 0 END), 0) AS live,
                COALESCE(SUM(CASE WHEN expires_at <= ?1 THEN 1 ELSE 0 END), 0) AS expired
             FROM cache_entries",
        )
        .bind(now.timestamp_millis())
        .fetch_one(&self.pool)
        .await
        .map_err(store_err("Failed to count cache entries"))?;

        let live: i64 = row.get("live");
        let expired: i64 = row.get("expired");
        Ok(StoreCounts {
            live: live as u64,
            expired: expired as u64,
        })
    }
}
