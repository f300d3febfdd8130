//! Rate limiting module
//!
//! Per-session fixed-window request limiting. Each source (a session id) gets
//! `max_requests` queries per window. The window opens at the first request
//! after the previous window elapsed; requests beyond the limit are rejected
//! until it does.
//!
//! # Database Tracking
//!
//! Window state lives in the `rate_limits` table, one row per source, and is
//! updated with a single upsert so concurrent requests for the same source
//! cannot both slip under the limit.

use anyhow::{Context, Result};
use sdk::errors::EngineError;
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Rate limiter for tracking and enforcing per-session query limits
pub struct RateLimiter {
    pool: SqlitePool,
    max_requests: i64,
    window_ms: i64,
}

impl RateLimiter {
    /// Create a new rate limiter allowing `max_requests` per `window_secs`
    pub fn new(pool: SqlitePool, max_requests: i64, window_secs: i64) -> Self {
        Self {
            pool,
            max_requests,
            window_ms: window_secs * 1000,
        }
    }

    /// Record a request for `source` and reject it if the window is full
    pub async fn check_and_record(&self, source: &str) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_millis() as i64;

        self.check_and_record_at(source, now).await
    }

    async fn check_and_record_at(&self, source: &str, now_ms: i64) -> Result<()> {
        // SET expressions see the row as it was before the update.
        // The count saturates at limit + 1 so rejected requests are not counted.
        let row = sqlx::query(
            r#"
            INSERT INTO rate_limits (source, window_start, count)
            VALUES (?1, ?2, 1)
            ON CONFLICT(source) DO UPDATE SET
                window_start = CASE WHEN ?2 - rate_limits.window_start >= ?3
                                    THEN ?2 ELSE rate_limits.window_start END,
                count = CASE WHEN ?2 - rate_limits.window_start >= ?3
                             THEN 1 ELSE MIN(rate_limits.count + 1, ?4 + 1) END
            RETURNING count
            "#,
        )
        .bind(source)
        .bind(now_ms)
        .bind(self.window_ms)
        .bind(self.max_requests)
        .fetch_one(&self.pool)
        .await
        .context("Failed to record rate limit entry")?;

        let count: i64 = row.get("count");
        debug!(
            "Rate limit check for {}: {}/{} requests",
            source, count, self.max_requests
        );

        if count > self.max_requests {
            warn!(
                "Rate limit exceeded for source {}: {}/{}",
                source, count, self.max_requests
            );
            return Err(EngineError::RateLimitExceeded {
                src: source.to_string(),
                count: count.min(self.max_requests),
                limit: self.max_requests,
                window: format!("{} seconds", self.window_ms / 1000),
            }
            .into());
        }

        Ok(())
    }

    /// Forget the window for a source
    pub async fn reset(&self, source: &str) -> Result<()> {
        sqlx::query("DELETE FROM rate_limits WHERE source = ?")
            .bind(source)
            .execute(&self.pool)
            .await
            .context("Failed to reset rate limit entry")?;
        Ok(())
    }
}
