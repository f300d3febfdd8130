/// Session persistence operations
///
/// Stores conversation sessions (message history, work map, step counter) so
/// a session survives process restarts. Messages and work are stored as JSON.
use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::agent::{Session, WorkMap};
use crate::llm::Message;

/// Session repository for database operations
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    /// Create a new session repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Load a session by id
    pub async fn load(&self, id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT id, messages, work, steps FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load session")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let messages: String = row.get("messages");
        let work: String = row.get("work");
        let steps: i64 = row.get("steps");

        Ok(Some(Session {
            id: row.get("id"),
            messages: serde_json::from_str::<Vec<Message>>(&messages)
                .with_context(|| format!("Corrupt message history for session {}", id))?,
            work: serde_json::from_str::<WorkMap>(&work)
                .with_context(|| format!("Corrupt work map for session {}", id))?,
            steps: u32::try_from(steps).unwrap_or(0),
        }))
    }

    /// Insert or update a session
    pub async fn save(&self, session: &Session) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
        let messages =
            serde_json::to_string(&session.messages).context("Failed to serialize messages")?;
        let work = serde_json::to_string(&session.work).context("Failed to serialize work map")?;

        sqlx::query(
            r#"
            INSERT INTO sessions (id, messages, work, steps, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                messages = excluded.messages,
                work = excluded.work,
                steps = excluded.steps,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.id)
        .bind(messages)
        .bind(work)
        .bind(session.steps as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to save session")?;

        Ok(())
    }

    /// Delete a session, returning whether it existed
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete session")?;
        Ok(result.rows_affected() > 0)
    }
}
