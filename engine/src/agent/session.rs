//! Conversation sessions and the per-query work map
//!
//! A session threads three pieces of state through the orchestration loop:
//! the message history (kept across queries), the work map of partial results
//! and the step counter (both reset at the start of each query unless the
//! configuration asks to carry work over).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use anyhow::Result;
use sdk::types::{ForecastResult, RetrievalResult, StructuredResult};

use crate::capabilities::{CapabilityResult, Delegation};
use crate::db::SessionRepository;
use crate::llm::{Message, MessageRole};

/// Partial results accumulated during one query.
///
/// Holds at most one pending delegation. Serializes to the flat snapshot the
/// reasoning engine sees, e.g.
/// `{"next_rag_query": "...", "forecast_result": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkMap {
    #[serde(flatten)]
    pending: Option<Delegation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast_result: Option<ForecastResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag_result: Option<RetrievalResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_result: Option<StructuredResult>,
}

impl WorkMap {
    pub fn pending(&self) -> Option<&Delegation> {
        self.pending.as_ref()
    }

    /// Mark `delegation` as pending, returning any marker it replaced
    pub fn set_pending(&mut self, delegation: Delegation) -> Option<Delegation> {
        self.pending.replace(delegation)
    }

    /// Clear and return the pending marker
    pub fn take_pending(&mut self) -> Option<Delegation> {
        self.pending.take()
    }

    /// Store a capability result in its slot, replacing an earlier one
    pub fn record(&mut self, result: CapabilityResult) {
        match result {
            CapabilityResult::Forecast(r) => self.forecast_result = Some(r),
            CapabilityResult::Retrieval(r) => self.rag_result = Some(r),
            CapabilityResult::Structured(r) => self.db_result = Some(r),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_none()
            && self.forecast_result.is_none()
            && self.rag_result.is_none()
            && self.db_result.is_none()
    }

    /// Structured snapshot handed to the reasoning engine
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    pub work: WorkMap,
    pub steps: u32,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
            work: WorkMap::default(),
            steps: 0,
        }
    }

    /// Start a new query: append it to the history and reset per-query state
    pub fn begin_query(&mut self, query: &str, carry_work: bool) {
        self.messages.push(Message::user(query));
        self.steps = 0;
        if carry_work {
            // A marker left by an interrupted query must not be dispatched later
            self.work.take_pending();
        } else {
            self.work = WorkMap::default();
        }
    }

    /// Content of the most recent user message
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
    }
}

/// Loads and saves sessions and serializes queries per session id
pub struct SessionStore {
    repo: SessionRepository,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(repo: SessionRepository) -> Self {
        Self {
            repo,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Exclusive access to `session_id` until the guard is dropped
    pub async fn lock(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Only the map holds an idle lock; holders and waiters keep a clone
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn load_or_create(&self, session_id: &str) -> Result<Session> {
        match self.repo.load(session_id).await? {
            Some(session) => {
                debug!(
                    "Loaded session {} with {} messages",
                    session_id,
                    session.messages.len()
                );
                Ok(session)
            }
            None => {
                debug!("Creating session {}", session_id);
                Ok(Session::new(session_id))
            }
        }
    }

    pub async fn save(&self, session: &Session) -> Result<()> {
        self.repo.save(session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use sdk::types::{ForecastPayload, Source};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_keys() {
        let mut work = WorkMap::default();
        assert_eq!(work.snapshot(), json!({}));

        work.set_pending(Delegation::Forecast(ForecastPayload::new(2)));
        work.record(CapabilityResult::Retrieval(RetrievalResult::answered(
            "What is NET_500?",
            "A gateway failure.",
            vec![Source::new("runbook.pdf", "3")],
            true,
        )));

        let snapshot = work.snapshot();
        assert_eq!(snapshot["next_forecasting_payload"], json!({"horizon_days": 2}));
        assert_eq!(snapshot["rag_result"]["cached"], json!(true));
        assert!(snapshot.get("forecast_result").is_none());
        assert!(snapshot.get("db_result").is_none());
    }

    #[test]
    fn test_at_most_one_pending() {
        let mut work = WorkMap::default();
        assert!(work
            .set_pending(Delegation::Retrieval("a".into()))
            .is_none());
        let replaced = work.set_pending(Delegation::Structured("b".into()));

        assert_eq!(replaced, Some(Delegation::Retrieval("a".into())));
        assert_eq!(work.pending(), Some(&Delegation::Structured("b".into())));

        let snapshot = work.snapshot();
        assert!(snapshot.get("next_rag_query").is_none());
        assert_eq!(snapshot["next_db_query"], json!("b"));

        assert_eq!(work.take_pending(), Some(Delegation::Structured("b".into())));
        assert!(work.is_empty());
    }

    #[test]
    fn test_work_map_json_round_trip() {
        let mut work = WorkMap::default();
        work.set_pending(Delegation::Retrieval("What is NET_500?".into()));
        work.record(CapabilityResult::Structured(StructuredResult::answered(
            "count",
            json!({"tickets": 3}),
        )));

        let encoded = serde_json::to_string(&work).unwrap();
        let decoded: WorkMap = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, work);

        let empty: WorkMap = serde_json::from_str("{}").unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_begin_query_resets_per_query_state() {
        let mut session = Session::new("s1");
        session.begin_query("first", false);
        session.steps = 3;
        session.work.set_pending(Delegation::Retrieval("q".into()));
        session.messages.push(Message::assistant("answer"));

        session.begin_query("second", false);
        assert_eq!(session.steps, 0);
        assert!(session.work.is_empty());
        assert_eq!(session.messages.len(), 3);
        assert_eq!(session.last_user_message(), Some("second"));
    }

    #[test]
    fn test_begin_query_can_carry_results() {
        let mut session = Session::new("s1");
        session.work.record(CapabilityResult::Structured(StructuredResult::answered(
            "count",
            json!(5),
        )));
        session.work.set_pending(Delegation::Retrieval("stale".into()));

        session.begin_query("follow-up", true);
        assert!(session.work.db_result.is_some());
        assert!(session.work.pending().is_none());
    }

    #[tokio::test]
    async fn test_store_creates_and_reloads() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("test.db")).await.unwrap();
        let store = SessionStore::new(db.sessions());

        let mut session = store.load_or_create("s1").await.unwrap();
        assert!(session.messages.is_empty());

        session.begin_query("What is NET_500?", false);
        session.steps = 2;
        store.save(&session).await.unwrap();

        assert_eq!(store.load_or_create("s1").await.unwrap(), session);
    }

    #[tokio::test]
    async fn test_lock_serializes_same_session() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("test.db")).await.unwrap();
        let store = Arc::new(SessionStore::new(db.sessions()));

        let guard = store.lock("s1").await;

        // A different session is not blocked
        let _other = tokio::time::timeout(Duration::from_millis(100), store.lock("s2"))
            .await
            .expect("other session should not block");

        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let _g = store.lock("s1").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_idle_session_locks_are_dropped() {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("test.db")).await.unwrap();
        let store = SessionStore::new(db.sessions());

        for i in 0..5 {
            let _guard = store.lock(&format!("s{}", i)).await;
        }
        let held = store.lock("busy").await;
        let _next = store.lock("next").await;

        let locks = store.locks.lock().await;
        let mut ids: Vec<&str> = locks.keys().map(String::as_str).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["busy", "next"]);
        drop(locks);
        drop(held);
    }
}
