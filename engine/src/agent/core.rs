//! Agent Core
//!
//! Drives one query end to end. The driver:
//!
//! 1. Rejects empty queries and enforces the per-session rate limit
//! 2. Takes the session's lock and loads (or creates) the session
//! 3. Appends the query and resets per-query state
//! 4. Steps the orchestrator; each `Delegate` outcome is dispatched to its
//!    capability and the result recorded in the work map before stepping again
//! 5. Persists the session and returns the answer with the final work map
//!
//! # Limits
//!
//! - The orchestrator's step bound (default 5) terminates the loop
//! - Each capability call is bounded by the dispatch table's deadline
//! - Each reasoning-engine call is bounded by the router's timeout

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, Instrument};

use crate::capabilities::{CapabilityResult, CapabilityTable};
use crate::llm::Message;
use crate::rate_limiter::RateLimiter;
use crate::telemetry::generate_request_id;
use sdk::errors::EngineError;

use super::orchestrator::{Orchestrator, StepOutcome};
use super::session::SessionStore;

/// Answer to one query
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub query: String,
    pub answer: String,
    /// Work-map snapshot at the end of the query
    pub work: serde_json::Value,
    pub steps: u32,
    pub request_id: String,
}

/// Agent Core that runs queries through the orchestration loop
pub struct AgentCore {
    orchestrator: Orchestrator,
    capabilities: Arc<CapabilityTable>,
    sessions: Arc<SessionStore>,
    rate_limiter: Arc<RateLimiter>,
    carry_work: bool,
}

impl AgentCore {
    /// Create a new agent core
    pub fn new(
        orchestrator: Orchestrator,
        capabilities: Arc<CapabilityTable>,
        sessions: Arc<SessionStore>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            orchestrator,
            capabilities,
            sessions,
            rate_limiter,
            carry_work: false,
        }
    }

    /// Keep collected results from one query to the next in a session
    pub fn carry_work_across_queries(mut self, carry: bool) -> Self {
        self.carry_work = carry;
        self
    }

    /// Process a query in the context of `session_id`
    pub async fn process_query(&self, query: &str, session_id: &str) -> Result<QueryResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Err(EngineError::EmptyQuery.into());
        }

        self.rate_limiter.check_and_record(session_id).await?;

        let request_id = generate_request_id();
        let span = info_span!("query", request_id = %request_id, session_id = %session_id);

        async {
            info!("Processing query: {}", query);
            match self.run(query, session_id, &request_id).await {
                Ok(response) => Ok(response),
                Err(e) => {
                    error!("Query failed: {:#}", e);
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run(&self, query: &str, session_id: &str, request_id: &str) -> Result<QueryResponse> {
        let start = Instant::now();

        let _guard = self.sessions.lock(session_id).await;
        let mut session = self.sessions.load_or_create(session_id).await?;
        session.begin_query(query, self.carry_work);

        let answer = loop {
            match self.orchestrator.step(&mut session).await {
                StepOutcome::Finished(answer) => break answer,
                StepOutcome::Delegate(delegation) => {
                    session.work.take_pending();
                    let result = self.capabilities.dispatch(&delegation).await;
                    session
                        .messages
                        .push(Message::assistant(result_record(&result)));
                    session.work.record(result);
                }
            }
        };

        self.sessions.save(&session).await?;

        info!(
            steps = session.steps,
            latency_ms = start.elapsed().as_millis() as u64,
            "Query answered"
        );
        debug!("Answer: {}", answer);

        Ok(QueryResponse {
            query: query.to_string(),
            answer,
            work: session.work.snapshot(),
            steps: session.steps,
            request_id: request_id.to_string(),
        })
    }
}

/// Assistant message recording a capability result in the history
fn result_record(result: &CapabilityResult) -> String {
    let json = serde_json::to_string_pretty(&result.to_value()).unwrap_or_default();
    format!("{} capability returned:\n{}", result.capability(), json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{ForecastAdapter, RetrievalAdapter, StructuredDataAdapter};
    use crate::config::LLMConfig;
    use crate::db::Database;
    use crate::llm::router::LLMRouter;
    use crate::llm::{self, Completion, LLMProvider};
    use async_trait::async_trait;
    use sdk::types::{ForecastPayload, ForecastResult, RetrievalResult, StructuredResult};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Always(&'static str);

    #[async_trait]
    impl LLMProvider for Always {
        fn name(&self) -> &str {
            "always"
        }
        fn is_local(&self) -> bool {
            true
        }
        fn estimated_cost(&self, _tokens: usize) -> f64 {
            0.0
        }
        async fn generate(&self, _messages: &[Message]) -> llm::Result<Completion> {
            Ok(Completion::new(self.0))
        }
    }

    struct Stub;

    #[async_trait]
    impl ForecastAdapter for Stub {
        async fn forecast(&self, payload: &ForecastPayload) -> Result<ForecastResult, EngineError> {
            Ok(ForecastResult {
                payload_received: Some(payload.clone()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl RetrievalAdapter for Stub {
        async fn answer(&self, query: &str) -> Result<RetrievalResult, EngineError> {
            Ok(RetrievalResult::answered(query, "stub", vec![], false))
        }
    }

    #[async_trait]
    impl StructuredDataAdapter for Stub {
        async fn query(&self, query: &str) -> Result<StructuredResult, EngineError> {
            Ok(StructuredResult::answered(query, serde_json::json!(0)))
        }
    }

    async fn agent(response: &'static str, dir: &TempDir) -> AgentCore {
        let db = Database::new(&dir.path().join("test.db")).await.unwrap();
        let providers: Vec<Box<dyn LLMProvider>> = vec![Box::new(Always(response))];
        let router = Arc::new(LLMRouter::new(
            providers,
            Arc::new(LLMConfig {
                default_provider: "always".to_string(),
                call_timeout_secs: 5,
                ollama: Default::default(),
                openai: Default::default(),
            }),
        ));
        let stub = Arc::new(Stub);
        AgentCore::new(
            Orchestrator::new(router, 5),
            Arc::new(CapabilityTable::new(
                stub.clone(),
                stub.clone(),
                stub,
                Duration::from_secs(5),
            )),
            Arc::new(SessionStore::new(db.sessions())),
            Arc::new(RateLimiter::new(db.pool().clone(), 2, 60)),
        )
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let dir = TempDir::new().unwrap();
        let agent = agent(r#"{"action": "FINISH"}"#, &dir).await;

        let err = agent.process_query("   ", "s1").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::EmptyQuery)
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_applies_per_session() {
        let dir = TempDir::new().unwrap();
        let agent = agent(r#"{"action": "FINISH", "final_answer": "ok"}"#, &dir).await;

        agent.process_query("one", "s1").await.unwrap();
        agent.process_query("two", "s1").await.unwrap();
        let err = agent.process_query("three", "s1").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::RateLimitExceeded { .. })
        ));

        agent.process_query("one", "s2").await.unwrap();
    }

    #[tokio::test]
    async fn test_response_carries_request_id() {
        let dir = TempDir::new().unwrap();
        let agent = agent(r#"{"action": "FINISH", "final_answer": "ok"}"#, &dir).await;

        let response = agent.process_query(" hi ", "s1").await.unwrap();
        assert_eq!(response.query, "hi");
        assert_eq!(response.answer, "ok");
        assert_eq!(response.steps, 1);
        assert!(response.request_id.starts_with("req_"));
        assert_eq!(response.work, serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_delegation_result_lands_in_work() {
        let dir = TempDir::new().unwrap();
        let agent = agent(r#"{"action": "DELEGATE_STRUCTURED", "db_query": "count"}"#, &dir).await;

        let response = agent.process_query("count tickets", "s1").await.unwrap();
        assert_eq!(response.steps, 5);
        assert_eq!(response.answer, "Stopped after 5 steps to avoid looping.");
        assert_eq!(response.work["db_result"]["query"], serde_json::json!("count"));
        assert!(response.work.get("next_db_query").is_none());
    }
}
