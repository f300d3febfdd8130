//! Capability adapters and the dispatch table
//!
//! The orchestration loop never talks to a capability directly. It records a
//! `Delegation` in the work map and the driver hands it to
//! `CapabilityTable::dispatch`, which routes it to the matching adapter under
//! a deadline. Failures and timeouts come back as error-flagged results so the
//! reasoning engine can see them on its next step.

pub mod forecast;
pub mod retrieval;
pub mod structured;

pub use forecast::{ForecastAdapter, HttpForecastAdapter};
pub use retrieval::{
    DocumentRetriever, HttpDocumentRetriever, RagAdapter, RetrievalAdapter, RetrievedChunk,
};
pub use structured::{HttpStructuredAdapter, StructuredDataAdapter};

use sdk::errors::EngineError;
use sdk::types::{ForecastPayload, ForecastResult, RetrievalResult, StructuredResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The three capabilities a session can delegate to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Forecast,
    Retrieval,
    Structured,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Capability::Forecast => "forecasting",
            Capability::Retrieval => "rag",
            Capability::Structured => "db",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A request for one capability, carrying that capability's payload.
///
/// Serialized under the work-map key the reasoning engine sees, e.g.
/// `{"next_rag_query": "What is NET_500?"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Delegation {
    #[serde(rename = "next_forecasting_payload")]
    Forecast(ForecastPayload),

    #[serde(rename = "next_rag_query")]
    Retrieval(String),

    #[serde(rename = "next_db_query")]
    Structured(String),
}

impl Delegation {
    pub fn capability(&self) -> Capability {
        match self {
            Delegation::Forecast(_) => Capability::Forecast,
            Delegation::Retrieval(_) => Capability::Retrieval,
            Delegation::Structured(_) => Capability::Structured,
        }
    }

    /// Short human-readable form of the payload for logs and debug messages
    pub fn describe(&self) -> String {
        match self {
            Delegation::Forecast(payload) => match &payload.start_date {
                Some(date) => format!("horizon_days={}, start_date={}", payload.horizon_days, date),
                None => format!("horizon_days={}", payload.horizon_days),
            },
            Delegation::Retrieval(query) | Delegation::Structured(query) => query.clone(),
        }
    }
}

/// Outcome of dispatching a delegation
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityResult {
    Forecast(ForecastResult),
    Retrieval(RetrievalResult),
    Structured(StructuredResult),
}

impl CapabilityResult {
    pub fn capability(&self) -> Capability {
        match self {
            CapabilityResult::Forecast(_) => Capability::Forecast,
            CapabilityResult::Retrieval(_) => Capability::Retrieval,
            CapabilityResult::Structured(_) => Capability::Structured,
        }
    }

    /// The result as the JSON object stored in the work map
    pub fn to_value(&self) -> serde_json::Value {
        let value = match self {
            CapabilityResult::Forecast(r) => serde_json::to_value(r),
            CapabilityResult::Retrieval(r) => serde_json::to_value(r),
            CapabilityResult::Structured(r) => serde_json::to_value(r),
        };
        value.unwrap_or(serde_json::Value::Null)
    }

    /// Forecast points, cited sources, or 1 for a structured answer
    pub fn item_count(&self) -> usize {
        match self {
            CapabilityResult::Forecast(r) => r.forecast.len(),
            CapabilityResult::Retrieval(r) => r.sources.len(),
            CapabilityResult::Structured(r) => usize::from(r.result.is_some()),
        }
    }

    pub fn is_error(&self) -> bool {
        match self {
            CapabilityResult::Forecast(r) => r.is_error(),
            CapabilityResult::Retrieval(r) => r.error,
            CapabilityResult::Structured(r) => r.is_error(),
        }
    }
}

/// Routes delegations to the configured adapters
pub struct CapabilityTable {
    forecast: Arc<dyn ForecastAdapter>,
    retrieval: Arc<dyn RetrievalAdapter>,
    structured: Arc<dyn StructuredDataAdapter>,
    timeout: Duration,
}

impl CapabilityTable {
    pub fn new(
        forecast: Arc<dyn ForecastAdapter>,
        retrieval: Arc<dyn RetrievalAdapter>,
        structured: Arc<dyn StructuredDataAdapter>,
        timeout: Duration,
    ) -> Self {
        Self {
            forecast,
            retrieval,
            structured,
            timeout,
        }
    }

    /// Run the adapter for `delegation` and fold any failure into its result.
    pub async fn dispatch(&self, delegation: &Delegation) -> CapabilityResult {
        debug!(
            "Dispatching {} with payload: {}",
            delegation.capability(),
            delegation.describe()
        );
        let start = Instant::now();

        let result = match delegation {
            Delegation::Forecast(payload) => CapabilityResult::Forecast(
                match self.bounded(self.forecast.forecast(payload)).await {
                    Ok(result) => result,
                    Err(e) => ForecastResult::failed(Some(payload.clone()), e.to_string()),
                },
            ),
            Delegation::Retrieval(query) => CapabilityResult::Retrieval(
                match self.bounded(self.retrieval.answer(query)).await {
                    Ok(result) => result,
                    Err(e) => RetrievalResult::failed(query.clone(), e),
                },
            ),
            Delegation::Structured(query) => CapabilityResult::Structured(
                match self.bounded(self.structured.query(query)).await {
                    Ok(result) => result,
                    Err(e) => StructuredResult::failed(query.clone(), e.to_string()),
                },
            ),
        };

        if result.is_error() {
            warn!("Capability {} returned an error result", result.capability());
        } else {
            info!(
                capability = %result.capability(),
                items = result.item_count(),
                latency_ms = start.elapsed().as_millis() as u64,
                "Capability answered"
            );
        }

        result
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::CapabilityTimeout(self.timeout.as_secs())),
        }
    }
}
