//! Capability input/output types
//!
//! These are the wire contracts between the orchestration loop and the three
//! capability adapters. Adapters never fail past this boundary: a failure is
//! encoded in the result's `error` field so the next reasoning step can see it.

use serde::{Deserialize, Serialize};

/// Default forecast horizon when the reasoning engine supplies no payload
pub const DEFAULT_HORIZON_DAYS: u32 = 2;

/// Largest forecast horizon an adapter accepts
pub const MAX_HORIZON_DAYS: u32 = 365;

/// Input to the forecast capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastPayload {
    /// Number of days to forecast (1..=365)
    pub horizon_days: u32,

    /// Start date in `YYYY-MM-DD` form; the adapter uses "today" when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
}

impl ForecastPayload {
    /// Create a payload with no explicit start date
    pub fn new(horizon_days: u32) -> Self {
        Self {
            horizon_days,
            start_date: None,
        }
    }

    /// Set the start date
    pub fn starting(mut self, start_date: impl Into<String>) -> Self {
        self.start_date = Some(start_date.into());
        self
    }
}

impl Default for ForecastPayload {
    fn default() -> Self {
        Self::new(DEFAULT_HORIZON_DAYS)
    }
}

/// One predicted day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub day: i64,
    pub date: String,
    pub value: i64,
    pub lower_bound: i64,
    pub upper_bound: i64,
}

/// Output of the forecast capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ForecastResult {
    /// Payload the adapter actually received
    pub payload_received: Option<ForecastPayload>,

    /// Resolved start date
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,

    #[serde(default)]
    pub forecast: Vec<ForecastPoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ForecastResult {
    /// Build a failed result carrying the error message
    pub fn failed(payload: Option<ForecastPayload>, error: impl Into<String>) -> Self {
        Self {
            payload_received: payload,
            start_date: None,
            forecast: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A document reference backing a retrieval answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub source: String,
    pub page: String,
}

impl Source {
    pub fn new(source: impl Into<String>, page: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            page: page.into(),
        }
    }
}

/// Output of the retrieval capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query: String,
    pub answer: String,

    #[serde(default)]
    pub sources: Vec<Source>,

    /// True when the answer came from the semantic response cache
    #[serde(default)]
    pub cached: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl RetrievalResult {
    /// Build a successful result
    pub fn answered(
        query: impl Into<String>,
        answer: impl Into<String>,
        sources: Vec<Source>,
        cached: bool,
    ) -> Self {
        Self {
            query: query.into(),
            answer: answer.into(),
            sources,
            cached,
            error: false,
        }
    }

    /// Build a failed result; the answer carries the error text
    pub fn failed(query: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self {
            query: query.into(),
            answer: format!("Error: {}", error),
            sources: Vec::new(),
            cached: false,
            error: true,
        }
    }
}

/// Output of the structured-data capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredResult {
    pub query: String,

    /// Implementation-defined result object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StructuredResult {
    pub fn answered(query: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            query: query.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(query: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_forecast_payload() {
        let payload = ForecastPayload::default();
        assert_eq!(payload.horizon_days, 2);
        assert_eq!(payload.start_date, None);

        // start_date is omitted on the wire when absent
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, json!({"horizon_days": 2}));
    }

    #[test]
    fn test_forecast_payload_with_start_date() {
        let payload: ForecastPayload =
            serde_json::from_value(json!({"horizon_days": 5, "start_date": "2026-02-15"}))
                .unwrap();
        assert_eq!(payload, ForecastPayload::new(5).starting("2026-02-15"));
    }

    #[test]
    fn test_retrieval_error_shape() {
        let result = RetrievalResult::failed("What is NET_500?", "vector store offline");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["error"], json!(true));
        assert_eq!(value["answer"], json!("Error: vector store offline"));

        // error flag is omitted for successful answers
        let ok = RetrievalResult::answered("q", "a", vec![Source::new("kb.pdf", "3")], true);
        let value = serde_json::to_value(&ok).unwrap();
        assert!(value.get("error").is_none());
        assert_eq!(value["cached"], json!(true));
    }

    #[test]
    fn test_forecast_failure_keeps_payload() {
        let result = ForecastResult::failed(Some(ForecastPayload::new(3)), "endpoint down");
        assert!(result.is_error());
        assert!(result.forecast.is_empty());
        assert_eq!(result.payload_received.unwrap().horizon_days, 3);
    }

    #[test]
    fn test_structured_result() {
        let ok = StructuredResult::answered("tickets today", json!({"count": 42}));
        assert!(!ok.is_error());
        let err = StructuredResult::failed("tickets today", "db unreachable");
        assert!(err.is_error());
        assert_eq!(err.result, None);
    }
}
