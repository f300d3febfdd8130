//! Reasoning-engine decisions
//!
//! The model is asked for a JSON object naming the next action. `RawDecision`
//! is that object exactly as the model wrote it; `Decision` is the validated
//! form the loop acts on, with every delegate action carrying a usable
//! payload.

use chrono::NaiveDate;
use sdk::types::{ForecastPayload, MAX_HORIZON_DAYS};
use serde::Deserialize;
use serde_json::Value;

use crate::capabilities::Delegation;
use crate::llm::extract_json_object;

pub const FINISHED_ANSWER: &str = "Finished.";
pub const DEFAULT_RETRIEVAL_QUERY: &str = "What information do you need?";
pub const DEFAULT_STRUCTURED_QUERY: &str = "Get ticket count from today till 2 days";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Action {
    #[serde(rename = "FINISH")]
    Finish,
    #[serde(rename = "DELEGATE_FORECAST", alias = "CALL_FORECASTING")]
    DelegateForecast,
    #[serde(rename = "DELEGATE_RETRIEVAL", alias = "CALL_RAG")]
    DelegateRetrieval,
    #[serde(rename = "DELEGATE_STRUCTURED", alias = "CALL_DB")]
    DelegateStructured,
}

/// Decision object as produced by the model
#[derive(Debug, Clone, Deserialize)]
pub struct RawDecision {
    pub action: Action,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub final_answer: Option<String>,
    #[serde(default)]
    pub forecasting_payload: Option<Value>,
    #[serde(default)]
    pub rag_query: Option<String>,
    #[serde(default)]
    pub db_query: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Finish { reasoning: String, answer: String },
    Delegate { reasoning: String, delegation: Delegation },
}

#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("no JSON object in model output")]
    NoJson,
    #[error("decision does not match schema: {0}")]
    Schema(#[from] serde_json::Error),
}

impl Decision {
    /// Parse and validate model output
    pub fn parse(content: &str) -> Result<Self, DecisionError> {
        let value = extract_json_object(content).ok_or(DecisionError::NoJson)?;
        let raw: RawDecision = serde_json::from_value(value)?;
        Ok(raw.into())
    }

    /// Decision substituted when the model output cannot be used: ask the
    /// retrieval capability about the user's latest question.
    pub fn fallback(last_user_message: Option<&str>) -> Self {
        let query = last_user_message
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .unwrap_or(DEFAULT_RETRIEVAL_QUERY);
        Decision::Delegate {
            reasoning: "Model output was not a valid decision; retrieving instead.".to_string(),
            delegation: Delegation::Retrieval(query.to_string()),
        }
    }

    pub fn reasoning(&self) -> &str {
        match self {
            Decision::Finish { reasoning, .. } | Decision::Delegate { reasoning, .. } => reasoning,
        }
    }

    pub fn action_name(&self) -> &'static str {
        match self {
            Decision::Finish { .. } => "FINISH",
            Decision::Delegate { delegation, .. } => match delegation {
                Delegation::Forecast(_) => "DELEGATE_FORECAST",
                Delegation::Retrieval(_) => "DELEGATE_RETRIEVAL",
                Delegation::Structured(_) => "DELEGATE_STRUCTURED",
            },
        }
    }
}

impl From<RawDecision> for Decision {
    fn from(raw: RawDecision) -> Self {
        let reasoning = raw
            .reasoning
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "N/A".to_string());

        let delegation = match raw.action {
            Action::Finish => {
                return Decision::Finish {
                    reasoning,
                    answer: non_empty(raw.final_answer)
                        .unwrap_or_else(|| FINISHED_ANSWER.to_string()),
                };
            }
            Action::DelegateForecast => Delegation::Forecast(
                raw.forecasting_payload
                    .and_then(valid_forecast_payload)
                    .unwrap_or_default(),
            ),
            Action::DelegateRetrieval => Delegation::Retrieval(
                non_empty(raw.rag_query).unwrap_or_else(|| DEFAULT_RETRIEVAL_QUERY.to_string()),
            ),
            Action::DelegateStructured => Delegation::Structured(
                non_empty(raw.db_query).unwrap_or_else(|| DEFAULT_STRUCTURED_QUERY.to_string()),
            ),
        };

        Decision::Delegate {
            reasoning,
            delegation,
        }
    }
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.map(|t| t.trim().to_string()).filter(|t| !t.is_empty())
}

fn valid_forecast_payload(value: Value) -> Option<ForecastPayload> {
    let payload: ForecastPayload = serde_json::from_value(value).ok()?;
    if payload.horizon_days == 0 || payload.horizon_days > MAX_HORIZON_DAYS {
        return None;
    }
    if let Some(date) = &payload.start_date {
        NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
    }
    Some(payload)
}
