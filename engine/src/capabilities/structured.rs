//! Structured-data lookup over HTTP
//!
//! Sends `{"query": "..."}` to the configured endpoint. The service answers
//! `{"result": ...}` on success or `{"error": "..."}` when it cannot run the
//! query; any other JSON object is taken as the result itself.

use async_trait::async_trait;
use reqwest::Client;
use sdk::errors::EngineError;
use sdk::types::StructuredResult;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

#[async_trait]
pub trait StructuredDataAdapter: Send + Sync {
    async fn query(&self, query: &str) -> Result<StructuredResult, EngineError>;
}

pub struct HttpStructuredAdapter {
    endpoint: String,
    client: Client,
}

impl HttpStructuredAdapter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }
}

#[async_trait]
impl StructuredDataAdapter for HttpStructuredAdapter {
    async fn query(&self, query: &str) -> Result<StructuredResult, EngineError> {
        info!("Structured query: {}", query);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("Structured data service unreachable: {}", e)))?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            EngineError::Capability(format!("Failed to parse structured data response: {}", e))
        })?;

        if let Some(error) = body.get("error").and_then(|e| e.as_str()) {
            return Ok(StructuredResult::failed(query, error));
        }
        if !status.is_success() {
            return Err(EngineError::Capability(format!(
                "Structured data service error ({})",
                status
            )));
        }

        let result = match body {
            Value::Object(mut map) if map.contains_key("result") => {
                map.remove("result").unwrap_or(Value::Null)
            }
            other => other,
        };

        Ok(StructuredResult::answered(query, result))
    }
}
