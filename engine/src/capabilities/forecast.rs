//! Ticket-volume forecasting over HTTP
//!
//! The model is served behind an HTTP endpoint that accepts
//! `{"horizon_days": N, "start_date": "YYYY-MM-DD"}` and responds with
//! `{"forecast": [...]}`. When the payload has no start date the adapter
//! fills in today's date in the service timezone.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use sdk::errors::EngineError;
use sdk::types::{ForecastPayload, ForecastPoint, ForecastResult, MAX_HORIZON_DAYS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info};

#[async_trait]
pub trait ForecastAdapter: Send + Sync {
    /// Produce a daily forecast for the payload's horizon
    async fn forecast(&self, payload: &ForecastPayload) -> Result<ForecastResult, EngineError>;
}

pub struct HttpForecastAdapter {
    endpoint: String,
    timezone: Tz,
    client: Client,
}

impl HttpForecastAdapter {
    pub fn new(endpoint: impl Into<String>, timezone: Tz) -> Self {
        Self {
            endpoint: endpoint.into(),
            timezone,
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Today's date in the service timezone
    fn today(&self) -> String {
        Utc::now()
            .with_timezone(&self.timezone)
            .date_naive()
            .format("%Y-%m-%d")
            .to_string()
    }

    fn resolve_start_date(&self, payload: &ForecastPayload) -> Result<String, EngineError> {
        match &payload.start_date {
            Some(date) => {
                NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| {
                    EngineError::Capability(format!(
                        "start_date '{}' is not a YYYY-MM-DD date",
                        date
                    ))
                })?;
                Ok(date.clone())
            }
            None => Ok(self.today()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ForecastRequest<'a> {
    horizon_days: u32,
    start_date: &'a str,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    #[serde(default)]
    forecast: Vec<ForecastPoint>,
}

#[async_trait]
impl ForecastAdapter for HttpForecastAdapter {
    async fn forecast(&self, payload: &ForecastPayload) -> Result<ForecastResult, EngineError> {
        if payload.horizon_days == 0 || payload.horizon_days > MAX_HORIZON_DAYS {
            return Err(EngineError::Capability(format!(
                "horizon_days must be between 1 and {}, got {}",
                MAX_HORIZON_DAYS, payload.horizon_days
            )));
        }
        let start_date = self.resolve_start_date(payload)?;

        info!(
            "Calling forecast endpoint={} | start_date={} | horizon={}",
            self.endpoint, start_date, payload.horizon_days
        );

        let response = self
            .client
            .post(&self.endpoint)
            .json(&ForecastRequest {
                horizon_days: payload.horizon_days,
                start_date: &start_date,
            })
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("Forecast endpoint unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!("Forecast endpoint error ({}): {}", status, text);
            return Err(EngineError::Capability(format!(
                "Forecast endpoint error ({}): {}",
                status, text
            )));
        }

        let body: ForecastResponse = response.json().await.map_err(|e| {
            EngineError::Capability(format!("Failed to parse forecast response: {}", e))
        })?;

        info!("Forecast returned {} predictions", body.forecast.len());

        Ok(ForecastResult {
            payload_received: Some(payload.clone()),
            start_date: Some(start_date),
            forecast: body.forecast,
            error: None,
        })
    }
}
