//! LLM Router
//!
//! Orders the configured chat providers and calls them with failover. The
//! user's configured default provider is always tried first; the remaining
//! providers follow with local ones ahead of cloud ones and cheaper ahead of
//! more expensive. Every attempt is bounded by `LLMConfig::call_timeout_secs`.

use super::{Completion, LLMError, LLMProvider, Message};
use crate::config::LLMConfig;
use std::sync::Arc;
use std::time::Duration;

/// LLM Router that fails over across the configured providers
pub struct LLMRouter {
    /// Available LLM providers
    providers: Vec<Box<dyn LLMProvider>>,

    /// LLM configuration
    config: Arc<LLMConfig>,
}

impl LLMRouter {
    /// Create a new LLM router
    ///
    /// # Arguments
    /// * `providers` - List of available LLM providers
    /// * `config` - LLM configuration
    pub fn new(providers: Vec<Box<dyn LLMProvider>>, config: Arc<LLMConfig>) -> Self {
        Self { providers, config }
    }

    /// Number of registered providers
    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// Estimate token count for the conversation
    ///
    /// Uses a simple heuristic: ~4 characters per token
    fn estimate_tokens(&self, messages: &[Message]) -> usize {
        let total_chars: usize = messages.iter().map(|m| m.content.len()).sum();
        total_chars / 4
    }

    /// Rank providers for a conversation of `estimated_tokens` tokens
    ///
    /// Returns a sorted list of providers (best first)
    pub fn rank_providers(&self, estimated_tokens: usize) -> Vec<&dyn LLMProvider> {
        let mut providers: Vec<&dyn LLMProvider> =
            self.providers.iter().map(|b| b.as_ref()).collect();

        let default_provider = &self.config.default_provider;
        let score = |p: &dyn LLMProvider| {
            let mut score = 0.0_f64;
            if p.name() == default_provider {
                score += 200.0;
            }
            if p.is_local() {
                score += 10.0;
            }
            // Lower cost = higher score
            score - p.estimated_cost(estimated_tokens) * 1000.0
        };

        // Stable sort keeps registration order between equal scores
        providers.sort_by(|a, b| {
            score(*b)
                .partial_cmp(&score(*a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        providers
    }

    /// Call LLM providers with automatic failover
    ///
    /// Attempts providers in ranked order, each under the configured timeout,
    /// and returns the first success together with the provider's name.
    pub async fn call(&self, messages: &[Message]) -> super::Result<(Completion, String)> {
        if self.providers.is_empty() {
            return Err(LLMError::ProviderUnavailable(
                "No LLM providers configured".to_string(),
            ));
        }

        let timeout_secs = self.config.call_timeout_secs;
        let ranked_providers = self.rank_providers(self.estimate_tokens(messages));
        let mut timed_out_everywhere = true;

        for provider in ranked_providers {
            tracing::debug!(
                "Attempting provider: {} (timeout: {}s)",
                provider.name(),
                timeout_secs
            );

            let result = tokio::time::timeout(
                Duration::from_secs(timeout_secs),
                provider.generate(messages),
            )
            .await;

            match result {
                Ok(Ok(completion)) => {
                    tracing::info!(
                        provider = provider.name(),
                        input_tokens = completion.usage.input_tokens,
                        output_tokens = completion.usage.output_tokens,
                        "Provider succeeded"
                    );
                    return Ok((completion, provider.name().to_string()));
                }
                Ok(Err(e)) => {
                    timed_out_everywhere = false;
                    tracing::warn!("Provider {} failed: {}", provider.name(), e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Provider {} timed out after {}s",
                        provider.name(),
                        timeout_secs
                    );
                }
            }
        }

        tracing::error!("All LLM providers exhausted");
        if timed_out_everywhere {
            Err(LLMError::Timeout)
        } else {
            Err(LLMError::ProviderUnavailable(
                "All LLM providers failed".to_string(),
            ))
        }
    }

    /// Check the health of all registered providers
    /// Returns a list of (provider_name, is_healthy)
    pub async fn check_health(&self) -> Vec<(&str, bool)> {
        let mut results = Vec::new();
        for provider in &self.providers {
            let is_healthy = provider.check_health().await;
            results.push((provider.name(), is_healthy));
        }
        results
    }
}
