//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - ask: Answer one query end to end
//! - cache stats / prune / lookup: Inspect and maintain the response cache
//! - doctor: Validate configuration and check dependencies
//!
//! It also owns the wiring that turns a `Config` into the running services,
//! so the binary and the integration tests build them the same way.

use anyhow::{Context, Result};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{AgentCore, Orchestrator, QueryResponse, SessionStore};
use crate::cache::{CacheLookup, CacheMiss, SemanticCache, SimilarityIndex, SqliteValueStore};
use crate::capabilities::{
    CapabilityTable, HttpDocumentRetriever, HttpForecastAdapter, HttpStructuredAdapter, RagAdapter,
};
use crate::config::Config;
use crate::db::Database;
use crate::llm::ollama::OllamaProvider;
use crate::llm::openai::OpenAIProvider;
use crate::llm::router::LLMRouter;
use crate::llm::{EmbeddingProvider, LLMProvider};
use crate::rate_limiter::RateLimiter;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

fn openai_key_present(config: &Config) -> bool {
    std::env::var(&config.llm.openai.api_key_env)
        .map(|key| !key.trim().is_empty())
        .unwrap_or(false)
}

/// Build the reasoning engine router from configuration
///
/// Ollama is always registered; OpenAI only when its API key variable is set.
pub fn build_router(config: &Config) -> LLMRouter {
    let mut providers: Vec<Box<dyn LLMProvider>> = Vec::new();

    providers.push(Box::new(OllamaProvider::new(
        config.llm.ollama.base_url.clone(),
        config.llm.ollama.model.clone(),
    )));

    if openai_key_present(config) {
        providers.push(Box::new(OpenAIProvider::new(config.llm.openai.clone())));
    } else {
        tracing::debug!(
            "{} not set, OpenAI provider disabled",
            config.llm.openai.api_key_env
        );
    }

    LLMRouter::new(providers, Arc::new(config.llm.clone()))
}

/// Build the embedding provider used by the semantic cache
pub fn build_embedder(config: &Config) -> Arc<dyn EmbeddingProvider> {
    match config.embedding.provider.as_str() {
        "openai" => Arc::new(
            OpenAIProvider::new(config.llm.openai.clone()).with_model(&config.embedding.model),
        ),
        _ => Arc::new(OllamaProvider::new(
            config.llm.ollama.base_url.clone(),
            config.embedding.model.clone(),
        )),
    }
}

/// Open the similarity index and value store behind the semantic cache
pub async fn build_cache(config: &Config, database: &Database) -> Result<Arc<SemanticCache>> {
    let index_path = config.index_path();
    let index = match SimilarityIndex::open(&index_path).await {
        Ok(index) => index,
        Err(e) => {
            tracing::warn!(
                "Failed to open similarity index at {}, caching in memory only: {}",
                index_path.display(),
                e
            );
            SimilarityIndex::in_memory()
        }
    };

    let store = Arc::new(SqliteValueStore::new(database.pool().clone()));
    let ttl = i64::try_from(config.cache.ttl_hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .context("cache.ttl_hours is out of range")?;

    Ok(Arc::new(SemanticCache::new(
        build_embedder(config),
        index,
        store,
        config.cache.similarity_threshold,
        ttl,
    )))
}

/// Assemble the agent core: router, capabilities, sessions and rate limiter
pub async fn build_agent(config: &Config, database: &Database) -> Result<AgentCore> {
    let router = Arc::new(build_router(config));
    let cache = build_cache(config, database).await?;

    let timezone = config
        .capabilities
        .forecast
        .timezone
        .parse::<chrono_tz::Tz>()
        .map_err(|e| anyhow::anyhow!("Invalid forecast timezone: {}", e))?;
    let forecast = Arc::new(HttpForecastAdapter::new(
        config.capabilities.forecast.endpoint.clone(),
        timezone,
    ));

    let mut rag = RagAdapter::new(Arc::clone(&router), config.capabilities.retrieval.top_k)
        .with_cache(cache);
    match &config.capabilities.retrieval.search_endpoint {
        Some(endpoint) => {
            rag = rag.with_retriever(Arc::new(HttpDocumentRetriever::new(endpoint.clone())));
        }
        None => tracing::warn!("No document search endpoint configured"),
    }

    let structured = Arc::new(HttpStructuredAdapter::new(
        config.capabilities.structured.endpoint.clone(),
    ));

    let capabilities = Arc::new(CapabilityTable::new(
        forecast,
        Arc::new(rag),
        structured,
        Duration::from_secs(config.agent.call_timeout_secs),
    ));

    let sessions = Arc::new(SessionStore::new(database.sessions()));
    let rate_limiter = Arc::new(RateLimiter::new(
        database.pool().clone(),
        config.rate_limit.max_requests,
        config.rate_limit.window_secs,
    ));

    let orchestrator = Orchestrator::new(router, config.agent.max_steps);

    Ok(
        AgentCore::new(orchestrator, capabilities, sessions, rate_limiter)
            .carry_work_across_queries(config.agent.carry_work_across_queries),
    )
}

/// Answer one query
pub async fn handle_ask(
    query: String,
    session_id: String,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let database = Database::new(&config.db_path())
        .await
        .context("Failed to open database")?;
    let agent = build_agent(config, &database).await?;

    let result = agent.process_query(&query, &session_id).await;
    database.close().await?;

    match result {
        Ok(response) => {
            print_response(&response, format)?;
            Ok(())
        }
        Err(e) => {
            match format {
                OutputFormat::Text => {
                    println!("✗ Query failed: {}", e);
                }
                OutputFormat::Json => {
                    let output = json!({
                        "status": "failed",
                        "error": e.to_string()
                    });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
            }
            Err(e)
        }
    }
}

fn print_response(response: &QueryResponse, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            println!("{}", response.answer);
            println!();
            println!("  Steps: {}", response.steps);
            println!("  Request: {}", response.request_id);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(response)?);
        }
    }
    Ok(())
}

/// Show index size and record counts
pub async fn handle_cache_stats(config: &Config, format: OutputFormat) -> Result<()> {
    let database = Database::new(&config.db_path())
        .await
        .context("Failed to open database")?;
    let cache = build_cache(config, &database).await?;
    let stats = cache.stats().await?;

    match format {
        OutputFormat::Text => {
            println!("Response cache");
            println!("  Index entries:   {}", stats.index_entries);
            match stats.dimension {
                Some(dimension) => println!("  Dimension:       {}", dimension),
                None => println!("  Dimension:       -"),
            }
            println!("  Live records:    {}", stats.live_records);
            println!("  Expired records: {}", stats.expired_records);
            println!("  Threshold:       {:.2}", stats.similarity_threshold);
            println!("  TTL:             {}h", stats.ttl_hours);
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

/// Delete expired records and their index entries
pub async fn handle_cache_prune(config: &Config, format: OutputFormat) -> Result<()> {
    let database = Database::new(&config.db_path())
        .await
        .context("Failed to open database")?;
    let cache = build_cache(config, &database).await?;
    let removed = cache.prune_expired().await?;

    match format {
        OutputFormat::Text => println!("Pruned {} expired cache records", removed),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&json!({ "pruned": removed }))?);
        }
    }

    Ok(())
}

/// Look up a query in the cache without running the loop
pub async fn handle_cache_lookup(query: String, config: &Config, format: OutputFormat) -> Result<()> {
    let database = Database::new(&config.db_path())
        .await
        .context("Failed to open database")?;
    let cache = build_cache(config, &database).await?;

    match (cache.lookup(&query).await, format) {
        (CacheLookup::Hit(hit), OutputFormat::Text) => {
            println!("HIT (similarity {:.3})", hit.similarity);
            println!("  Matched query: {}", hit.matched_query);
            println!("  Expires at:    {}", hit.entry.expires_at.to_rfc3339());
            println!();
            println!("{}", hit.entry.answer);
        }
        (CacheLookup::Hit(hit), OutputFormat::Json) => {
            let output = json!({
                "hit": true,
                "similarity": hit.similarity,
                "matched_query": hit.matched_query,
                "answer": hit.entry.answer,
                "sources": hit.entry.sources,
                "expires_at": hit.entry.expires_at.to_rfc3339(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        (CacheLookup::Miss(miss), OutputFormat::Text) => {
            println!("MISS ({})", describe_miss(&miss));
        }
        (CacheLookup::Miss(miss), OutputFormat::Json) => {
            let output = json!({ "hit": false, "reason": describe_miss(&miss) });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn describe_miss(miss: &CacheMiss) -> String {
    match miss {
        CacheMiss::EmptyIndex => "index is empty".to_string(),
        CacheMiss::BelowThreshold { similarity } => {
            format!("closest match similarity {:.3}", similarity)
        }
        CacheMiss::Dangling => "index entry had no stored record".to_string(),
        CacheMiss::Expired => "closest match expired".to_string(),
        CacheMiss::Unavailable(reason) => format!("cache unavailable: {}", reason),
    }
}

/// Validate configuration and check dependencies
///
/// This handler checks:
/// - Data directory
/// - Database connection
/// - Similarity index readability
/// - Reasoning engine provider health
pub async fn handle_doctor(config: &Config, format: OutputFormat) -> Result<()> {
    let mut issues = Vec::new();
    let mut checks: Vec<(String, String)> = Vec::new();

    // Check 1: Configuration validation
    // Config is already validated when loaded
    checks.push(("Configuration".to_string(), "Valid".to_string()));

    // Check 2: Data directory
    if config.core.data_dir.exists() {
        checks.push(("Data directory".to_string(), "Exists".to_string()));
    } else {
        checks.push(("Data directory".to_string(), "Missing".to_string()));
        issues.push(format!(
            "Data directory does not exist: {:?}",
            config.core.data_dir
        ));
    }

    // Check 3: Database
    match Database::new(&config.db_path()).await {
        Ok(database) => {
            checks.push(("Database connection".to_string(), "OK".to_string()));
            database.close().await.ok();
        }
        Err(e) => {
            checks.push(("Database connection".to_string(), "Failed".to_string()));
            issues.push(format!("Cannot open database: {}", e));
        }
    }

    // Check 4: Similarity index
    let index_path = config.index_path();
    match SimilarityIndex::open(&index_path).await {
        Ok(index) => {
            let entries = index.len().await;
            checks.push(("Similarity index".to_string(), format!("{} entries", entries)));
        }
        Err(e) => {
            checks.push(("Similarity index".to_string(), "Unreadable".to_string()));
            issues.push(format!("Cannot read {}: {}", index_path.display(), e));
        }
    }

    // Check 5: Providers
    let router = build_router(config);
    let health = router.check_health().await;
    if !health.iter().any(|(_, healthy)| *healthy) {
        issues.push("No reasoning engine provider is reachable.".to_string());
    }
    for (name, healthy) in health {
        let status = if healthy { "Available" } else { "Not available" };
        checks.push((format!("Provider {}", name), status.to_string()));
    }
    if !openai_key_present(config) {
        checks.push((
            "OpenAI API key".to_string(),
            format!("Not configured ({})", config.llm.openai.api_key_env),
        ));
    }

    match format {
        OutputFormat::Text => {
            println!("Analyst doctor");
            println!();
            for (name, status) in &checks {
                println!("  {:<22} {}", name, status);
            }
            println!();
            if issues.is_empty() {
                println!("✓ No issues found");
            } else {
                println!("Issues:");
                for issue in &issues {
                    println!("  ✗ {}", issue);
                }
            }
        }
        OutputFormat::Json => {
            let checks: Vec<_> = checks
                .iter()
                .map(|(name, status)| json!({ "check": name, "status": status }))
                .collect();
            let output = json!({
                "healthy": issues.is_empty(),
                "checks": checks,
                "issues": issues,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
