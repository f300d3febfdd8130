//! Document retrieval with a semantic cache in front
//!
//! `RagAdapter` answers a question from retrieved passages: it checks the
//! semantic cache first, and on a miss retrieves the top passages, asks the
//! reasoning engine for an answer grounded in them, and caches the result.

use async_trait::async_trait;
use reqwest::Client;
use sdk::errors::EngineError;
use sdk::types::{RetrievalResult, Source};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::{CacheLookup, InsertOutcome, SemanticCache};
use crate::llm::router::LLMRouter;
use crate::llm::Message;

pub const NO_DOCUMENTS_ANSWER: &str =
    "No documents loaded. Add documents to the search index and restart.";

#[async_trait]
pub trait RetrievalAdapter: Send + Sync {
    async fn answer(&self, query: &str) -> Result<RetrievalResult, EngineError>;
}

/// One retrieved passage
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedChunk {
    pub content: String,
    pub source: String,
    pub page: String,
}

#[async_trait]
pub trait DocumentRetriever: Send + Sync {
    /// The `top_k` passages most relevant to `query`, best first
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>, EngineError>;
}

/// Search service speaking `{"query", "top_k"}` -> `{"chunks": [...]}`
pub struct HttpDocumentRetriever {
    endpoint: String,
    client: Client,
}

impl HttpDocumentRetriever {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    chunks: Vec<SearchChunk>,
}

#[derive(Debug, Deserialize)]
struct SearchChunk {
    content: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    page: Value,
}

#[async_trait]
impl DocumentRetriever for HttpDocumentRetriever {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>, EngineError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "query": query, "top_k": top_k }))
            .send()
            .await
            .map_err(|e| EngineError::Network(format!("Search service unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::Capability(format!(
                "Search service error ({}): {}",
                status, text
            )));
        }

        let body: SearchResponse = response.json().await.map_err(|e| {
            EngineError::Capability(format!("Failed to parse search response: {}", e))
        })?;

        Ok(body
            .chunks
            .into_iter()
            .take(top_k)
            .map(|chunk| RetrievedChunk {
                content: chunk.content,
                source: chunk.source,
                page: match chunk.page {
                    Value::Null => String::new(),
                    Value::String(s) => s,
                    other => other.to_string(),
                },
            })
            .collect())
    }
}

pub struct RagAdapter {
    cache: Option<Arc<SemanticCache>>,
    retriever: Option<Arc<dyn DocumentRetriever>>,
    router: Arc<LLMRouter>,
    top_k: usize,
}

impl RagAdapter {
    pub fn new(router: Arc<LLMRouter>, top_k: usize) -> Self {
        Self {
            cache: None,
            retriever: None,
            router,
            top_k,
        }
    }

    pub fn with_cache(mut self, cache: Arc<SemanticCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn DocumentRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }
}

fn answer_prompt(context: &str, question: &str) -> String {
    format!(
        "Answer based on context. If unsure, say 'I don't know'.\n\nContext: {}\n\nQuestion: {}",
        context, question
    )
}

fn file_name(source: &str) -> String {
    Path::new(source)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| source.to_string())
}

#[async_trait]
impl RetrievalAdapter for RagAdapter {
    async fn answer(&self, query: &str) -> Result<RetrievalResult, EngineError> {
        if let Some(cache) = &self.cache {
            match cache.lookup(query).await {
                CacheLookup::Hit(hit) => {
                    return Ok(RetrievalResult::answered(
                        query,
                        hit.entry.answer,
                        hit.entry.sources,
                        true,
                    ));
                }
                CacheLookup::Miss(reason) => {
                    info!("CACHE MISS | running retrieval ({:?})", reason);
                }
            }
        }

        let Some(retriever) = &self.retriever else {
            return Ok(RetrievalResult::answered(
                query,
                NO_DOCUMENTS_ANSWER,
                vec![],
                false,
            ));
        };

        let chunks = retriever.retrieve(query, self.top_k).await?;
        debug!("Retrieved {} chunks", chunks.len());

        let context = chunks
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let (completion, provider) = self
            .router
            .call(&[Message::user(answer_prompt(&context, query))])
            .await
            .map_err(|e| EngineError::LLMProvider(e.to_string()))?;
        debug!("Answer generated by {}", provider);

        let answer = completion.content.trim().to_string();
        let sources: Vec<Source> = chunks
            .iter()
            .map(|c| Source::new(file_name(&c.source), c.page.clone()))
            .collect();

        if let Some(cache) = &self.cache {
            let contexts = chunks.into_iter().map(|c| c.content).collect();
            if let InsertOutcome::Failed(reason) =
                cache.insert(query, &answer, contexts, sources.clone()).await
            {
                debug!("Answer not cached: {}", reason);
            }
        }

        Ok(RetrievalResult::answered(query, answer, sources, false))
    }
}
