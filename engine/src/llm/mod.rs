//! LLM Provider Abstraction Layer
//!
//! This module provides a common interface for the reasoning engine behind the
//! orchestration loop and the embedding model behind the semantic cache. The
//! `LLMProvider` trait defines the chat contract, `EmbeddingProvider` the
//! embedding contract; both are implemented for Ollama and OpenAI-compatible
//! endpoints so the router and the cache work with either transparently.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod ollama;
pub mod openai;
pub mod router;

/// Result type for LLM operations
pub type Result<T> = std::result::Result<T, LLMError>;

/// Errors that can occur during LLM operations
#[derive(Debug, thiserror::Error)]
pub enum LLMError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Parse error: {0}")]
    ParseError(String),
}

/// Message in a conversation history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Role of the message sender (user, assistant, system)
    pub role: MessageRole,

    /// Content of the message
    pub content: String,
}

impl Message {
    /// Create a new user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create a new assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    /// Create a new system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// Token accounting reported by a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Text produced by a chat provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub content: String,

    #[serde(default)]
    pub usage: TokenUsage,
}

impl Completion {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: TokenUsage::default(),
        }
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = TokenUsage {
            input_tokens,
            output_tokens,
        };
        self
    }
}

/// LLM Provider trait that all chat providers must implement
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Returns the name of the provider (e.g., "ollama", "openai")
    fn name(&self) -> &str;

    /// Returns true if this is a local provider (e.g., Ollama), false for cloud providers
    fn is_local(&self) -> bool;

    /// Returns the estimated cost in USD for the given number of tokens
    /// Local providers should return 0.0
    fn estimated_cost(&self, tokens: usize) -> f64;

    /// Generate a completion for the conversation
    async fn generate(&self, messages: &[Message]) -> Result<Completion>;

    /// Check if the provider is currently healthy and available
    /// Default implementation returns true.
    async fn check_health(&self) -> bool {
        true
    }
}

/// Embedding provider used to address the semantic cache
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Extract the first JSON object from model output.
///
/// Handles multiple LLM output formats:
/// 1. Raw JSON: the whole content is one object
/// 2. Fenced JSON (with or without trailing text): ` ```json\n{...}\n``` `
/// 3. JSON embedded in prose: the first balanced `{...}` in the text
pub fn extract_json_object(content: &str) -> Option<serde_json::Value> {
    let trimmed = content.trim();

    // Pattern 1: Raw JSON
    if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    // Pattern 2: Extract from markdown code fences (even with trailing text)
    if let Some(inner) = extract_fenced_json(trimmed) {
        if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(inner.trim()) {
            return Some(value);
        }
    }

    // Pattern 3: Scan for a balanced object anywhere in the content
    let mut search_from = 0;
    while let Some(rel) = trimmed[search_from..].find('{') {
        let pos = search_from + rel;
        if let Some(json_str) = extract_balanced_json(&trimmed[pos..]) {
            if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(json_str) {
                return Some(value);
            }
        }
        search_from = pos + 1;
    }

    None
}

/// Extract the body of the first markdown code fence in the text.
///
/// Works even when there is trailing prose after the closing ```.
/// Returns `None` if no fenced block is found.
fn extract_fenced_json(content: &str) -> Option<&str> {
    let fence_start = content.find("```")?;
    let after_opening = &content[fence_start + 3..];

    // Skip the language tag line (e.g. "json\n")
    let body_start_rel = after_opening.find('\n')? + 1;
    let body_start = fence_start + 3 + body_start_rel;

    let closing = content[body_start..].find("```")?;
    let body_end = body_start + closing;

    if body_start >= body_end {
        return None;
    }

    Some(&content[body_start..body_end])
}

/// Extract a balanced JSON object starting at position 0 of `s`.
///
/// Counts `{` / `}` depth, respecting string literals, to find the
/// matching close brace.
fn extract_balanced_json(s: &str) -> Option<&str> {
    if !s.starts_with('{') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let user_msg = Message::user("Hello");
        assert_eq!(user_msg.role, MessageRole::User);
        assert_eq!(user_msg.content, "Hello");

        let assistant_msg = Message::assistant("Hi there");
        assert_eq!(assistant_msg.role, MessageRole::Assistant);

        let system_msg = Message::system("You are an orchestrator");
        assert_eq!(system_msg.role, MessageRole::System);
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::user("test");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"test"}"#);
        let deserialized: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, deserialized);
    }

    #[test]
    fn test_extract_raw_json() {
        let value = extract_json_object(r#"{"action": "FINISH", "reasoning": "done"}"#).unwrap();
        assert_eq!(value["action"], json!("FINISH"));
    }

    #[test]
    fn test_extract_fenced_json_with_trailing_text() {
        let content = "```json\n{\"action\": \"DELEGATE_RETRIEVAL\"}\n```\nLet me know!";
        let value = extract_json_object(content).unwrap();
        assert_eq!(value["action"], json!("DELEGATE_RETRIEVAL"));
    }

    #[test]
    fn test_extract_json_embedded_in_prose() {
        let content = r#"Sure. {"action": "FINISH", "final_answer": "Use {braces} freely"} done"#;
        let value = extract_json_object(content).unwrap();
        assert_eq!(value["final_answer"], json!("Use {braces} freely"));
    }

    #[test]
    fn test_extract_skips_non_json_braces() {
        let content = r#"The set {a, b} is small. {"action": "FINISH"}"#;
        let value = extract_json_object(content).unwrap();
        assert_eq!(value["action"], json!("FINISH"));
    }

    #[test]
    fn test_extract_no_json() {
        assert!(extract_json_object("This is just a regular response").is_none());
        assert!(extract_json_object("[1, 2, 3]").is_none());
    }
}
