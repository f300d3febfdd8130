//! Error types and handling
//!
//! This module provides the error types used throughout the analyst engine.
//! All errors implement the `AnalystErrorExt` trait which provides user-friendly
//! hints and indicates whether errors are recoverable.
//!
//! # Security
//!
//! User hints never echo the underlying message: they are static strings that
//! are safe to return from the query boundary.

use thiserror::Error;

/// Trait for analyst error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait AnalystErrorExt {
    /// Returns a user-friendly hint for the error
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors typically require a configuration change or restart.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Configuration**: Invalid or missing configuration
/// - **Database**: SQLite operation failures
/// - **LLM Provider**: reasoning engine / embedding failures
/// - **Cache**: similarity index or value store failures
/// - **Capability**: adapter failures (folded into results, rarely surfaced)
/// - **Rate Limiting**: session throttling
///
/// # Examples
///
/// ```
/// use sdk::errors::{AnalystErrorExt, EngineError};
///
/// let error = EngineError::EmptyQuery;
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
///
/// let fatal_error = EngineError::Config("missing [llm] section".to_string());
/// assert!(!fatal_error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // LLM provider errors
    #[error("LLM provider error: {0}")]
    LLMProvider(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    // Cache errors
    #[error("Similarity index error: {0}")]
    Index(String),

    #[error("Value store error: {0}")]
    ValueStore(String),

    // Capability errors
    #[error("Capability error: {0}")]
    Capability(String),

    #[error("Capability call timed out after {0}s")]
    CapabilityTimeout(u64),

    // Query boundary errors
    #[error("Query cannot be empty")]
    EmptyQuery,

    #[error("Rate limit exceeded for {src}: {count}/{limit} requests in {window}")]
    RateLimitExceeded {
        src: String,
        count: i64,
        limit: i64,
        window: String,
    },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnalystErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            // Configuration errors
            Self::Config(_) => "Check your config.toml file for errors",

            // Database errors
            Self::Database(_) => "Database operation failed. Try again shortly",

            // LLM provider errors
            Self::LLMProvider(_) => "LLM provider unavailable. Check your API keys and network",
            Self::Embedding(_) => "Embedding service unavailable",

            // Cache errors
            Self::Index(_) => "Response cache index is unavailable",
            Self::ValueStore(_) => "Response cache store is unavailable",

            // Capability errors
            Self::Capability(_) => "A backing service failed to answer",
            Self::CapabilityTimeout(_) => "A backing service took too long to answer",

            // Query boundary errors
            Self::EmptyQuery => "Query cannot be empty",
            Self::RateLimitExceeded { .. } => "Too many requests. Try again later",

            // Network errors
            Self::Network(_) => "Network operation failed. Check your connection",

            // Generic IO error
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Config(_) => false,

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}
