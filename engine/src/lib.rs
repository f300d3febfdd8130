//! Analyst Engine Library
//!
//! This library provides the core functionality of the analyst engine.
//! It is used by both the main binary and integration tests.

/// Configuration management module
pub mod config;

/// Database persistence module
pub mod db;

/// Rate limiting module
pub mod rate_limiter;

/// LLM provider abstraction layer
pub mod llm;

/// Semantic response cache
pub mod cache;

/// Capability adapters and dispatch
pub mod capabilities;

/// Agent orchestration loop
pub mod agent;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
