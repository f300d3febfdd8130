//! Configuration management
//!
//! This module handles loading, validation, and management of the analyst
//! configuration. Configuration is stored in TOML format at
//! ~/.analyst/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **llm**: Reasoning engine providers and preferences
//! - **embedding**: Embedding provider used by the semantic cache
//! - **cache**: Similarity gate and expiry policy
//! - **agent**: Orchestration loop bounds
//! - **rate_limit**: Per-session request window
//! - **capabilities**: Endpoints of the forecast, retrieval and structured-data adapters
//!
//! # Examples
//!
//! ```no_run
//! use analyst_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Data dir: {:?}", config.core.data_dir);
//! println!("Similarity threshold: {}", config.cache.similarity_threshold);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Known reasoning engine providers
pub const PROVIDERS: &[&str] = &["ollama", "openai"];

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// LLM provider configuration
    pub llm: LLMConfig,

    /// Embedding provider configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Semantic response cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Orchestration loop configuration
    #[serde(default)]
    pub agent: AgentConfig,

    /// Session rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Capability adapter endpoints
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Default LLM provider (ollama, openai)
    pub default_provider: String,

    /// Timeout for a single provider call in seconds
    #[serde(default = "default_llm_timeout")]
    pub call_timeout_secs: u64,

    /// Ollama provider settings
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// OpenAI-compatible provider settings
    #[serde(default)]
    pub openai: OpenAIConfig,
}

/// Ollama provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL for Ollama API
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_ollama_model")]
    pub model: String,
}

/// OpenAI provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    /// Base URL for OpenAI API
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_openai_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_openai_key_env")]
    pub api_key_env: String,
}

/// Embedding provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider used for query embeddings (ollama, openai)
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// Embedding model name
    #[serde(default = "default_embedding_model")]
    pub model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
        }
    }
}

/// Semantic response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Minimum similarity for a cache hit (0.0 exclusive, 1.0 inclusive)
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Record lifetime in hours
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,

    /// Similarity index artifact, relative paths resolve under data_dir
    #[serde(default = "default_index_file")]
    pub index_file: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            ttl_hours: default_ttl_hours(),
            index_file: default_index_file(),
        }
    }
}

/// Orchestration loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum decision steps per query
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Deadline for each capability call in seconds
    #[serde(default = "default_capability_timeout")]
    pub call_timeout_secs: u64,

    /// Keep work map and step counter across queries of one session
    #[serde(default)]
    pub carry_work_across_queries: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            call_timeout_secs: default_capability_timeout(),
            carry_work_across_queries: false,
        }
    }
}

/// Fixed-window rate limit per session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Requests allowed per window
    #[serde(default = "default_max_requests")]
    pub max_requests: i64,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

/// Capability adapter configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CapabilitiesConfig {
    #[serde(default)]
    pub forecast: ForecastConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub structured: StructuredConfig,
}

/// Forecast endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// Prediction endpoint accepting `{horizon_days, start_date}`
    #[serde(default = "default_forecast_endpoint")]
    pub endpoint: String,

    /// IANA timezone used to resolve "today"
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            endpoint: default_forecast_endpoint(),
            timezone: default_timezone(),
        }
    }
}

/// Document retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Chunk search endpoint; retrieval answers "no documents" when unset
    #[serde(default)]
    pub search_endpoint: Option<String>,

    /// Chunks retrieved per query
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            search_endpoint: None,
            top_k: default_top_k(),
        }
    }
}

/// Structured-data endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredConfig {
    #[serde(default = "default_structured_endpoint")]
    pub endpoint: String,
}

impl Default for StructuredConfig {
    fn default() -> Self {
        Self {
            endpoint: default_structured_endpoint(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.analyst")
}

fn default_llm_timeout() -> u64 {
    60
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ollama_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_openai_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_embedding_provider() -> String {
    "ollama".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_similarity_threshold() -> f32 {
    0.92
}

fn default_ttl_hours() -> u64 {
    24
}

fn default_index_file() -> PathBuf {
    PathBuf::from("cache_index/index.json")
}

fn default_max_steps() -> u32 {
    5
}

fn default_capability_timeout() -> u64 {
    30
}

fn default_max_requests() -> i64 {
    10
}

fn default_window_secs() -> i64 {
    60
}

fn default_forecast_endpoint() -> String {
    "http://localhost:8080/invocations".to_string()
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

fn default_top_k() -> usize {
    4
}

fn default_structured_endpoint() -> String {
    "http://localhost:8081/query".to_string()
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
        }
    }
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            api_key_env: default_openai_key_env(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.analyst/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration file
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default_config();
        config.validate_and_process()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.analyst/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".analyst").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig {
                log_level: default_log_level(),
                data_dir: default_data_dir(),
            },
            llm: LLMConfig {
                default_provider: "ollama".to_string(),
                call_timeout_secs: default_llm_timeout(),
                ollama: OllamaConfig::default(),
                openai: OpenAIConfig::default(),
            },
            embedding: EmbeddingConfig::default(),
            cache: CacheConfig::default(),
            agent: AgentConfig::default(),
            rate_limit: RateLimitConfig::default(),
            capabilities: CapabilitiesConfig::default(),
        }
    }

    /// Path of the SQLite database
    pub fn db_path(&self) -> PathBuf {
        self.core.data_dir.join("analyst.db")
    }

    /// Path of the similarity index artifact
    pub fn index_path(&self) -> PathBuf {
        if self.cache.index_file.is_absolute() {
            self.cache.index_file.clone()
        } else {
            self.core.data_dir.join(&self.cache.index_file)
        }
    }

    /// Validate and process configuration
    ///
    /// This method:
    /// - Validates enumerations and numeric ranges
    /// - Expands ~ in the data directory
    /// - Creates the data directory if it doesn't exist
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if !PROVIDERS.contains(&self.llm.default_provider.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid default provider '{}'. Must be one of: {}",
                self.llm.default_provider,
                PROVIDERS.join(", ")
            )));
        }

        if !PROVIDERS.contains(&self.embedding.provider.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid embedding provider '{}'. Must be one of: {}",
                self.embedding.provider,
                PROVIDERS.join(", ")
            )));
        }

        let threshold = self.cache.similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(EngineError::Config(
                "similarity_threshold must be in (0.0, 1.0]".to_string(),
            ));
        }

        if self.cache.ttl_hours == 0 {
            return Err(EngineError::Config(
                "ttl_hours must be at least 1".to_string(),
            ));
        }

        if self.agent.max_steps == 0 {
            return Err(EngineError::Config(
                "max_steps must be at least 1".to_string(),
            ));
        }

        if self.rate_limit.max_requests < 1 || self.rate_limit.window_secs < 1 {
            return Err(EngineError::Config(
                "rate_limit max_requests and window_secs must be positive".to_string(),
            ));
        }

        if self
            .capabilities
            .forecast
            .timezone
            .parse::<chrono_tz::Tz>()
            .is_err()
        {
            return Err(EngineError::Config(format!(
                "Unknown timezone '{}'",
                self.capabilities.forecast.timezone
            )));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn minimal_toml(data_dir: &Path) -> String {
        format!(
            r#"
[core]
data_dir = "{}"

[llm]
default_provider = "ollama"
"#,
            data_dir.display()
        )
    }

    #[test]
    fn test_default_config_creation() {
        let config = Config::default_config();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.llm.default_provider, "ollama");
        assert_eq!(config.cache.similarity_threshold, 0.92);
        assert_eq!(config.cache.ttl_hours, 24);
        assert_eq!(config.agent.max_steps, 5);
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.capabilities.forecast.timezone, "America/New_York");
        assert_eq!(config.capabilities.retrieval.top_k, 4);
    }

    #[test]
    fn test_minimal_config_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let data_dir = temp_dir.path().join("data");
        let config = Config::from_toml_str(&minimal_toml(&data_dir)).unwrap();

        assert!(data_dir.is_dir());
        assert_eq!(config.db_path(), data_dir.join("analyst.db"));
        assert_eq!(config.index_path(), data_dir.join("cache_index/index.json"));
        assert!(!config.agent.carry_work_across_queries);
    }

    #[test]
    fn test_rejects_invalid_threshold() {
        let temp_dir = TempDir::new().unwrap();
        let toml = format!(
            "{}\n[cache]\nsimilarity_threshold = 1.5\n",
            minimal_toml(temp_dir.path())
        );
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("similarity_threshold"));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let temp_dir = TempDir::new().unwrap();
        let toml = minimal_toml(temp_dir.path()).replace("ollama", "bedrock");
        let err = Config::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_rejects_unknown_timezone() {
        let temp_dir = TempDir::new().unwrap();
        let toml = format!(
            "{}\n[capabilities.forecast]\ntimezone = \"Mars/Olympus\"\n",
            minimal_toml(temp_dir.path())
        );
        assert!(Config::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_absolute_index_file_is_kept() {
        let mut config = Config::default_config();
        config.cache.index_file = PathBuf::from("/srv/cache/index.json");
        assert_eq!(config.index_path(), PathBuf::from("/srv/cache/index.json"));
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let path = PathBuf::from("~/test");
        let expanded = expand_path(&path).unwrap();

        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        let expanded = expand_path(&path).unwrap();

        assert_eq!(expanded, path);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_config();
        let toml_string = toml::to_string(&config).unwrap();

        let deserialized: Config = toml::from_str(&toml_string).unwrap();
        assert_eq!(config.core.log_level, deserialized.core.log_level);
        assert_eq!(
            config.cache.similarity_threshold,
            deserialized.cache.similarity_threshold
        );
        assert_eq!(
            config.capabilities.forecast.endpoint,
            deserialized.capabilities.forecast.endpoint
        );
    }
}
