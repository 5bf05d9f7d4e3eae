//! Configuration for tiered-memory

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for the memory system
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// Embedding model name
    pub embedding_model: String,

    /// Embedding dimensions (1024 for multilingual-e5-large)
    pub embedding_dimensions: usize,

    /// Minimum inner-product score for a semantic match
    pub search_threshold: f32,

    /// Maximum number of semantic matches per tier
    pub search_top_k: usize,

    /// Number of turns returned by the recent window
    pub recent_window: usize,

    /// User turns with fewer words than this are stored verbatim as their summary
    pub summarize_min_words: usize,

    /// Facts rated at or above this are never re-scored
    pub eternal_rating: u8,

    /// Ratings at or above this count as important
    pub importance_threshold: u8,

    /// How often the offload/prune pipeline runs
    pub offload_interval: Duration,

    /// Rebuild the vector side from SQLite when a parity check fails at load
    pub repair_on_inconsistency: bool,

    /// Chat completions endpoint
    pub api_url: String,

    /// Primary API key
    pub api_key: Option<String>,

    /// Tried once when the primary key fails
    pub fallback_api_key: Option<String>,

    /// Model used for replies
    pub chat_model: String,

    /// Model used for summaries and fact extraction
    pub summary_model: String,

    /// Model used for importance ratings
    pub rating_model: String,

    /// Timeout for a single completion request
    pub request_timeout: Duration,

    /// System prompt for live replies
    pub system_prompt: String,

    /// HTTP server port
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tiered-memory");

        Self {
            data_dir,
            embedding_model: "intfloat/multilingual-e5-large".to_string(),
            embedding_dimensions: 1024,
            search_threshold: 0.3,
            search_top_k: 10,
            recent_window: 24,
            summarize_min_words: 12,
            eternal_rating: 9,
            importance_threshold: 6,
            offload_interval: Duration::from_secs(24 * 60 * 60),
            repair_on_inconsistency: true,
            api_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            api_key: None,
            fallback_api_key: None,
            chat_model: "openai/gpt-4o-mini".to_string(),
            summary_model: "openai/gpt-4o-mini".to_string(),
            rating_model: "openai/gpt-4o-mini".to_string(),
            request_timeout: Duration::from_secs(15),
            system_prompt: "You are a warm, attentive companion. Keep replies natural and concise."
                .to_string(),
            server_port: 8420,
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Defaults overlaid with `MEMORY_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = lookup("MEMORY_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("MEMORY_API_URL") {
            config.api_url = url;
        }
        config.api_key = lookup("MEMORY_API_KEY").filter(|k| !k.is_empty());
        config.fallback_api_key = lookup("MEMORY_FALLBACK_API_KEY").filter(|k| !k.is_empty());
        if let Some(model) = lookup("MEMORY_CHAT_MODEL") {
            config.chat_model = model;
        }
        if let Some(model) = lookup("MEMORY_SUMMARY_MODEL") {
            config.summary_model = model;
        }
        if let Some(model) = lookup("MEMORY_RATING_MODEL") {
            config.rating_model = model;
        }
        if let Some(prompt) = lookup("MEMORY_SYSTEM_PROMPT") {
            config.system_prompt = prompt;
        }
        if let Some(port) = lookup("MEMORY_PORT") {
            config.server_port = port
                .parse()
                .map_err(|_| Error::config(format!("MEMORY_PORT is not a port: {}", port)))?;
        }
        if let Some(secs) = lookup("MEMORY_OFFLOAD_INTERVAL_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                Error::config(format!("MEMORY_OFFLOAD_INTERVAL_SECS is not a number: {}", secs))
            })?;
            config.offload_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.embedding_dimensions == 0 {
            return Err(Error::config("embedding_dimensions must be positive"));
        }
        if self.importance_threshold > 10 || self.eternal_rating > 10 {
            return Err(Error::config("ratings are on a 0-10 scale"));
        }
        if self.offload_interval.is_zero() {
            return Err(Error::config("offload_interval must be positive"));
        }
        Ok(())
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("memory.db")
    }

    /// Get the path to the index vector file
    pub fn vector_path(&self) -> PathBuf {
        self.data_dir.join("index.vec")
    }

    /// Get the path to the index metadata file
    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("index.meta.json")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}
