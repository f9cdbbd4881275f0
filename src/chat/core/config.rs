//! Configuration for the chat service.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::chat::core::errors::{ChatError, ChatResult};
use crate::llm::ollama_client::{DEFAULT_BASE_URL, DEFAULT_MODEL, normalize_base_url};

/// Environment variable for the inference server address.
pub const OLLAMA_URL_ENV: &str = "DRAFTER_OLLAMA_URL";
/// Environment variable for the model identifier.
pub const MODEL_ENV: &str = "DRAFTER_MODEL";
/// Environment variable for the context window, in turns.
pub const CONTEXT_LIMIT_ENV: &str = "DRAFTER_CONTEXT_LIMIT";
/// Environment variable for the `SQLite` history path.
pub const DB_PATH_ENV: &str = "DRAFTER_DB";
/// Environment variable for the HTTP port.
pub const PORT_ENV: &str = "DRAFTER_PORT";

/// Default number of most recent turns sent per generation.
pub const DEFAULT_CONTEXT_LIMIT: usize = 10;
/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 3000;

/// Top-level service configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Inference server base address.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Maximum number of most recent turns sent per request.
    pub context_limit: usize,
    /// `SQLite` file holding persisted history.
    pub sqlite_path: PathBuf,
    /// HTTP port for the collaborator API.
    pub port: u16,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            context_limit: DEFAULT_CONTEXT_LIMIT,
            sqlite_path: PathBuf::from("drafter_chat.sqlite"),
            port: DEFAULT_PORT,
        }
    }
}

impl ChatConfig {
    /// Load configuration from the process environment, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// Unparseable numeric values fall back to their defaults.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            base_url: lookup(OLLAMA_URL_ENV)
                .map_or(defaults.base_url, |raw| normalize_base_url(&raw)),
            model: lookup(MODEL_ENV)
                .map(|raw| raw.trim().to_string())
                .filter(|model| !model.is_empty())
                .unwrap_or(defaults.model),
            context_limit: lookup(CONTEXT_LIMIT_ENV)
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(defaults.context_limit),
            sqlite_path: lookup(DB_PATH_ENV).map_or(defaults.sqlite_path, PathBuf::from),
            port: lookup(PORT_ENV)
                .and_then(|raw| raw.trim().parse().ok())
                .unwrap_or(defaults.port),
        }
    }

    /// Validate configuration invariants.
    ///
    /// # Errors
    /// Returns an error if any value is out of range or invalid.
    pub fn validate(&self) -> ChatResult<()> {
        if self.context_limit == 0 {
            return Err(ChatError::InvalidConfig(
                "context_limit must be > 0".to_string(),
            ));
        }

        if self.model.trim().is_empty() {
            return Err(ChatError::InvalidConfig(
                "model must not be empty".to_string(),
            ));
        }

        Url::parse(&self.base_url)?;
        Ok(())
    }
}
