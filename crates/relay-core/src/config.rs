use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::security::UrlPolicy;

/// Top-level Relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub security: UrlPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How many flows may nest inside one another before execution fails.
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,
    /// Concurrency ceiling applied to batches that don't set their own.
    #[serde(default)]
    pub default_concurrency: Option<i64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: default_max_nesting_depth(),
            default_concurrency: None,
        }
    }
}

fn default_max_nesting_depth() -> usize { 32 }

/// Retry configuration for request stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default)]
    pub exponential: bool,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    /// Scale each computed delay by a random factor in 0.8..1.2.
    #[serde(default)]
    pub jitter: bool,
    /// Also retry on these response statuses.
    #[serde(default)]
    pub retry_on_status: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            exponential: false,
            max_delay_ms: None,
            jitter: false,
            retry_on_status: Vec::new(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_base_delay() -> u64 { 1000 }

/// Streaming defaults for request stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub accumulate: bool,
    /// Decode chunks as text in this encoding; raw bytes when unset.
    #[serde(default)]
    pub encoding: Option<String>,
    /// Split the body into lines instead of raw chunks.
    #[serde(default)]
    pub lines: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Headers sent with every request unless the stage overrides them.
    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            default_headers: BTreeMap::new(),
        }
    }
}

fn default_timeout_secs() -> u64 { 30 }
fn default_user_agent() -> String { format!("Relay/{}", env!("CARGO_PKG_VERSION")) }

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| RelayError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| RelayError::Config(e.to_string()))
    }

    /// Load config, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Err(RelayError::ConfigNotFound(p)) => {
                tracing::debug!(path = %p, "Config file not found, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Default config path under the user's home directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs_home().map(|h| h.join(".relay").join("config.toml"))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
