//! Configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main RVBBIT configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM provider configuration
    pub llm: LlmConfig,

    /// Bounded-pool sizes
    pub concurrency: ConcurrencyConfig,

    /// Log store and artifact locations
    pub storage: StorageConfig,

    /// SQL surface defaults
    pub sql: SqlConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .rvbbit.yml
        let local_config = PathBuf::from(".rvbbit.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/rvbbit/rvbbit.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("rvbbit").join("rvbbit.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Provider name (currently only "anthropic" supported)
    pub provider: String,

    /// Model identifier
    pub model: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Maximum tokens per response
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: 8192,
            timeout_ms: 300_000,
        }
    }
}

/// Bounded-pool sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Default cap on concurrent candidate branches per cell
    #[serde(rename = "max-candidates")]
    pub max_candidates: usize,

    /// Background job workers
    #[serde(rename = "background-workers")]
    pub background_workers: usize,

    /// Background queue capacity (submitters block beyond it)
    #[serde(rename = "background-queue")]
    pub background_queue: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_candidates: 4,
            background_workers: 2,
            background_queue: 64,
        }
    }
}

/// Log store and artifact locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Unified log database path; empty uses the default location
    #[serde(rename = "log-db")]
    pub log_db: String,

    /// Where images and oversized tool results are saved
    #[serde(rename = "artifact-dir")]
    pub artifact_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            log_db: String::new(),
            artifact_dir: std::env::temp_dir().join("rvbbit-artifacts"),
        }
    }
}

/// SQL surface defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    /// UDF result cache capacity (entries)
    #[serde(rename = "cache-capacity")]
    pub cache_capacity: usize,

    /// Default result cache TTL spec ("1d", "12h", "0" disables); empty = no expiry
    #[serde(rename = "cache-ttl")]
    pub cache_ttl: String,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 10_000,
            cache_ttl: String::new(),
        }
    }
}
