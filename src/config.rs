//! Engine configuration
//!
//! All settings are read from environment variables with sensible defaults,
//! so the binary runs out of the box against local SQLite files. Validation
//! happens once at startup; invalid settings fail fast with a configuration
//! error rather than surfacing later inside a match request.

use crate::error::{KindredError, Result};
use crate::matching::recalibrate::WeightBounds;
use std::env;

/// Top-level configuration for the matching engine
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Goal-tree database settings
    pub database: DatabaseConfig,

    /// Vector index settings
    pub index: IndexConfig,

    /// Remote embedding provider settings
    pub embeddings: EmbeddingConfig,

    /// Scoring and ranking knobs
    pub matching: MatchingConfig,
}

impl EngineConfig {
    /// Load configuration from environment variables and validate it
    pub fn from_env() -> Result<Self> {
        let config = Self {
            database: DatabaseConfig::default(),
            index: IndexConfig::default(),
            embeddings: EmbeddingConfig::default(),
            matching: MatchingConfig::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check structural invariants of the assembled configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.path.is_empty() {
            return Err(config_error("KINDRED_DB_PATH cannot be empty"));
        }
        if self.database.tree_cache_size == 0 {
            return Err(config_error("KINDRED_TREE_CACHE_SIZE must be positive"));
        }
        if self.index.enabled {
            if self.index.path.is_empty() {
                return Err(config_error("KINDRED_INDEX_PATH cannot be empty"));
            }
            if self.index.dimensions == 0 {
                return Err(config_error("KINDRED_INDEX_DIMENSIONS must be positive"));
            }
            if self.index.top_k == 0 {
                return Err(config_error("KINDRED_INDEX_TOP_K must be positive"));
            }
        }
        if let Some(bounds) = self.matching.weight_bounds {
            if bounds.min < 0.0 || bounds.min > bounds.max {
                return Err(config_error(
                    "weight bounds must satisfy 0 <= KINDRED_WEIGHT_MIN <= KINDRED_WEIGHT_MAX",
                ));
            }
        }
        Ok(())
    }
}

/// Goal-tree database settings
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite database holding goal trees
    pub path: String,

    /// Capacity of the in-process LRU tree cache
    pub tree_cache_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: env::var("KINDRED_DB_PATH").unwrap_or_else(|_| "kindred.db".to_string()),
            tree_cache_size: env_or("KINDRED_TREE_CACHE_SIZE", 256),
        }
    }
}

/// Vector index settings
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Whether the fast path is available at all
    pub enabled: bool,

    /// Path to the sqlite-vec database
    pub path: String,

    /// Embedding dimensionality; must match the provider's output
    pub dimensions: usize,

    /// Nearest neighbors requested per query vector on the fast path
    pub top_k: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            enabled: env_or("KINDRED_INDEX_ENABLED", true),
            path: env::var("KINDRED_INDEX_PATH").unwrap_or_else(|_| "kindred_vec.db".to_string()),
            dimensions: env_or("KINDRED_INDEX_DIMENSIONS", 768),
            top_k: env_or("KINDRED_INDEX_TOP_K", 20),
        }
    }
}

/// Remote embedding provider settings
///
/// Embeddings are optional: with no provider configured the engine runs
/// entirely on the fallback similarity path.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Provider endpoint URL; empty disables embedding generation
    pub api_url: String,

    /// Provider API key
    pub api_key: String,

    /// Embedding model name
    pub model: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl EmbeddingConfig {
    /// Check whether a provider has been configured
    pub fn is_configured(&self) -> bool {
        !self.api_url.is_empty()
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api_url: env::var("KINDRED_EMBEDDING_API_URL").unwrap_or_default(),
            api_key: env::var("KINDRED_EMBEDDING_API_KEY").unwrap_or_default(),
            model: env::var("KINDRED_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small".to_string()),
            timeout_secs: env_or("KINDRED_EMBEDDING_TIMEOUT_SECS", 30),
        }
    }
}

/// Scoring and ranking knobs
#[derive(Debug, Clone, Default)]
pub struct MatchingConfig {
    /// Optional clamp applied to recalibrated weights; `None` preserves the
    /// historical unbounded behavior
    pub weight_bounds: Option<WeightBounds>,

    /// Worker count for slow-path scoring; 0 means one per available core
    pub parallelism: usize,
}

impl MatchingConfig {
    fn from_env() -> Result<Self> {
        let min = env::var("KINDRED_WEIGHT_MIN").ok();
        let max = env::var("KINDRED_WEIGHT_MAX").ok();
        let weight_bounds = match (min, max) {
            (Some(min), Some(max)) => {
                let min: f32 = min
                    .parse()
                    .map_err(|_| config_error("KINDRED_WEIGHT_MIN must be a number"))?;
                let max: f32 = max
                    .parse()
                    .map_err(|_| config_error("KINDRED_WEIGHT_MAX must be a number"))?;
                Some(WeightBounds { min, max })
            }
            (None, None) => None,
            _ => {
                return Err(config_error(
                    "KINDRED_WEIGHT_MIN and KINDRED_WEIGHT_MAX must be set together",
                ))
            }
        };

        Ok(Self {
            weight_bounds,
            parallelism: env_or("KINDRED_MATCH_PARALLELISM", 0),
        })
    }

    /// Effective slow-path worker count
    pub fn effective_parallelism(&self) -> usize {
        if self.parallelism > 0 {
            self.parallelism
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

fn config_error(msg: &str) -> KindredError {
    KindredError::Config(config::ConfigError::Message(msg.to_string()))
}

/// Read an env var and parse it, falling back to a default on absence or
/// parse failure
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
