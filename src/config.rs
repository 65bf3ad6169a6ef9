//! Runtime configuration for the streaming attention context manager.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. All construction parameters that drive the
//! manager's cache/selection/assembly behavior live in `ManagerConfig`.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{ManagerError, ManagerResult};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "streaming-attn-ctx", about = "Streaming long-context attention manager")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: String,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Eviction/caching strategy for committed blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// Evict the least-recently-accessed resident block.
    Lru,
    /// Evict the block resident the longest (load-time order).
    Fifo,
    /// Evict the resident block with the lowest accumulated attention score.
    LruS,
}

impl Default for CacheStrategy {
    fn default() -> Self {
        CacheStrategy::Lru
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,

    /// Manager construction parameters.
    pub manager: ManagerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            manager: ManagerConfig::default(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Maximum concurrent requests.
    pub max_concurrent_requests: usize,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            max_concurrent_requests: 4,
            request_timeout_secs: 300,
        }
    }
}

/// Construction parameters for the streaming attention context manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Number of initial-prefix tokens retained verbatim.
    pub n_init: usize,

    /// Sliding-window size, also the key-bound of local attention.
    pub n_local: usize,

    /// Tokens per committed block.
    pub block_size: usize,

    /// Maximum resident blocks per unit.
    pub max_cached_block: usize,

    /// Blocks selected per chunk.
    pub topk: usize,

    /// Slots in the assembled buffer.
    pub max_calc_block: usize,

    /// Execution chunk size.
    pub exc_block_size: usize,

    /// If true, each (batch, head) is an independent unit.
    pub perhead: bool,

    /// Multiplicative decay applied to resident scores before each update.
    pub score_decay: f64,

    /// Number of top-scoring positions per block used to form its
    /// representative key.
    pub repr_topk: usize,

    /// Enable the persistent assembly buffer.
    pub use_buffer: bool,

    /// Eviction/caching policy.
    pub cache_strategy: CacheStrategy,

    /// Whether to request per-key scores from the global attention stage.
    pub calc_block_score: bool,

    /// If true, once the initial prefix is filled the global stage omits
    /// remainder keys.
    pub ignore_remainder: bool,

    /// Batched-topk super-chunk size (multiple of `exc_block_size`), or
    /// `None` to compute top-k per execution chunk.
    pub chunk_topk_calc: Option<usize>,

    /// Enable the two-stream (compute/global) pipeline.
    pub async_global_stream: bool,

    /// Head dimension of K/V/Q vectors.
    pub dim_head: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            n_init: 128,
            n_local: 4096,
            block_size: 128,
            max_cached_block: 32,
            topk: 8,
            max_calc_block: 16,
            exc_block_size: 512,
            perhead: false,
            score_decay: 0.95,
            repr_topk: 4,
            use_buffer: true,
            cache_strategy: CacheStrategy::Lru,
            calc_block_score: true,
            ignore_remainder: false,
            chunk_topk_calc: None,
            async_global_stream: true,
            dim_head: 128,
        }
    }
}

impl ManagerConfig {
    /// Validate the construction-parameter contract, returning
    /// `ManagerError::ConfigInvalid` on the first violation.
    pub fn validate(&self) -> ManagerResult<()> {
        if self.exc_block_size > self.n_local {
            return Err(ManagerError::config(format!(
                "exc_block_size ({}) must be <= n_local ({})",
                self.exc_block_size, self.n_local
            )));
        }
        if self.max_cached_block < self.topk {
            return Err(ManagerError::config(format!(
                "max_cached_block ({}) must be >= topk ({})",
                self.max_cached_block, self.topk
            )));
        }
        if self.max_calc_block < self.topk {
            return Err(ManagerError::config(format!(
                "max_calc_block ({}) must be >= topk ({})",
                self.max_calc_block, self.topk
            )));
        }
        if self.cache_strategy == CacheStrategy::LruS && !self.calc_block_score {
            return Err(ManagerError::config(
                "cache_strategy = lru-s requires calc_block_score = true".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.score_decay) {
            return Err(ManagerError::config(format!(
                "score_decay ({}) must be in [0, 1]",
                self.score_decay
            )));
        }
        if self.block_size == 0 || self.exc_block_size == 0 {
            return Err(ManagerError::config(
                "block_size and exc_block_size must be > 0".to_string(),
            ));
        }
        if let Some(chunk) = self.chunk_topk_calc {
            if chunk % self.exc_block_size != 0 {
                return Err(ManagerError::config(format!(
                    "chunk_topk_calc ({chunk}) must be a multiple of exc_block_size ({})",
                    self.exc_block_size
                )));
            }
        }
        if self.dim_head == 0 {
            return Err(ManagerError::config("dim_head must be > 0".to_string()));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for
    /// missing files.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.manager.validate()?;
        Ok(config)
    }
}
