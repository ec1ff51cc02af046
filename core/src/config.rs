use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::graph::TraversalLimits;
use crate::indexer::IndexPolicy;
use crate::risk::RiskPolicy;

pub const CONFIG_FILE_NAME: &str = "riskgraph.toml";

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub indexing: IndexingConfig,
    pub criticality: CriticalityConfig,
    pub extraction: ExtractionConfig,
    pub traversal: TraversalConfig,
    pub risk: RiskConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IndexingConfig {
    pub extensions: Vec<String>,
    pub exclude: Vec<String>,
    pub max_file_size: u64,
    pub parallelism: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            extensions: ["c", "h", "cpp", "hpp", "rs", "py", "go", "ts", "js"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            exclude: [
                ".git/**",
                ".riskgraph/**",
                "**/target/**",
                "**/node_modules/**",
                "**/build/**",
                "**/__pycache__/**",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_file_size: 512 * 1024,
            parallelism: 4,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CriticalityConfig {
    pub critical_paths: Vec<String>,
    pub security_paths: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Extractor argv; the absolute file path is appended.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TraversalConfig {
    pub max_depth: usize,
    pub frontier_cap: usize,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        let limits = TraversalLimits::default();
        Self {
            max_depth: limits.max_depth,
            frontier_cap: limits.frontier_cap,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RiskConfig {
    pub history_window_days: i64,
    pub large_diff_lines: i64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        let policy = RiskPolicy::default();
        Self {
            history_window_days: policy.history_window_days,
            large_diff_lines: policy.large_diff_lines,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 3600 }
    }
}

// ---------------------------------------------------------------------------
// Loading and resolution
// ---------------------------------------------------------------------------

/// Everything the core consumes, already validated.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub index: IndexPolicy,
    pub extractor_command: Vec<String>,
    pub traversal: TraversalLimits,
    pub risk: RiskPolicy,
    pub cache_ttl_secs: i64,
}

impl Config {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("failed to parse configuration")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }

    /// `<root>/riskgraph.toml`, then `<user config dir>/riskgraph/riskgraph.toml`,
    /// then defaults.
    pub fn discover(root: &Path) -> Result<Self> {
        let user = dirs::config_dir().map(|d| d.join("riskgraph").join(CONFIG_FILE_NAME));
        for candidate in std::iter::once(root.join(CONFIG_FILE_NAME)).chain(user) {
            if candidate.is_file() {
                tracing::debug!(path = %candidate.display(), "loading configuration");
                return Self::load(&candidate);
            }
        }
        Ok(Self::default())
    }

    pub fn resolve(&self) -> Result<ResolvedConfig> {
        if self.indexing.parallelism == 0 {
            anyhow::bail!("indexing.parallelism must be at least 1");
        }
        if self.cache.ttl_secs < 0 {
            anyhow::bail!("cache.ttl_secs must not be negative");
        }

        let index = IndexPolicy::new(
            &self.indexing.extensions,
            &self.indexing.exclude,
            &self.criticality.critical_paths,
            &self.criticality.security_paths,
        )
        .context("invalid glob in configuration")?
        .with_max_file_size(self.indexing.max_file_size)
        .with_parallelism(self.indexing.parallelism);

        let traversal = TraversalLimits::new(self.traversal.max_depth, self.traversal.frontier_cap)
            .context("invalid [traversal] settings")?;

        let risk = RiskPolicy {
            history_window_days: self.risk.history_window_days,
            large_diff_lines: self.risk.large_diff_lines,
            traversal,
        };

        Ok(ResolvedConfig {
            index,
            extractor_command: self.extraction.command.clone(),
            traversal,
            risk,
            cache_ttl_secs: self.cache.ttl_secs,
        })
    }
}
