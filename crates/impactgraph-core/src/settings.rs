use std::path::{Path, PathBuf};

use config as cfg;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{ImpactGraphError, Result};

/// Graph store and incremental updater settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphSettings {
    /// Optimistic commit attempts before failing with a conflict.
    pub max_update_retries: u32,
    /// Sleep between attempts, multiplied by the attempt number.
    pub retry_backoff_ms: u64,
    /// Number of past snapshots readers may pin.
    pub retained_versions: usize,
    /// Versions a tombstoned entity survives before it can be reclaimed.
    pub tombstone_grace_versions: u64,
    /// Minimum character-diff ratio for a retract+assert pair to count as a rename.
    pub rename_similarity_threshold: f64,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            max_update_retries: 5,
            retry_backoff_ms: 2,
            retained_versions: 64,
            tombstone_grace_versions: 16,
            rename_similarity_threshold: 0.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpactSettings {
    pub hop_limit: usize,
    /// Per-hop relevance multiplier, applied together with edge confidence.
    pub decay: f64,
    /// Entities below this relevance are reported as low confidence.
    pub relevance_floor: f64,
}

impl Default for ImpactSettings {
    fn default() -> Self {
        Self {
            hop_limit: 3,
            decay: 0.8,
            relevance_floor: 0.25,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    pub hop_limit: usize,
    pub decay: f64,
    pub max_items_per_domain: usize,
    pub max_inferred_seeds: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            hop_limit: 2,
            decay: 0.8,
            max_items_per_domain: 24,
            max_inferred_seeds: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub max_entries: usize,
    pub enable_metrics: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            enable_metrics: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Directory holding `snapshot.bin` and `changelog.jsonl`; in-memory when unset.
    pub data_dir: Option<PathBuf>,
    /// Write a checkpoint every N committed versions (0 disables).
    pub checkpoint_every: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            checkpoint_every: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Full,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`.
    pub level: String,
    pub format: LogFormat,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Compact,
            with_target: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub graph: GraphSettings,
    pub impact: ImpactSettings,
    pub context: ContextSettings,
    pub cache: CacheSettings,
    pub storage: StorageSettings,
    pub logging: LoggingConfig,
}

impl Settings {
    /// Layered load:
    /// 1. built-in defaults
    /// 2. `<dir>/default.toml`
    /// 3. `<dir>/<env>.toml`
    /// 4. `<dir>/local.toml`
    /// 5. environment variables (`IMPACTGRAPH__SECTION__KEY`)
    pub fn load(config_dir: Option<&Path>, env_name: &str) -> Result<Self> {
        let mut builder = cfg::Config::builder();
        if let Some(dir) = config_dir {
            debug!("Loading configuration from {}", dir.display());
            builder = builder
                .add_source(cfg::File::from(dir.join("default.toml")).required(false))
                .add_source(
                    cfg::File::from(dir.join(format!("{}.toml", env_name))).required(false),
                )
                .add_source(cfg::File::from(dir.join("local.toml")).required(false));
        }
        builder = builder.add_source(
            cfg::Environment::with_prefix("IMPACTGRAPH")
                .separator("__")
                .try_parsing(true),
        );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        info!(
            env = env_name,
            hop_limit = settings.impact.hop_limit,
            cache_entries = settings.cache.max_entries,
            "Configuration loaded"
        );
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: String) -> Result<()> {
            Err(ImpactGraphError::Config(msg))
        }

        if self.graph.max_update_retries == 0 {
            return invalid("graph.max_update_retries must be at least 1".into());
        }
        if self.graph.retained_versions == 0 {
            return invalid("graph.retained_versions must be at least 1".into());
        }
        let threshold = self.graph.rename_similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return invalid(format!(
                "graph.rename_similarity_threshold {} must be in (0, 1]",
                threshold
            ));
        }
        if self.impact.hop_limit == 0 {
            return invalid("impact.hop_limit must be at least 1".into());
        }
        for (name, decay) in [("impact.decay", self.impact.decay), ("context.decay", self.context.decay)] {
            if !(decay > 0.0 && decay <= 1.0) {
                return invalid(format!("{} {} must be in (0, 1]", name, decay));
            }
        }
        if !(0.0..=1.0).contains(&self.impact.relevance_floor) {
            return invalid(format!(
                "impact.relevance_floor {} must be in [0, 1]",
                self.impact.relevance_floor
            ));
        }
        if self.context.hop_limit == 0 {
            return invalid("context.hop_limit must be at least 1".into());
        }
        if self.context.max_items_per_domain == 0 {
            return invalid("context.max_items_per_domain must be at least 1".into());
        }
        if self.cache.max_entries == 0 {
            return invalid("cache.max_entries must be at least 1".into());
        }
        Ok(())
    }
}
