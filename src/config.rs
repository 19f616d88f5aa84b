//! TOML configuration for the signalsift engine.
//!
//! Every section has compiled-in defaults, so an empty file (or no file at
//! all) yields a working configuration. The `[analysis]` section is the
//! template each new job's [`DetectorConfig`] is copied from.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::detect::aggregate::SeverityPolicy;
use crate::detect::semantic::SemanticParams;
use crate::detect::statistical::StatisticalParams;
use crate::detect::{Detector, Sensitivity};
use crate::features::{default_grouping, GroupComponent};
use crate::llm::LlmConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "SIGNALSIFT_CONFIG";

/// Widest burst window accepted: one week.
pub const MAX_WINDOW_SECS: u64 = 7 * 24 * 3600;

const LOCAL_CONFIG: &str = "signalsift.toml";
const SYSTEM_CONFIG: &str = "/etc/signalsift/signalsift.toml";

#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub analysis: DetectorConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .analysis
            .validate()
            .with_context(|| format!("config file {} rejected", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration, in order:
    /// 1. `explicit` (a `--config` flag); failure to load it is an error.
    /// 2. The path in `SIGNALSIFT_CONFIG`.
    /// 3. `./signalsift.toml`.
    /// 4. `/etc/signalsift/signalsift.toml`.
    /// 5. Compiled-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            candidates.push(PathBuf::from(env_path));
        }
        candidates.push(PathBuf::from(LOCAL_CONFIG));
        candidates.push(PathBuf::from(SYSTEM_CONFIG));

        for path in candidates {
            if !path.exists() {
                continue;
            }
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "config file could not be loaded, trying fallback");
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database path, or `:memory:`.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "signalsift.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Directory `jsonl` sources submitted over HTTP must live under.
    /// Unset means the API refuses file sources.
    pub data_root: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            data_root: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Jobs allowed to run at once; further submissions wait.
    pub max_concurrent: usize,
    /// Finished jobs kept in memory for status lookups; older ones are read from storage.
    pub retain_finished: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            retain_finished: crate::job::queue::DEFAULT_RETAINED,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit newline-delimited JSON instead of human-readable lines.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Detector configuration
// ---------------------------------------------------------------------------

/// Per-job analysis settings. Copied into the job and never changed while it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub sensitivity: Sensitivity,
    pub detectors: BTreeSet<Detector>,
    /// Records per semantic request.
    pub llm_batch_size: usize,
    /// Ordered components of the category key.
    pub grouping: Vec<GroupComponent>,
    pub statistical: StatisticalParams,
    pub semantic: SemanticParams,
    pub severity: SeverityPolicy,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            sensitivity: Sensitivity::default(),
            detectors: Detector::all().into_iter().collect(),
            llm_batch_size: 20,
            grouping: default_grouping(),
            statistical: StatisticalParams::default(),
            semantic: SemanticParams::default(),
            severity: SeverityPolicy::default(),
        }
    }
}

impl DetectorConfig {
    pub fn selects(&self, detector: Detector) -> bool {
        self.detectors.contains(&detector)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: String| Err(ConfigError(msg));

        if self.detectors.is_empty() {
            return fail("at least one detector must be selected".to_string());
        }
        if self.llm_batch_size == 0 {
            return fail("llm_batch_size must be at least 1".to_string());
        }
        if self.grouping.is_empty() {
            return fail("grouping needs at least one component".to_string());
        }

        let stat = &self.statistical;
        if stat.forest.trees == 0 || stat.forest.subsample < 2 {
            return fail("forest needs at least one tree and a subsample of 2 or more".to_string());
        }
        if !stat.outlier_thresholds.is_monotonic() || !stat.z_thresholds.is_monotonic() {
            return fail("thresholds must not increase from low to high sensitivity".to_string());
        }
        if stat.window_secs == 0 || stat.window_secs > MAX_WINDOW_SECS {
            return fail(format!("window_secs must be between 1 and {}, got {}", MAX_WINDOW_SECS, stat.window_secs));
        }
        if stat.baseline_windows_min == 0 || stat.baseline_windows < stat.baseline_windows_min {
            return fail(format!(
                "baseline_windows ({}) must be >= baseline_windows_min ({}) >= 1",
                stat.baseline_windows, stat.baseline_windows_min
            ));
        }
        if !(stat.min_stddev > 0.0) {
            return fail(format!("min_stddev must be positive, got {}", stat.min_stddev));
        }

        if self.semantic.excerpt_chars == 0 || self.semantic.call_timeout_secs == 0 {
            return fail("semantic excerpt_chars and call_timeout_secs must be positive".to_string());
        }
        self.semantic.retry.validate().map_err(ConfigError)?;
        self.severity.validate().map_err(ConfigError)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.analysis.validate().is_ok());
        assert_eq!(config.jobs.max_concurrent, 4);
        assert_eq!(config.jobs.retain_finished, crate::job::queue::DEFAULT_RETAINED);
        assert!(config.server.data_root.is_none());
        assert_eq!(config.analysis.detectors.len(), 3);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let toml_str = r#"
            [storage]
            path = ":memory:"

            [analysis]
            sensitivity = "high"
            detectors = ["statistical", "pattern"]
            grouping = ["source", "field:service"]

            [analysis.statistical]
            window_secs = 30
        "#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.storage.path, ":memory:");
        assert_eq!(config.analysis.sensitivity, Sensitivity::High);
        assert!(!config.analysis.selects(Detector::Semantic));
        assert_eq!(
            config.analysis.grouping,
            vec![GroupComponent::Source, GroupComponent::Field("service".into())]
        );
        assert_eq!(config.analysis.statistical.window_secs, 30);
        assert_eq!(config.analysis.statistical.baseline_windows, 10);
        assert_eq!(config.server.bind, "127.0.0.1:8080");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = DetectorConfig::default();
        config.llm_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.detectors.clear();
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.severity.medium = 0.9;
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.semantic.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = DetectorConfig::default();
        config.statistical.window_secs = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("window_secs"), "{}", err);
        config.statistical.window_secs = MAX_WINDOW_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signalsift.toml");
        std::fs::write(&path, "[logging]\njson = true\n").unwrap();
        let config = EngineConfig::load_or_default(Some(&path)).unwrap();
        assert!(config.logging.json);

        std::fs::write(&path, "[analysis]\nllm_batch_size = 0\n").unwrap();
        assert!(EngineConfig::load(&path).is_err());
    }
}
