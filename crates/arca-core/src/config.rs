use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use arca_storage::RetryConfig;
use arca_types::error::{ArcaError, Result};

/// Upper bound for an explicit worker count.
pub const MAX_WORKERS: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArcaConfig {
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
}

impl ArcaConfig {
    pub fn validate(&self) -> Result<()> {
        if self.repository.url.trim().is_empty() {
            return Err(ArcaError::Config("repository.url must not be empty".into()));
        }
        self.locks.validate()?;
        self.workers.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// `memory`, `file://<path>` or a plain filesystem path.
    pub url: String,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Age after which a lock from another host is considered abandoned.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// How often a held lock is rewritten while an operation runs.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
            refresh_interval_secs: default_refresh_interval_secs(),
        }
    }
}

impl LockConfig {
    pub fn stale_after(&self) -> chrono::Duration {
        i64::try_from(self.stale_after_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.stale_after_secs == 0 {
            return Err(ArcaError::Config(
                "locks.stale_after_secs must be greater than 0".into(),
            ));
        }
        if self.refresh_interval_secs == 0 || self.refresh_interval_secs >= self.stale_after_secs
        {
            return Err(ArcaError::Config(format!(
                "locks.refresh_interval_secs must be in [1, {}), got {}",
                self.stale_after_secs, self.refresh_interval_secs
            )));
        }
        Ok(())
    }
}

fn default_stale_after_secs() -> u64 {
    30 * 60 // 30 minutes
}

fn default_refresh_interval_secs() -> u64 {
    5 * 60 // 5 minutes
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of pool workers (0 = available parallelism).
    #[serde(default)]
    pub count: usize,
}

impl WorkerConfig {
    /// Resolve `count`, falling back to the number of available cores.
    pub fn effective_count(&self) -> usize {
        if self.count > 0 {
            return self.count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    fn validate(&self) -> Result<()> {
        if self.count > MAX_WORKERS {
            return Err(ArcaError::Config(format!(
                "workers.count must be in [0, {MAX_WORKERS}], got {}",
                self.count
            )));
        }
        Ok(())
    }
}

/// Load, parse and validate a YAML config file.
pub fn load_config(path: &Path) -> Result<ArcaConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ArcaError::Config(format!("cannot read '{}': {e}", path.display())))?;
    let config: ArcaConfig = serde_yaml::from_str(&contents)
        .map_err(|e| ArcaError::Config(format!("invalid config '{}': {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Commented starter config: a repository URL plus every tunable at its default.
pub fn minimal_config_template() -> &'static str {
    r#"# arca configuration file

repository:
  url: /path/to/repo
  # retry:
  #   max_retries: 3
  #   retry_delay_ms: 1000
  #   retry_max_delay_ms: 60000

# locks:
#   stale_after_secs: 1800
#   refresh_interval_secs: 300

# workers:
#   count: 0   # 0 = one per CPU core
"#
}
