use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub catalog: CatalogConfig,
    pub media: MediaConfig,
    pub archives: ArchiveConfig,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8080`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
        }
    }
}

fn default_http_listen() -> String {
    "0.0.0.0:8080".to_string()
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// Path to the JSON album catalog maintained by the admin backend.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Root directory that per-tier photo paths are resolved against.
    pub root: PathBuf,
}

// ---------------------------------------------------------------------------
// Archive generation and retention
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Directory holding in-progress and finished archives.
    pub staging_dir: PathBuf,
    /// Upper bound on simultaneously running builds.
    #[serde(default = "default_max_concurrent_builds")]
    pub max_concurrent_builds: usize,
    /// Lifetime (seconds) of an artifact measured from its creation.
    #[serde(default = "default_artifact_ttl")]
    pub artifact_ttl_secs: u64,
    /// Retention (seconds) granted after each successful download, on top of
    /// the creation TTL.
    #[serde(default = "default_download_grace")]
    pub download_grace_secs: u64,
    /// Builds are refused and old artifacts evicted below this many free bytes.
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,
    /// Minimum artifact age (seconds) before low-disk eviction may take it.
    #[serde(default = "default_min_eviction_age")]
    pub min_eviction_age_secs: u64,
    /// Interval (seconds) between retention sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// How long (seconds) a finished job record is kept for status polling.
    #[serde(default = "default_terminal_job_grace")]
    pub terminal_job_grace_secs: u64,
    /// Ceiling on the `wait` a caller may request when starting an archive.
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,
}

fn default_max_concurrent_builds() -> usize {
    1
}

fn default_artifact_ttl() -> u64 {
    3600
}

fn default_download_grace() -> u64 {
    3600
}

fn default_min_free_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_min_eviction_age() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_terminal_job_grace() -> u64 {
    300
}

fn default_max_wait() -> u64 {
    30
}

impl ArchiveConfig {
    /// Settings with every tunable at its default, rooted at `staging_dir`.
    pub fn with_staging_dir(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            max_concurrent_builds: default_max_concurrent_builds(),
            artifact_ttl_secs: default_artifact_ttl(),
            download_grace_secs: default_download_grace(),
            min_free_bytes: default_min_free_bytes(),
            min_eviction_age_secs: default_min_eviction_age(),
            sweep_interval_secs: default_sweep_interval(),
            terminal_job_grace_secs: default_terminal_job_grace(),
            max_wait_secs: default_max_wait(),
        }
    }

    pub fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.artifact_ttl_secs)
    }

    pub fn download_grace(&self) -> Duration {
        Duration::from_secs(self.download_grace_secs)
    }

    pub fn min_eviction_age(&self) -> Duration {
        Duration::from_secs(self.min_eviction_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn terminal_job_grace(&self) -> Duration {
        Duration::from_secs(self.terminal_job_grace_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("invalid config file: {}", path.display()))
}

fn parse_config(contents: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(contents).context("failed to parse YAML")?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    let archives = &config.archives;
    anyhow::ensure!(
        archives.max_concurrent_builds >= 1,
        "max_concurrent_builds must be at least 1"
    );
    anyhow::ensure!(
        archives.artifact_ttl_secs > 0,
        "artifact_ttl_secs must be greater than zero"
    );
    anyhow::ensure!(
        archives.sweep_interval_secs > 0,
        "sweep_interval_secs must be greater than zero"
    );
    anyhow::ensure!(
        archives.terminal_job_grace_secs > 0,
        "terminal_job_grace_secs must be greater than zero"
    );
    Ok(())
}
