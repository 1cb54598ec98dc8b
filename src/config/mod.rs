//! Global configuration for Malt.
//!
//! Settings that are about the machine rather than about any formula live
//! in `~/.malt/config.toml`: where the cellar and download cache sit, how
//! many formulas may build in parallel, and how often a transient network
//! failure is retried. Every field is optional; missing fields fall back
//! to defaults under the user's home directory.
//!
//! The config file location can be overridden with the `MALT_CONFIG`
//! environment variable or the `--config` CLI flag.
//!
//! ```toml
//! cellar_dir = "/opt/malt/cellar"
//! formula_dir = "/opt/malt/formulas"
//! max_jobs = 8
//! network_retries = 5
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::core::MaltError;

/// Environment variable overriding the config file path.
pub const CONFIG_ENV_VAR: &str = "MALT_CONFIG";

/// Resolved engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaltConfig {
    /// Installation root for kegs
    pub cellar_dir: PathBuf,
    /// Content-addressed download cache
    pub cache_dir: PathBuf,
    /// Directory of `<name>.toml` formula files
    pub formula_dir: PathBuf,
    /// Maximum number of formulas building concurrently
    pub max_jobs: usize,
    /// Retry ceiling for transient network failures
    pub network_retries: usize,
}

/// On-disk shape of the config file; everything optional.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    cellar_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    formula_dir: Option<PathBuf>,
    max_jobs: Option<usize>,
    network_retries: Option<usize>,
}

impl MaltConfig {
    /// The default config file path, honoring `MALT_CONFIG`.
    pub fn default_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::home_dir()?.join(".malt").join("config.toml"))
    }

    /// Load the config from the default location; a missing file yields
    /// pure defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load the config from an explicit path; a missing file yields pure
    /// defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content).map_err(|e| MaltError::ConfigError {
                message: format!("invalid config file {}: {e}", path.display()),
            })?
        } else {
            RawConfig::default()
        };
        Self::resolve(raw)
    }

    fn resolve(raw: RawConfig) -> Result<Self> {
        let base = Self::home_dir()?.join(".malt");
        Ok(Self {
            cellar_dir: raw.cellar_dir.unwrap_or_else(|| base.join("cellar")),
            cache_dir: raw.cache_dir.unwrap_or_else(|| base.join("cache").join("downloads")),
            formula_dir: raw.formula_dir.unwrap_or_else(|| base.join("formulas")),
            max_jobs: raw.max_jobs.unwrap_or_else(default_max_jobs).max(1),
            network_retries: raw.network_retries.unwrap_or(4).max(1),
        })
    }

    fn home_dir() -> Result<PathBuf> {
        dirs::home_dir().ok_or_else(|| {
            MaltError::ConfigError {
                message: "could not determine home directory".to_string(),
            }
            .into()
        })
    }
}

fn default_max_jobs() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZero::get)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MaltConfig::load_from(&dir.path().join("nope.toml")).unwrap();
        assert!(config.cellar_dir.ends_with(".malt/cellar"));
        assert!(config.max_jobs >= 1);
        assert_eq!(config.network_retries, 4);
    }

    #[test]
    fn test_partial_file_overrides_some_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_jobs = 2\ncellar_dir = \"/opt/malt/cellar\"\n").unwrap();

        let config = MaltConfig::load_from(&path).unwrap();
        assert_eq!(config.max_jobs, 2);
        assert_eq!(config.cellar_dir, PathBuf::from("/opt/malt/cellar"));
        // Untouched fields keep their defaults.
        assert!(config.formula_dir.ends_with(".malt/formulas"));
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_jobs = \"lots\"\n").unwrap();

        let err = MaltConfig::load_from(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MaltError>(),
            Some(MaltError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_zero_values_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_jobs = 0\nnetwork_retries = 0\n").unwrap();

        let config = MaltConfig::load_from(&path).unwrap();
        assert_eq!(config.max_jobs, 1);
        assert_eq!(config.network_retries, 1);
    }
}
