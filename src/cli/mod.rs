//! Command-line interface for Malt.
//!
//! Each subcommand lives in its own module with its own argument struct and
//! execution logic, so commands can be tested independently and share only
//! what they actually have in common (loading the configuration and the
//! formula library).
//!
//! # Available commands
//!
//! - `build` - resolve, fetch, and install formulas (bottle fast path or
//!   source build)
//! - `test` - install formulas if needed and run their acceptance tests
//! - `info` - show a formula's metadata, dependencies, and install status
//! - `deps` - show a formula's resolved dependencies, flat or as a tree
//! - `list` - list installed kegs from the cellar
//!
//! # Global options
//!
//! All commands accept:
//! - `--verbose` / `--quiet` - logging verbosity
//! - `--config` - path to an alternative `config.toml`
//! - `--formula-dir` - override the formula directory for this invocation
//!
//! ```bash
//! malt build ffmpeg
//! malt build aom --build-from-source
//! malt test aom
//! malt deps ffmpeg --tree
//! malt info aom
//! malt list
//! ```

mod build;
mod deps;
mod info;
mod list;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use crate::config::MaltConfig;
use crate::formula::FormulaLibrary;

/// Runtime configuration derived from the global CLI flags.
///
/// Kept separate from argument parsing so tests and programmatic callers can
/// inject their own settings without building an argv.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    /// Log level filter; `None` leaves logging to `RUST_LOG`.
    pub log_level: Option<String>,
    /// Explicit config file path, overriding discovery.
    pub config_path: Option<PathBuf>,
    /// Formula directory override.
    pub formula_dir: Option<PathBuf>,
}

impl CliConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize the global tracing subscriber.
    ///
    /// An explicit level wins; otherwise `RUST_LOG` is honored; otherwise
    /// logging stays off. Safe to call more than once (later calls are
    /// no-ops).
    pub fn init_logging(&self) {
        let filter = if let Some(ref level) = self.log_level {
            EnvFilter::new(level.clone())
        } else if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            return;
        };

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init();
    }

    /// Load the engine configuration this CLI invocation should run with.
    pub fn load_malt_config(&self) -> Result<MaltConfig> {
        let mut config = match self.config_path {
            Some(ref path) => MaltConfig::load_from(path)?,
            None => MaltConfig::load()?,
        };
        if let Some(ref dir) = self.formula_dir {
            config.formula_dir = dir.clone();
        }
        Ok(config)
    }
}

/// Top-level CLI: global flags plus one subcommand.
#[derive(Parser)]
#[command(
    name = "malt",
    about = "Formula-driven build and install orchestration",
    version,
    long_about = "Malt resolves formula dependency graphs and installs each formula \
                  into its own keg, pouring precompiled bottles when available and \
                  building from verified sources otherwise."
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging (equivalent to RUST_LOG=debug)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to an alternative config file (default: ~/.malt/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory of formula files (default: ~/.malt/formulas)
    #[arg(long, global = true)]
    formula_dir: Option<PathBuf>,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Resolve and install formulas with their dependencies.
    ///
    /// Pours a precompiled bottle when the formula publishes one for the
    /// host platform and current revision; builds from verified source
    /// otherwise. Already-installed, up-to-date kegs are left untouched.
    Build(build::BuildCommand),

    /// Install formulas if needed, then run their acceptance tests.
    Test(test::TestCommand),

    /// Show a formula's metadata, dependencies, and install status.
    Info(info::InfoCommand),

    /// Show a formula's resolved dependency set.
    Deps(deps::DepsCommand),

    /// List installed kegs.
    List(list::ListCommand),
}

impl Cli {
    /// Execute the parsed command line.
    pub async fn execute(self) -> Result<()> {
        let config = self.build_config();
        self.execute_with_config(config).await
    }

    /// Translate the global flags into a [`CliConfig`].
    #[must_use]
    pub fn build_config(&self) -> CliConfig {
        let log_level = if self.verbose {
            Some("debug".to_string())
        } else if self.quiet {
            None
        } else {
            Some("warn".to_string())
        };

        CliConfig {
            log_level,
            config_path: self.config.clone(),
            formula_dir: self.formula_dir.clone(),
        }
    }

    /// Execute with an injected configuration. All entry points funnel
    /// through here.
    pub async fn execute_with_config(self, config: CliConfig) -> Result<()> {
        config.init_logging();
        let malt_config = config.load_malt_config()?;

        match self.command {
            Commands::Build(cmd) => cmd.execute(&malt_config).await,
            Commands::Test(cmd) => cmd.execute(&malt_config).await,
            Commands::Info(cmd) => cmd.execute(&malt_config).await,
            Commands::Deps(cmd) => cmd.execute(&malt_config).await,
            Commands::List(cmd) => cmd.execute(&malt_config).await,
        }
    }
}

/// Load the formula library every formula-touching command starts from.
fn load_library(config: &MaltConfig) -> Result<FormulaLibrary> {
    FormulaLibrary::load_dir(&config.formula_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_sets_debug_level() {
        let cli = Cli::parse_from(["malt", "--verbose", "list"]);
        let config = cli.build_config();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_quiet_disables_logging() {
        let cli = Cli::parse_from(["malt", "--quiet", "list"]);
        let config = cli.build_config();
        assert!(config.log_level.is_none());
    }

    #[test]
    fn test_default_level_is_warn() {
        let cli = Cli::parse_from(["malt", "list"]);
        assert_eq!(cli.build_config().log_level.as_deref(), Some("warn"));
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["malt", "-v", "-q", "list"]).is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "malt",
            "build",
            "aom",
            "--formula-dir",
            "/tmp/formulas",
        ]);
        let config = cli.build_config();
        assert_eq!(config.formula_dir, Some(PathBuf::from("/tmp/formulas")));
    }

    #[test]
    fn test_build_requires_at_least_one_formula() {
        assert!(Cli::try_parse_from(["malt", "build"]).is_err());
    }
}
