//! The `build` command: resolve, fetch, and install formulas.
//!
//! ```bash
//! malt build ffmpeg                      # bottles when available
//! malt build aom --build-from-source    # always run the install recipe
//! malt build ffmpeg --with-optional     # include optional dependencies
//! malt build a b c --keep-going         # don't stop at the first failure
//! ```

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use crate::config::MaltConfig;
use crate::core::user_friendly_error;
use crate::orchestrator::{FailureMode, InstallAction, Orchestrator, RunOptions, RunReport};
use crate::platform::HostPlatform;
use crate::resolver::ResolveOptions;

/// Install one or more formulas and their dependency closures.
#[derive(Args, Debug)]
pub struct BuildCommand {
    /// Formulas to install
    #[arg(required = true)]
    formulas: Vec<String>,

    /// Skip the bottle fast path and always build from source
    #[arg(long)]
    build_from_source: bool,

    /// Include optional dependencies
    #[arg(long)]
    with_optional: bool,

    /// Include recommended dependencies
    #[arg(long)]
    with_recommended: bool,

    /// Continue building independent formulas after a failure
    #[arg(long)]
    keep_going: bool,

    /// Maximum number of formulas building concurrently
    #[arg(short, long)]
    jobs: Option<usize>,
}

impl BuildCommand {
    pub async fn execute(self, config: &MaltConfig) -> Result<()> {
        let library = super::load_library(config)?;

        let mut config = config.clone();
        if let Some(jobs) = self.jobs {
            config.max_jobs = jobs.max(1);
        }

        let orchestrator = Orchestrator::new(&config, HostPlatform::detect())?;
        let options = RunOptions {
            force_source: self.build_from_source,
            run_tests: false,
            resolve: ResolveOptions {
                include_optional: self.with_optional,
                include_recommended: self.with_recommended,
            },
            mode: if self.keep_going {
                FailureMode::BestEffort
            } else {
                FailureMode::Strict
            },
        };

        let roots: Vec<&str> = self.formulas.iter().map(String::as_str).collect();
        let report = orchestrator.run(&library, &roots, options).await?;

        for installed in &report.installed {
            let how = match installed.action {
                InstallAction::CachedKeg => "already installed",
                InstallAction::PouredBottle => "poured bottle",
                InstallAction::BuiltFromSource => "built from source",
            };
            println!(
                "{} {} ({how}) -> {}",
                "✓".green().bold(),
                installed.name.bold(),
                installed.prefix.display()
            );
        }

        finish_run(report)
    }
}

/// Print skipped formulas, display aggregated failures, and fold them into
/// a single error (the first one, so the exit code reflects it).
pub(super) fn finish_run(mut report: RunReport) -> Result<()> {
    for skipped in &report.skipped {
        println!("{} {} (dependency failed)", "-".yellow().bold(), skipped);
    }

    let mut failures = report.failures.drain(..);
    let first = failures.next();
    for (name, error) in failures {
        eprintln!("{} {}:", "✗".red().bold(), name.bold());
        user_friendly_error(error).display();
    }
    match first {
        Some((name, error)) => {
            eprintln!("{} {} failed", "✗".red().bold(), name.bold());
            Err(error)
        }
        None => Ok(()),
    }
}
