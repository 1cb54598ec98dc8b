//! Acceptance testing of installed formulas.
//!
//! A formula may declare a test recipe: resources to stage plus commands
//! and assertions to run against the installed keg. The runner stages the
//! declared resources (fetched and checksum-verified like any other
//! resource) into a fresh ephemeral directory, executes the steps with the
//! staging directory as working directory, and removes the directory on
//! every exit path via `tempfile`'s RAII cleanup.
//!
//! A failing step or assertion yields
//! [`TestAssertionFailure`](MaltError::TestAssertionFailure). This never
//! reverts the install: the run is reported as "installed, tests failed".

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info};

use crate::core::MaltError;
use crate::env::BuildEnvironment;
use crate::executor::{ExternalCommand, expand_placeholders};
use crate::fetch::ResourceFetcher;
use crate::formula::{FormulaSpec, TestStep};

/// Outcome of a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOutcome {
    /// The formula declares no test recipe; trivially successful.
    NoRecipe,
    /// All steps and assertions passed.
    Passed,
}

/// Runs formula test recipes against installed kegs.
pub struct TestRunner<'a> {
    fetcher: &'a ResourceFetcher,
}

impl<'a> TestRunner<'a> {
    /// Create a runner staging resources through the given fetcher.
    pub fn new(fetcher: &'a ResourceFetcher) -> Self {
        Self { fetcher }
    }

    /// Run `spec`'s test recipe against the keg at `prefix`.
    pub async fn run_tests(&self, spec: &FormulaSpec, prefix: &Path) -> Result<TestOutcome> {
        let Some(recipe) = spec.test.as_ref().filter(|t| !t.steps.is_empty()) else {
            debug!(formula = %spec.name, "No test recipe declared");
            return Ok(TestOutcome::NoRecipe);
        };

        // Ephemeral staging dir; removed on drop regardless of outcome.
        let staging = tempfile::tempdir().context("Failed to create test staging directory")?;

        for resource_name in &recipe.resources {
            let resource = spec.resource(resource_name).ok_or_else(|| {
                MaltError::TestAssertionFailure {
                    formula: spec.name.clone(),
                    reason: format!("test recipe references undeclared resource '{resource_name}'"),
                }
            })?;
            let blob = self.fetcher.fetch(resource).await?;
            tokio::fs::copy(&blob.path, staging.path().join(resource_name))
                .await
                .with_context(|| format!("Failed to stage test resource '{resource_name}'"))?;
        }

        let env = BuildEnvironment::for_test(prefix);
        for step in &recipe.steps {
            self.run_step(spec, step, staging.path(), prefix, &env).await?;
        }

        info!(formula = %spec.name, "Tests passed");
        Ok(TestOutcome::Passed)
    }

    async fn run_step(
        &self,
        spec: &FormulaSpec,
        step: &TestStep,
        staging: &Path,
        prefix: &Path,
        env: &BuildEnvironment,
    ) -> Result<()> {
        match step {
            TestStep::Run(run) => {
                let argv: Vec<String> =
                    run.command.iter().map(|arg| expand_placeholders(arg, prefix)).collect();
                let command_line = argv.join(" ");
                let output = ExternalCommand::new(argv)
                    .current_dir(staging)
                    .envs(&env.merged_env(&run.env))
                    .with_context(format!("{} (test)", spec.name))
                    .execute()
                    .await?;

                if !output.success() {
                    return Err(MaltError::TestAssertionFailure {
                        formula: spec.name.clone(),
                        reason: format!(
                            "`{command_line}` exited with {}: {}",
                            output.status_desc(),
                            output.tail()
                        ),
                    }
                    .into());
                }
                Ok(())
            }
            TestStep::Exists(path) => {
                let expanded = expand_placeholders(path, prefix);
                let target = if Path::new(&expanded).is_absolute() {
                    std::path::PathBuf::from(&expanded)
                } else {
                    staging.join(&expanded)
                };
                if !target.exists() {
                    return Err(MaltError::TestAssertionFailure {
                        formula: spec.name.clone(),
                        reason: format!("expected file does not exist: {expanded}"),
                    }
                    .into());
                }
                Ok(())
            }
        }
    }
}
