//! Install recipe execution.
//!
//! [`BuildExecutor`] walks a formula's [`InstallStep`] tree in declared
//! order and spawns each external command through the [`ExternalCommand`]
//! builder. The engine treats build tools (configure, cmake, make) as
//! opaque collaborators: argv and an environment overlay in, exit status
//! and captured output out.
//!
//! Guarantees:
//! - a nonzero exit is a fatal
//!   [`BuildStepFailure`](MaltError::BuildStepFailure) that aborts the rest
//!   of the formula's recipe (fail-fast, no partial retry);
//! - a `chdir` scope restores the previous working directory on every exit
//!   path, including when a nested step fails;
//! - an `on_platform` predicate is evaluated once, before execution; when
//!   false the nested steps are skipped entirely;
//! - cancellation is honored only between commands (a build tool is never
//!   killed mid-write to the install prefix).
//!
//! The working directory is explicit executor state threaded into each
//! spawn, never a process-wide `chdir`, so concurrent builds of different
//! formulas cannot interfere.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::core::MaltError;
use crate::env::BuildEnvironment;
use crate::formula::{FormulaSpec, InstallStep, RunStep};
use crate::platform::HostPlatform;

/// How many trailing output lines a [`BuildStepFailure`](MaltError::BuildStepFailure)
/// carries for diagnostics.
const OUTPUT_TAIL_LINES: usize = 25;

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human description of the exit status.
    pub fn status_desc(&self) -> String {
        match self.code {
            Some(code) => format!("exit code {code}"),
            None => "termination by signal".to_string(),
        }
    }

    /// The last few lines of combined output, stderr last (it usually
    /// holds the actual diagnostic).
    pub fn tail(&self) -> String {
        let combined: Vec<&str> =
            self.stdout.lines().chain(self.stderr.lines()).collect();
        let start = combined.len().saturating_sub(OUTPUT_TAIL_LINES);
        combined[start..].join("\n")
    }
}

/// Builder for spawning one external command with captured output.
///
/// Fluent construction mirrors how recipes describe commands: argv first,
/// then working directory and environment overlay. Commands default to a
/// one hour timeout; build tools are slow but not infinitely so.
pub struct ExternalCommand {
    argv: Vec<String>,
    current_dir: Option<PathBuf>,
    env_vars: BTreeMap<String, String>,
    timeout_duration: Option<Duration>,
    context: Option<String>,
}

impl ExternalCommand {
    /// Create a command from an argument vector; `argv[0]` is the program.
    pub fn new(argv: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            current_dir: None,
            env_vars: BTreeMap::new(),
            timeout_duration: Some(Duration::from_secs(3600)),
            context: None,
        }
    }

    /// Set the working directory for the spawn.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Add environment variables for the spawn.
    pub fn envs(mut self, vars: &BTreeMap<String, String>) -> Self {
        self.env_vars.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Override the execution timeout. `None` disables it.
    pub fn timeout(mut self, duration: Option<Duration>) -> Self {
        self.timeout_duration = duration;
        self
    }

    /// Label log lines with an operation context (typically the formula
    /// name), useful when builds run concurrently.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// The rendered command line, for error messages.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }

    /// Spawn the command and wait for it, capturing output.
    ///
    /// A missing executable is reported as
    /// [`CommandNotFound`](MaltError::CommandNotFound); any exit status is
    /// returned as data for the caller to judge.
    pub async fn execute(self) -> Result<CommandOutput> {
        let program = self.argv.first().ok_or_else(|| MaltError::BuildStepFailure {
            formula: self.context.clone().unwrap_or_default(),
            command: String::new(),
            status: "empty argv".to_string(),
            output_tail: String::new(),
        })?;

        // Resolve bare program names up front for a clearer error than the
        // raw spawn failure.
        if !program.contains(std::path::MAIN_SEPARATOR) && which::which(program).is_err() {
            return Err(MaltError::CommandNotFound {
                command: program.clone(),
            }
            .into());
        }

        let mut cmd = Command::new(program);
        cmd.args(&self.argv[1..]);
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env_vars {
            cmd.env(key, value);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());

        if let Some(ref ctx) = self.context {
            debug!(target: "exec", "({}) Executing command: {}", ctx, self.display());
        } else {
            debug!(target: "exec", "Executing command: {}", self.display());
        }

        let output_future = cmd.output();
        let output = if let Some(duration) = self.timeout_duration {
            match timeout(duration, output_future).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(MaltError::BuildStepFailure {
                        formula: self.context.unwrap_or_default(),
                        command: self.argv.join(" "),
                        status: format!("timed out after {} seconds", duration.as_secs()),
                        output_tail: String::new(),
                    }
                    .into());
                }
            }
        } else {
            output_future.await
        };

        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MaltError::CommandNotFound {
                    command: program.clone(),
                }
                .into());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to spawn `{}`", self.display()));
            }
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// The artifact location produced by a successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    /// Keg prefix the formula's files were installed under
    pub prefix: PathBuf,
}

/// Mutable per-recipe state threaded through step execution.
///
/// `cwd` is the scoped working directory; `chdir` steps push and restore
/// it around their nested steps.
struct StepContext {
    formula: String,
    cwd: PathBuf,
    prefix: PathBuf,
    env: BuildEnvironment,
}

/// Executes install recipes for one formula at a time.
///
/// A single formula's recipe is always serialized: external build tools
/// are not assumed safe to run concurrently in the same working directory.
pub struct BuildExecutor {
    host: HostPlatform,
    cancel: Option<Arc<AtomicBool>>,
}

impl BuildExecutor {
    /// Create an executor for the given host.
    pub fn new(host: HostPlatform) -> Self {
        Self { host, cancel: None }
    }

    /// Attach a cancellation flag, checked between commands.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Execute `spec`'s install recipe from a staged source directory into
    /// the keg prefix.
    ///
    /// `stage_dir` is the scratch build root (the initial working
    /// directory); `prefix` is the keg the recipe installs into. Nothing
    /// outside these two roots is mutated.
    pub async fn build(
        &self,
        spec: &FormulaSpec,
        env: &BuildEnvironment,
        stage_dir: &Path,
        prefix: &Path,
    ) -> Result<BuildResult> {
        tokio::fs::create_dir_all(prefix)
            .await
            .with_context(|| format!("Failed to create keg prefix: {}", prefix.display()))?;

        let mut ctx = StepContext {
            formula: spec.name.clone(),
            cwd: stage_dir.to_path_buf(),
            prefix: prefix.to_path_buf(),
            env: env.clone(),
        };

        self.execute_steps(&spec.install, &mut ctx).await?;

        Ok(BuildResult {
            prefix: prefix.to_path_buf(),
        })
    }

    /// Execute a step sequence in order, fail-fast.
    async fn execute_steps(&self, steps: &[InstallStep], ctx: &mut StepContext) -> Result<()> {
        for step in steps {
            self.execute_step(step, ctx).await?;
        }
        Ok(())
    }

    fn execute_step<'a>(
        &'a self,
        step: &'a InstallStep,
        ctx: &'a mut StepContext,
    ) -> futures::future::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match step {
                InstallStep::Run(run) => self.run_command(run, ctx).await,
                InstallStep::Chdir(scope) => {
                    let dir = ctx.cwd.join(&scope.dir);
                    tokio::fs::create_dir_all(&dir).await.with_context(|| {
                        format!("Failed to create build directory: {}", dir.display())
                    })?;

                    // Scoped working directory: the previous cwd is
                    // restored on success and on failure alike.
                    let previous = std::mem::replace(&mut ctx.cwd, dir);
                    let result = self.execute_steps(&scope.steps, ctx).await;
                    ctx.cwd = previous;
                    result
                }
                InstallStep::OnPlatform(conditional) => {
                    // Evaluated once, up front; an unmet gate skips the
                    // nested steps entirely.
                    if conditional.gate.satisfied_by(&self.host) {
                        self.execute_steps(&conditional.steps, ctx).await
                    } else {
                        debug!(
                            formula = %ctx.formula,
                            gate = %conditional.gate,
                            "Skipping platform-conditional steps"
                        );
                        Ok(())
                    }
                }
            }
        })
    }

    async fn run_command(&self, run: &RunStep, ctx: &StepContext) -> Result<()> {
        if let Some(ref cancel) = self.cancel
            && cancel.load(Ordering::SeqCst)
        {
            return Err(MaltError::Cancelled {
                formula: ctx.formula.clone(),
            }
            .into());
        }

        let argv: Vec<String> =
            run.command.iter().map(|arg| expand_placeholders(arg, &ctx.prefix)).collect();
        let step_env: BTreeMap<String, String> = run
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand_placeholders(v, &ctx.prefix)))
            .collect();
        let merged = ctx.env.merged_env(&step_env);

        let command_line = argv.join(" ");
        let output = ExternalCommand::new(argv)
            .current_dir(&ctx.cwd)
            .envs(&merged)
            .with_context(ctx.formula.clone())
            .execute()
            .await?;

        if !output.success() {
            return Err(MaltError::BuildStepFailure {
                formula: ctx.formula.clone(),
                command: command_line,
                status: output.status_desc(),
                output_tail: output.tail(),
            }
            .into());
        }

        Ok(())
    }
}

/// Expand `{prefix}` in recipe strings to the keg prefix.
pub fn expand_placeholders(value: &str, prefix: &Path) -> String {
    value.replace("{prefix}", &prefix.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::{ChdirStep, ConditionalStep};
    use crate::platform::{OsFamily, PlatformGate, PlatformVersion};

    fn host() -> HostPlatform {
        HostPlatform::new(OsFamily::Linux, PlatformVersion::new(6, 1), "x86_64", "x86_64_linux")
    }

    fn sh(script: &str) -> InstallStep {
        InstallStep::Run(RunStep {
            command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
        })
    }

    fn ctx(stage: &Path, prefix: &Path) -> StepContext {
        StepContext {
            formula: "testpkg".to_string(),
            cwd: stage.to_path_buf(),
            prefix: prefix.to_path_buf(),
            env: BuildEnvironment::for_build(&Default::default(), prefix),
        }
    }

    #[tokio::test]
    async fn test_run_steps_execute_in_order() {
        let stage = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let executor = BuildExecutor::new(host());
        let mut c = ctx(stage.path(), prefix.path());

        let steps = vec![sh("printf one > order.txt"), sh("printf two >> order.txt")];
        executor.execute_steps(&steps, &mut c).await.unwrap();

        let content = std::fs::read_to_string(stage.path().join("order.txt")).unwrap();
        assert_eq!(content, "onetwo");
    }

    #[tokio::test]
    async fn test_chdir_scope_runs_nested_steps_inside_dir() {
        let stage = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let executor = BuildExecutor::new(host());
        let mut c = ctx(stage.path(), prefix.path());

        let steps = vec![InstallStep::Chdir(ChdirStep {
            dir: "macbuild".to_string(),
            steps: vec![sh("printf built > artifact.txt")],
        })];
        executor.execute_steps(&steps, &mut c).await.unwrap();

        assert!(stage.path().join("macbuild/artifact.txt").exists());
        assert_eq!(c.cwd, stage.path());
    }

    #[tokio::test]
    async fn test_chdir_restores_cwd_when_nested_step_fails() {
        // Scenario E: cmdA succeeds, cmdB fails; cwd is restored and the
        // failure names cmdB.
        let stage = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let executor = BuildExecutor::new(host());
        let mut c = ctx(stage.path(), prefix.path());

        let steps = vec![InstallStep::Chdir(ChdirStep {
            dir: "builddir".to_string(),
            steps: vec![sh("true"), sh("exit 7")],
        })];
        let err = executor.execute_steps(&steps, &mut c).await.unwrap_err();

        assert_eq!(c.cwd, stage.path(), "cwd must be restored after nested failure");
        match err.downcast_ref::<MaltError>() {
            Some(MaltError::BuildStepFailure { command, status, .. }) => {
                assert!(command.contains("exit 7"));
                assert_eq!(status, "exit code 7");
            }
            other => panic!("expected BuildStepFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_steps() {
        let stage = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let executor = BuildExecutor::new(host());
        let mut c = ctx(stage.path(), prefix.path());

        let steps = vec![sh("exit 1"), sh("printf reached > should-not-exist.txt")];
        executor.execute_steps(&steps, &mut c).await.unwrap_err();
        assert!(!stage.path().join("should-not-exist.txt").exists());
    }

    #[tokio::test]
    async fn test_unmet_platform_gate_skips_steps_entirely() {
        let stage = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let executor = BuildExecutor::new(host()); // linux host
        let mut c = ctx(stage.path(), prefix.path());

        let steps = vec![InstallStep::OnPlatform(ConditionalStep {
            gate: PlatformGate {
                os: Some(OsFamily::Macos),
                min_version: Some(PlatformVersion::new(10, 8)),
            },
            steps: vec![sh("printf skipped > macos-only.txt")],
        })];
        executor.execute_steps(&steps, &mut c).await.unwrap();
        assert!(!stage.path().join("macos-only.txt").exists());
    }

    #[tokio::test]
    async fn test_step_env_overlay_reaches_command() {
        let stage = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let executor = BuildExecutor::new(host());
        let mut c = ctx(stage.path(), prefix.path());

        let steps = vec![InstallStep::Run(RunStep {
            command: vec!["sh".to_string(), "-c".to_string(), "printf %s \"$MY_FLAG\" > env.txt".to_string()],
            env: BTreeMap::from([("MY_FLAG".to_string(), "from-step".to_string())]),
        })];
        executor.execute_steps(&steps, &mut c).await.unwrap();

        let content = std::fs::read_to_string(stage.path().join("env.txt")).unwrap();
        assert_eq!(content, "from-step");
    }

    #[tokio::test]
    async fn test_prefix_placeholder_expansion() {
        let stage = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let executor = BuildExecutor::new(host());
        let mut c = ctx(stage.path(), prefix.path());

        let steps = vec![sh("printf installed > {prefix}/marker.txt")];
        executor.execute_steps(&steps, &mut c).await.unwrap();
        assert!(prefix.path().join("marker.txt").exists());
    }

    #[tokio::test]
    async fn test_cancellation_blocks_next_command() {
        let stage = tempfile::tempdir().unwrap();
        let prefix = tempfile::tempdir().unwrap();
        let cancel = Arc::new(AtomicBool::new(true));
        let executor = BuildExecutor::new(host()).with_cancel(cancel);
        let mut c = ctx(stage.path(), prefix.path());

        let steps = vec![sh("printf never > cancelled.txt")];
        let err = executor.execute_steps(&steps, &mut c).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MaltError>(),
            Some(MaltError::Cancelled { .. })
        ));
        assert!(!stage.path().join("cancelled.txt").exists());
    }

    #[tokio::test]
    async fn test_missing_executable_is_command_not_found() {
        let output = ExternalCommand::new(["definitely-not-a-real-tool-xyz"]).execute().await;
        assert!(matches!(
            output.unwrap_err().downcast_ref::<MaltError>(),
            Some(MaltError::CommandNotFound { command }) if command == "definitely-not-a-real-tool-xyz"
        ));
    }

    #[test]
    fn test_output_tail_keeps_last_lines() {
        let output = CommandOutput {
            code: Some(1),
            stdout: (0..40).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n"),
            stderr: "error: boom".to_string(),
        };
        let tail = output.tail();
        assert!(tail.ends_with("error: boom"));
        assert!(!tail.contains("line 0"));
    }
}
