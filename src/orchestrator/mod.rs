//! The orchestration pipeline.
//!
//! Drives a full run: resolve the dependency graph, then for each formula
//! in dependency order check the build-artifact cache, try the bottle fast
//! path, fall back to a source build, and optionally run the acceptance
//! tests. Formulas whose dependencies are all satisfied build concurrently
//! on a bounded worker pool; a formula never starts before every one of
//! its build-time and runtime dependencies has finished installing.
//!
//! Failure policy is caller-selected:
//! - **strict** (the default): the first fatal error cancels queued work
//!   and signals in-flight builds, which run to their next safe checkpoint
//!   (the end of the current external command) before stopping; the run
//!   returns that first error;
//! - **best-effort**: independent subtrees continue; failures are
//!   aggregated in the [`RunReport`] and formulas downstream of a failure
//!   are reported as skipped.

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::bottle::BottleCatalog;
use crate::cellar::{Cellar, InstallSource, Receipt};
use crate::config::MaltConfig;
use crate::core::MaltError;
use crate::env::BuildEnvironment;
use crate::executor::BuildExecutor;
use crate::fetch::ResourceFetcher;
use crate::formula::{CellarPolicy, FormulaLibrary, FormulaSpec, Resource};
use crate::platform::HostPlatform;
use crate::resolver::{DependencyResolver, Resolution, ResolveOptions};
use crate::tester::{TestOutcome, TestRunner};

/// Whether a fatal error aborts the whole run or only its subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    /// Abort the run on the first fatal error.
    #[default]
    Strict,
    /// Continue independent subtrees; aggregate failures.
    BestEffort,
}

/// How a formula ended up installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallAction {
    /// The artifact cache already held a matching keg.
    CachedKeg,
    /// A matching bottle was fetched and poured.
    PouredBottle,
    /// Built from source via the install recipe.
    BuiltFromSource,
}

/// Per-formula outcome of a successful install.
#[derive(Debug, Clone)]
pub struct FormulaReport {
    /// Formula name
    pub name: String,
    /// How the keg was produced
    pub action: InstallAction,
    /// Keg prefix
    pub prefix: PathBuf,
    /// Test outcome, when tests were requested
    pub test: Option<TestOutcome>,
}

/// Aggregated outcome of a run.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Successfully installed formulas, in completion order
    pub installed: Vec<FormulaReport>,
    /// Fatal failures, per formula
    pub failures: Vec<(String, anyhow::Error)>,
    /// Formulas never attempted because a dependency failed or the run
    /// was cancelled
    pub skipped: Vec<String>,
}

impl RunReport {
    /// Whether every formula installed (and tested) cleanly.
    pub fn success(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty()
    }
}

/// Caller options for one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Skip the bottle fast path and always build from source
    pub force_source: bool,
    /// Run each formula's test recipe after install
    pub run_tests: bool,
    /// Dependency-kind switches forwarded to the resolver
    pub resolve: ResolveOptions,
    /// Strict or best-effort failure handling
    pub mode: FailureMode,
}

/// Shared state handed to worker tasks.
struct Inner {
    host: HostPlatform,
    cellar: Cellar,
    fetcher: ResourceFetcher,
    catalog: BottleCatalog,
    cancel: Arc<AtomicBool>,
}

/// Top-level pipeline driver.
pub struct Orchestrator {
    inner: Arc<Inner>,
    max_jobs: usize,
}

impl Orchestrator {
    /// Create an orchestrator over the configured cellar and cache.
    pub fn new(config: &MaltConfig, host: HostPlatform) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                host,
                cellar: Cellar::new(&config.cellar_dir)?,
                fetcher: ResourceFetcher::new(&config.cache_dir, config.network_retries)?,
                catalog: BottleCatalog::new(),
                cancel: Arc::new(AtomicBool::new(false)),
            }),
            max_jobs: config.max_jobs,
        })
    }

    /// Resolve and install the requested formulas.
    ///
    /// In strict mode a fatal error is returned directly (after in-flight
    /// workers reach their next safe checkpoint); in best-effort mode the
    /// report carries the aggregated failures.
    pub async fn run(
        &self,
        library: &FormulaLibrary,
        roots: &[&str],
        options: RunOptions,
    ) -> Result<RunReport> {
        let resolver = DependencyResolver::new(library, &self.inner.host, options.resolve);
        let resolution = Arc::new(resolver.resolve(roots)?);

        let specs: HashMap<String, Arc<FormulaSpec>> =
            resolution.order.iter().map(|s| (s.name.clone(), s.clone())).collect();

        // Readiness tracking over the partial order: a formula is ready
        // once all of its direct dependencies have completed.
        let mut waiting: HashMap<String, HashSet<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for spec in &resolution.order {
            let deps: HashSet<String> =
                resolution.direct_deps(&spec.name).into_iter().map(str::to_string).collect();
            for dep in &deps {
                dependents.entry(dep.clone()).or_default().push(spec.name.clone());
            }
            waiting.insert(spec.name.clone(), deps);
        }

        let semaphore = Arc::new(Semaphore::new(self.max_jobs));
        let mut join_set: JoinSet<(String, Result<FormulaReport>)> = JoinSet::new();
        let mut spawned: HashSet<String> = HashSet::new();
        let mut report = RunReport::default();
        let mut first_error: Option<anyhow::Error> = None;

        let spawn_ready = |waiting: &HashMap<String, HashSet<String>>,
                           spawned: &mut HashSet<String>,
                           join_set: &mut JoinSet<(String, Result<FormulaReport>)>| {
            for (name, deps) in waiting {
                if !deps.is_empty() || spawned.contains(name) {
                    continue;
                }
                spawned.insert(name.clone());
                let inner = self.inner.clone();
                let spec = specs[name].clone();
                let resolution = resolution.clone();
                let specs = specs.clone();
                let semaphore = semaphore.clone();
                join_set.spawn(async move {
                    let name = spec.name.clone();
                    let _permit =
                        semaphore.acquire_owned().await.expect("semaphore never closed");
                    let result = install_formula(&inner, &spec, &resolution, &specs, options).await;
                    (name, result)
                });
            }
        };

        spawn_ready(&waiting, &mut spawned, &mut join_set);

        while let Some(joined) = join_set.join_next().await {
            let (name, result) = joined.expect("install task panicked");
            waiting.remove(&name);

            match result {
                Ok(formula_report) => {
                    info!(formula = %name, action = ?formula_report.action, "Installed");
                    report.installed.push(formula_report);
                    for dependent in dependents.get(&name).cloned().unwrap_or_default() {
                        if let Some(deps) = waiting.get_mut(&dependent) {
                            deps.remove(&name);
                        }
                    }
                    if !self.inner.cancel.load(Ordering::SeqCst) {
                        spawn_ready(&waiting, &mut spawned, &mut join_set);
                    }
                }
                Err(e) => {
                    if matches!(e.downcast_ref::<MaltError>(), Some(MaltError::Cancelled { .. })) {
                        report.skipped.push(name);
                        continue;
                    }
                    warn!(formula = %name, error = %e, "Install failed");
                    match options.mode {
                        FailureMode::Strict => {
                            // Signal in-flight workers; they stop at their
                            // next safe checkpoint. Queued formulas are
                            // never spawned.
                            self.inner.cancel.store(true, Ordering::SeqCst);
                            if first_error.is_none() {
                                first_error = Some(e);
                            } else {
                                report.failures.push((name, e));
                            }
                        }
                        FailureMode::BestEffort => {
                            report.failures.push((name, e));
                        }
                    }
                }
            }
        }

        // Anything still waiting was never attempted.
        let mut never_ran: Vec<String> =
            waiting.keys().filter(|n| !spawned.contains(*n)).cloned().collect();
        never_ran.sort_unstable();
        report.skipped.extend(never_ran);

        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(report)
    }
}

/// Install one formula: artifact cache, then bottle, then source build,
/// then optional tests.
async fn install_formula(
    inner: &Inner,
    spec: &Arc<FormulaSpec>,
    resolution: &Resolution,
    specs: &HashMap<String, Arc<FormulaSpec>>,
    options: RunOptions,
) -> Result<FormulaReport> {
    if inner.cancel.load(Ordering::SeqCst) {
        return Err(MaltError::Cancelled {
            formula: spec.name.clone(),
        }
        .into());
    }

    let closure = resolution.full_closure(&spec.name);
    let dep_hash =
        Cellar::dependency_hash(closure.iter().filter_map(|n| specs.get(n)).map(Arc::as_ref));

    let mut runtime_deps: Vec<String> = resolution.runtime_closure(&spec.name).into_iter().collect();
    runtime_deps.sort_unstable();

    let (action, prefix) =
        install_keg(inner, spec, &dep_hash, &runtime_deps, options.force_source).await?;

    let test = if options.run_tests {
        let runner = TestRunner::new(&inner.fetcher);
        Some(runner.run_tests(spec, &prefix).await?)
    } else {
        None
    };

    Ok(FormulaReport {
        name: spec.name.clone(),
        action,
        prefix,
        test,
    })
}

async fn install_keg(
    inner: &Inner,
    spec: &FormulaSpec,
    dep_hash: &str,
    runtime_deps: &[String],
    force_source: bool,
) -> Result<(InstallAction, PathBuf)> {
    // Cache first: a hit skips both the bottle check and the build.
    if let Some(keg) = inner.cellar.cache_hit(spec, &inner.host.bottle_tag, dep_hash) {
        return Ok((InstallAction::CachedKeg, keg));
    }

    if !force_source
        && let Some(artifact) = inner.catalog.lookup(spec, &inner.host)
    {
        debug!(formula = %spec.name, tag = %artifact.tag, "Pouring bottle");
        let blob = inner
            .fetcher
            .fetch(&Resource {
                name: format!("{} (bottle)", spec.name),
                url: artifact.url.clone(),
                sha256: artifact.sha256.clone(),
            })
            .await?;
        let keg = inner.cellar.pour_bottle(spec, &artifact.tag, artifact.rebuild, &blob)?;
        write_receipt(inner, spec, &keg, dep_hash, runtime_deps, InstallSource::Bottle, artifact.cellar)?;
        return Ok((InstallAction::PouredBottle, keg));
    }

    debug!(formula = %spec.name, "Building from source");
    // Fetch and verify before any keg mutation; a checksum failure leaves
    // the cellar untouched.
    let source = inner.fetcher.fetch(&spec.source).await?;

    let stage = tempfile::tempdir().map_err(MaltError::IoError)?;
    let staged_name = spec
        .source
        .url
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("source.tar.gz");
    tokio::fs::copy(&source.path, stage.path().join(staged_name)).await?;

    let keg = inner.cellar.prepare_keg(spec)?;
    let env = BuildEnvironment::for_build(&spec.env, &keg);
    let executor = BuildExecutor::new(inner.host.clone()).with_cancel(inner.cancel.clone());
    executor.build(spec, &env, stage.path(), &keg).await?;

    write_receipt(inner, spec, &keg, dep_hash, runtime_deps, InstallSource::Source, CellarPolicy::Any)?;
    Ok((InstallAction::BuiltFromSource, keg))
}

fn write_receipt(
    inner: &Inner,
    spec: &FormulaSpec,
    keg: &std::path::Path,
    dep_hash: &str,
    runtime_deps: &[String],
    source: InstallSource,
    cellar: CellarPolicy,
) -> Result<()> {
    Receipt {
        formula: spec.name.clone(),
        version: spec.version.clone(),
        revision: spec.revision,
        platform_tag: inner.host.bottle_tag.clone(),
        dependency_hash: dep_hash.to_string(),
        source,
        cellar,
        keg_checksum: Cellar::keg_checksum(keg)?,
        installed_at: chrono::Utc::now(),
        runtime_deps: runtime_deps.to_vec(),
    }
    .write(keg)
}
