//! Formula specifications and the formula library.
//!
//! A formula is a declarative TOML document describing how to obtain,
//! verify, build, install, and smoke-test one package. Formulas are *data*:
//! the engine never executes formula-supplied code, only the static install
//! step tree declared here. Once loaded a [`FormulaSpec`] is immutable for
//! the duration of the run.
//!
//! # Formula format
//!
//! ```toml
//! name = "aom"
//! version = "1.0.0"
//! revision = 0
//! desc = "Codec library for encoding and decoding AV1 video streams"
//! homepage = "https://aomedia.googlesource.com/aom"
//!
//! [source]
//! url = "https://example.com/aom-1.0.0.tar.gz"
//! sha256 = "fdcfd3f69fbf8c9d5d3277a9cc0aabe6e4d708e3c505724828078ef93d3c82f7"
//!
//! [[dependencies]]
//! name = "cmake"
//! kind = "build"
//!
//! [[resources]]
//! name = "bus_qcif_15fps.y4m"
//! url = "https://example.com/bus_qcif_15fps.y4m"
//! sha256 = "868fc3446d37d0c6959a48b68906486bd64788b2e795f0e29613cbb1fa73480e"
//!
//! [bottle]
//! root_url = "https://bottles.example.com"
//! cellar = "any_skip_relocation"
//! [bottle.sha256]
//! mojave = "27bc975b1126e5d12ea77df58bbe2d9c66c36859cf1708ad77480b328b8b8451"
//!
//! [[install]]
//! chdir = { dir = "build", steps = [
//!     { run = { command = ["cmake", "..", "-DENABLE_DOCS=off"] } },
//!     { run = { command = ["make", "install"] } },
//! ] }
//!
//! [test]
//! resources = ["bus_qcif_15fps.y4m"]
//! steps = [
//!     { run = { command = ["{prefix}/bin/aomenc", "--output=out.webm", "bus_qcif_15fps.y4m"] } },
//!     { exists = "out.webm" },
//! ]
//! ```
//!
//! `{prefix}` in any command argument or assertion path expands to the
//! formula's keg prefix at execution time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::MaltError;
use crate::env::EnvRequest;
use crate::platform::PlatformGate;

/// The relationship kind between a formula and one of its dependencies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Needed only while building; excluded from the runtime closure.
    Build,
    /// Needed at build time and runtime.
    #[default]
    Runtime,
    /// Included only when the caller opts in.
    Optional,
    /// Included only when the caller opts in (on by default in Homebrew,
    /// opt-in here so resolution stays deterministic).
    Recommended,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Runtime => write!(f, "runtime"),
            Self::Optional => write!(f, "optional"),
            Self::Recommended => write!(f, "recommended"),
        }
    }
}

/// A dependency edge declared by a formula.
///
/// Dependencies are referenced by name; the resolver turns names into
/// resolved formulas. A dependency may carry its own platform gate: when
/// the host fails the gate, the edge is simply absent (the dependency is
/// not wanted on this platform).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Target formula name
    pub name: String,
    /// Edge kind; defaults to runtime
    #[serde(default)]
    pub kind: DependencyKind,
    /// Platform gate for this edge, if any
    #[serde(default, skip_serializing_if = "PlatformGate::is_empty")]
    pub gate: PlatformGate,
}

/// An externally fetched, checksum-verified byte blob.
///
/// Used both for the primary source artifact and for auxiliary test
/// fixtures. The checksum is a bare lowercase sha256 hex digest, matching
/// the format formulas publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource name; empty for the primary source
    #[serde(default)]
    pub name: String,
    /// Fetch URL (`http(s)://`, `file://`, or a bare filesystem path)
    pub url: String,
    /// Expected sha256 hex digest of the content
    pub sha256: String,
}

/// Cellar relocation policy for a bottle artifact.
///
/// Serialized as a bare string: `"any"`, `"any_skip_relocation"`, or a
/// pinned cellar path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CellarPolicy {
    /// Relocatable: installable under any cellar.
    #[default]
    Any,
    /// Relocatable and needs no install-name rewriting.
    AnySkipRelocation,
    /// Only valid when installed under this exact cellar path.
    Pinned(PathBuf),
}

impl From<String> for CellarPolicy {
    fn from(s: String) -> Self {
        match s.as_str() {
            "any" => Self::Any,
            "any_skip_relocation" => Self::AnySkipRelocation,
            _ => Self::Pinned(PathBuf::from(s)),
        }
    }
}

impl From<CellarPolicy> for String {
    fn from(p: CellarPolicy) -> Self {
        match p {
            CellarPolicy::Any => "any".to_string(),
            CellarPolicy::AnySkipRelocation => "any_skip_relocation".to_string(),
            CellarPolicy::Pinned(path) => path.display().to_string(),
        }
    }
}

/// A formula's bottle table: precompiled artifacts keyed by platform tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BottleSpec {
    /// Base URL the bottle artifacts are published under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_url: Option<String>,
    /// Formula revision these bottles were poured from; a bottle is
    /// eligible only when this matches the formula's current revision
    #[serde(default)]
    pub revision: u32,
    /// Rebuild counter; names the artifact, never affects eligibility
    #[serde(default)]
    pub rebuild: u32,
    /// Relocation policy shared by all entries in this table
    #[serde(default)]
    pub cellar: CellarPolicy,
    /// Platform tag -> sha256 hex digest of the bottle blob
    #[serde(default)]
    pub sha256: BTreeMap<String, String>,
}

/// One step of an install recipe.
///
/// The recipe is a static, inspectable tree built once at load time. Steps
/// execute in declared order; there is no formula-controlled dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStep {
    /// Spawn an external command with the merged environment overlay.
    Run(RunStep),
    /// Create/enter a directory for the nested steps, restoring the prior
    /// working directory on every exit path.
    Chdir(ChdirStep),
    /// Execute the nested steps only when the host satisfies the gate.
    OnPlatform(ConditionalStep),
}

/// An external command invocation: argv plus step-local env overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    /// Argument vector; `command[0]` is the executable
    pub command: Vec<String>,
    /// Step-local environment overrides, merged over the build environment
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// A working-directory scope around nested steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChdirStep {
    /// Directory to create/enter, relative to the current scope
    pub dir: String,
    /// Steps executed inside the directory
    pub steps: Vec<InstallStep>,
}

/// A platform-conditional group of steps.
///
/// The gate is evaluated once, before execution; when unmet the nested
/// steps are skipped entirely, with no side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalStep {
    /// Predicate over the host platform
    pub gate: PlatformGate,
    /// Steps executed when the gate is satisfied
    pub steps: Vec<InstallStep>,
}

/// One step of a test recipe: a command that must exit zero, or an
/// assertion about the staged directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStep {
    /// Run a command; nonzero exit fails the test.
    Run(RunStep),
    /// Assert that a path exists, relative to the staging directory
    /// (absolute paths and `{prefix}` expansions are honored).
    Exists(String),
}

/// A formula's acceptance-test recipe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRecipe {
    /// Names of declared resources to stage into the test directory
    #[serde(default)]
    pub resources: Vec<String>,
    /// Ordered test steps
    #[serde(default)]
    pub steps: Vec<TestStep>,
}

/// A complete formula specification, loaded once per run and read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaSpec {
    /// Formula name; must match the file stem
    pub name: String,
    /// Upstream version string
    pub version: String,
    /// Rebuild counter for the same upstream version; defaults to 0
    #[serde(default)]
    pub revision: u32,
    /// Short description (informational only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    /// Project homepage (informational only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    /// Primary source artifact
    pub source: Resource,
    /// Minimum host requirement; unmet is a fatal resolution error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_platform: Option<PlatformGate>,
    /// Build environment requests (optimization level, compiler overrides)
    #[serde(default)]
    pub env: EnvRequest,
    /// Declared dependency edges
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Auxiliary named resources (test fixtures etc.)
    #[serde(default)]
    pub resources: Vec<Resource>,
    /// Bottle table, if precompiled artifacts are published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottle: Option<BottleSpec>,
    /// Ordered install recipe
    #[serde(default)]
    pub install: Vec<InstallStep>,
    /// Optional acceptance-test recipe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<TestRecipe>,
}

impl FormulaSpec {
    /// Parse a formula from TOML text.
    pub fn parse(content: &str, file: &Path) -> Result<Self> {
        let spec: Self = toml::from_str(content).map_err(|e| MaltError::FormulaParseError {
            file: file.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(spec)
    }

    /// Load a formula from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read formula file: {}", path.display()))?;
        Self::parse(&content, path)
    }

    /// The versioned keg directory name, `<version>` or `<version>_<revision>`.
    pub fn versioned_name(&self) -> String {
        if self.revision == 0 {
            self.version.clone()
        } else {
            format!("{}_{}", self.version, self.revision)
        }
    }

    /// Look up a declared auxiliary resource by name.
    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Whether the formula declares a test recipe with at least one step.
    pub fn has_test(&self) -> bool {
        self.test.as_ref().is_some_and(|t| !t.steps.is_empty())
    }
}

/// An in-memory library of loaded formulas, keyed by name.
///
/// Loaded eagerly from a directory of `<name>.toml` files at the start of a
/// run; read-only afterwards.
#[derive(Debug, Default, Clone)]
pub struct FormulaLibrary {
    formulas: HashMap<String, Arc<FormulaSpec>>,
}

impl FormulaLibrary {
    /// Create an empty library. Tests use this together with [`insert`](Self::insert).
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.toml` file in a directory.
    ///
    /// A formula whose `name` field disagrees with its file stem is
    /// rejected; the mismatch is always an authoring mistake.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut library = Self::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read formula directory: {}", dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "toml") {
                continue;
            }
            let spec = FormulaSpec::load(&path)?;
            let stem = path.file_stem().unwrap_or_default().to_string_lossy();
            if spec.name != stem {
                return Err(MaltError::FormulaParseError {
                    file: path.display().to_string(),
                    reason: format!("formula name '{}' does not match file name '{stem}'", spec.name),
                }
                .into());
            }
            tracing::debug!(formula = %spec.name, "Loaded formula");
            library.insert(spec);
        }

        Ok(library)
    }

    /// Insert a formula, replacing any previous entry with the same name.
    pub fn insert(&mut self, spec: FormulaSpec) {
        self.formulas.insert(spec.name.clone(), Arc::new(spec));
    }

    /// Fetch a formula by name.
    pub fn get(&self, name: &str) -> Result<Arc<FormulaSpec>> {
        self.formulas.get(name).cloned().ok_or_else(|| {
            MaltError::FormulaNotFound {
                name: name.to_string(),
            }
            .into()
        })
    }

    /// All formula names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.formulas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of loaded formulas.
    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    /// Whether the library is empty.
    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AOM_TOML: &str = r#"
name = "aom"
version = "1.0.0"
desc = "Codec library for encoding and decoding AV1 video streams"
homepage = "https://aomedia.googlesource.com/aom"

[source]
url = "https://example.com/aom-1.0.0.tar.gz"
sha256 = "fdcfd3f69fbf8c9d5d3277a9cc0aabe6e4d708e3c505724828078ef93d3c82f7"

[env]
optimize = "O3"

[[dependencies]]
name = "cmake"
kind = "build"

[[dependencies]]
name = "yasm"
kind = "build"

[[resources]]
name = "bus_qcif_15fps.y4m"
url = "https://example.com/bus_qcif_15fps.y4m"
sha256 = "868fc3446d37d0c6959a48b68906486bd64788b2e795f0e29613cbb1fa73480e"

[bottle]
cellar = "any_skip_relocation"
[bottle.sha256]
mojave = "27bc975b1126e5d12ea77df58bbe2d9c66c36859cf1708ad77480b328b8b8451"

[[install]]
chdir = { dir = "build", steps = [
    { run = { command = ["cmake", "..", "-DENABLE_DOCS=off"] } },
    { run = { command = ["make", "install"] } },
] }

[test]
resources = ["bus_qcif_15fps.y4m"]
steps = [
    { run = { command = ["{prefix}/bin/aomenc", "--output=out.webm", "bus_qcif_15fps.y4m"] } },
    { exists = "out.webm" },
]
"#;

    #[test]
    fn test_parse_full_formula() {
        let spec = FormulaSpec::parse(AOM_TOML, Path::new("aom.toml")).unwrap();
        assert_eq!(spec.name, "aom");
        assert_eq!(spec.version, "1.0.0");
        assert_eq!(spec.revision, 0);
        assert_eq!(spec.dependencies.len(), 2);
        assert_eq!(spec.dependencies[0].kind, DependencyKind::Build);
        assert!(spec.resource("bus_qcif_15fps.y4m").is_some());
        assert!(spec.has_test());

        let bottle = spec.bottle.as_ref().unwrap();
        assert_eq!(bottle.cellar, CellarPolicy::AnySkipRelocation);
        assert!(bottle.sha256.contains_key("mojave"));

        match &spec.install[0] {
            InstallStep::Chdir(scope) => {
                assert_eq!(scope.dir, "build");
                assert_eq!(scope.steps.len(), 2);
            }
            other => panic!("expected chdir step, got {other:?}"),
        }
    }

    #[test]
    fn test_versioned_name_includes_revision() {
        let mut spec = FormulaSpec::parse(AOM_TOML, Path::new("aom.toml")).unwrap();
        assert_eq!(spec.versioned_name(), "1.0.0");
        spec.revision = 1;
        assert_eq!(spec.versioned_name(), "1.0.0_1");
    }

    #[test]
    fn test_dependency_kind_defaults_to_runtime() {
        let toml = r#"
name = "x"
version = "1.0"
[source]
url = "file:///tmp/x.tar.gz"
sha256 = "00"
[[dependencies]]
name = "y"
"#;
        let spec = FormulaSpec::parse(toml, Path::new("x.toml")).unwrap();
        assert_eq!(spec.dependencies[0].kind, DependencyKind::Runtime);
        assert!(spec.dependencies[0].gate.is_empty());
    }

    #[test]
    fn test_cellar_policy_roundtrip() {
        assert_eq!(CellarPolicy::from("any".to_string()), CellarPolicy::Any);
        assert_eq!(
            CellarPolicy::from("any_skip_relocation".to_string()),
            CellarPolicy::AnySkipRelocation
        );
        assert_eq!(
            CellarPolicy::from("/usr/local/Cellar".to_string()),
            CellarPolicy::Pinned(PathBuf::from("/usr/local/Cellar"))
        );
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = FormulaSpec::parse("not valid toml [", Path::new("bad.toml")).unwrap_err();
        let malt = err.downcast_ref::<MaltError>().unwrap();
        assert!(matches!(malt, MaltError::FormulaParseError { file, .. } if file == "bad.toml"));
    }

    #[test]
    fn test_library_lookup_and_missing() {
        let mut lib = FormulaLibrary::new();
        lib.insert(FormulaSpec::parse(AOM_TOML, Path::new("aom.toml")).unwrap());
        assert!(lib.get("aom").is_ok());
        assert_eq!(lib.names(), vec!["aom"]);

        let err = lib.get("ffmpeg").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MaltError>(),
            Some(MaltError::FormulaNotFound { name }) if name == "ffmpeg"
        ));
    }

    #[test]
    fn test_load_dir_rejects_name_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("wrong.toml"),
            "name = \"right\"\nversion = \"1.0\"\n[source]\nurl = \"file:///x\"\nsha256 = \"00\"\n",
        )
        .unwrap();
        let err = FormulaLibrary::load_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Invalid formula file"));
    }
}
