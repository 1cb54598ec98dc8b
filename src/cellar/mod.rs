//! The cellar: installed kegs, install receipts, and the build-artifact
//! cache.
//!
//! Installed formulas live under `<cellar>/<name>/<version>[_<revision>]/`
//! (a *keg*). Every successful install writes a `RECEIPT.toml` into the keg
//! recording where the artifact came from (bottle or source build), the
//! platform tag, the dependency-set hash, and a content checksum of the
//! keg's files.
//!
//! The receipt doubles as the build-artifact cache entry: a keg is a cache
//! hit for (name, version, revision, platform tag, dependency-set hash)
//! when its receipt matches all five components and the recorded content
//! checksum still matches the keg on disk. A hit skips both the bottle
//! check and the build; any mismatch (including on-disk tampering) is a
//! miss and the keg is rebuilt.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use crate::fetch::FetchedBlob;
use crate::formula::{CellarPolicy, FormulaSpec};

/// Receipt file name inside a keg. Excluded from the keg content checksum.
const RECEIPT_FILE: &str = "RECEIPT.toml";

/// Where an installed keg's contents came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallSource {
    /// Poured from a precompiled bottle
    Bottle,
    /// Built from source via the install recipe
    Source,
}

/// Per-keg install receipt, persisted as `RECEIPT.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    /// Formula name
    pub formula: String,
    /// Installed version
    pub version: String,
    /// Installed revision
    pub revision: u32,
    /// Platform tag the artifact targets
    pub platform_tag: String,
    /// Hash over the resolved dependency set at install time
    pub dependency_hash: String,
    /// Bottle pour or source build
    pub source: InstallSource,
    /// Relocation policy of the artifact
    pub cellar: CellarPolicy,
    /// Content checksum of the keg files (excluding this receipt)
    pub keg_checksum: String,
    /// Install timestamp
    pub installed_at: DateTime<Utc>,
    /// Runtime dependency names recorded at install time
    pub runtime_deps: Vec<String>,
}

impl Receipt {
    /// Write the receipt into its keg.
    pub fn write(&self, keg: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(keg.join(RECEIPT_FILE), content)
            .with_context(|| format!("Failed to write install receipt in {}", keg.display()))?;
        Ok(())
    }

    /// Load the receipt from a keg, if present and parseable.
    pub fn load(keg: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(keg.join(RECEIPT_FILE)).ok()?;
        toml::from_str(&content).ok()
    }
}

/// An installed keg discovered in the cellar.
#[derive(Debug, Clone)]
pub struct InstalledKeg {
    /// Formula name
    pub name: String,
    /// Versioned keg directory name (`<version>[_<revision>]`)
    pub versioned_name: String,
    /// Keg path
    pub path: PathBuf,
    /// Receipt, when one exists
    pub receipt: Option<Receipt>,
}

/// The installation root and artifact cache.
///
/// Read-mostly and safe for concurrent lookups; writes happen only after a
/// formula's install completes, under a keg path unique to that formula.
#[derive(Debug, Clone)]
pub struct Cellar {
    root: PathBuf,
}

impl Cellar {
    /// Open (creating if needed) a cellar at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cellar: {}", root.display()))?;
        Ok(Self { root })
    }

    /// The cellar root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The keg path for a formula's current version and revision.
    pub fn keg_path(&self, spec: &FormulaSpec) -> PathBuf {
        self.root.join(&spec.name).join(spec.versioned_name())
    }

    /// Hash of a formula's resolved dependency set.
    ///
    /// Order-independent: the names are sorted before hashing. Versions and
    /// revisions of the dependencies are folded in so a dependency upgrade
    /// invalidates dependent kegs.
    pub fn dependency_hash<'a>(deps: impl IntoIterator<Item = &'a FormulaSpec>) -> String {
        let entries: BTreeSet<String> = deps
            .into_iter()
            .map(|d| format!("{}={}", d.name, d.versioned_name()))
            .collect();
        let mut hasher = Sha256::new();
        for entry in &entries {
            hasher.update(entry.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Content checksum of a keg: sha256 over the sorted (relative path,
    /// file digest) pairs of every file except the receipt.
    pub fn keg_checksum(keg: &Path) -> Result<String> {
        let mut entries = Vec::new();
        for entry in WalkDir::new(keg).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() || entry.file_name() == RECEIPT_FILE {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(keg)
                .expect("walkdir yields paths under its root")
                .to_string_lossy()
                .replace('\\', "/");
            let digest = crate::fetch::file_digest(entry.path())?;
            entries.push((relative, digest));
        }
        entries.sort();

        let mut hasher = Sha256::new();
        for (path, digest) in &entries {
            hasher.update(path.as_bytes());
            hasher.update(b"\0");
            hasher.update(digest.as_bytes());
            hasher.update(b"\n");
        }
        Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// Check the artifact cache for (name, version, revision, platform tag,
    /// dependency hash).
    ///
    /// A hit requires a receipt matching every key component and a keg
    /// whose current content checksum equals the recorded one.
    pub fn cache_hit(
        &self,
        spec: &FormulaSpec,
        platform_tag: &str,
        dependency_hash: &str,
    ) -> Option<PathBuf> {
        let keg = self.keg_path(spec);
        let receipt = Receipt::load(&keg)?;

        if receipt.formula != spec.name
            || receipt.version != spec.version
            || receipt.revision != spec.revision
            || receipt.platform_tag != platform_tag
            || receipt.dependency_hash != dependency_hash
        {
            return None;
        }

        match Self::keg_checksum(&keg) {
            Ok(actual) if actual == receipt.keg_checksum => {
                debug!(formula = %spec.name, "Artifact cache hit");
                Some(keg)
            }
            _ => {
                debug!(formula = %spec.name, "Artifact cache entry stale, rebuilding");
                None
            }
        }
    }

    /// Stage a verified bottle blob into a fresh keg.
    ///
    /// The blob was already checksum-verified by the fetcher; pouring never
    /// consumes unverified content.
    pub fn pour_bottle(
        &self,
        spec: &FormulaSpec,
        tag: &str,
        rebuild: u32,
        blob: &FetchedBlob,
    ) -> Result<PathBuf> {
        let keg = self.keg_path(spec);
        self.reset_keg(&keg)?;

        let file_name = if rebuild == 0 {
            format!("{}-{}.{tag}.bottle.tar.gz", spec.name, spec.versioned_name())
        } else {
            format!("{}-{}.{tag}.bottle.{rebuild}.tar.gz", spec.name, spec.versioned_name())
        };
        std::fs::copy(&blob.path, keg.join(&file_name))
            .with_context(|| format!("Failed to pour bottle into {}", keg.display()))?;
        Ok(keg)
    }

    /// Create an empty keg for a source build, removing any stale contents.
    pub fn prepare_keg(&self, spec: &FormulaSpec) -> Result<PathBuf> {
        let keg = self.keg_path(spec);
        self.reset_keg(&keg)?;
        Ok(keg)
    }

    fn reset_keg(&self, keg: &Path) -> Result<()> {
        if keg.exists() {
            std::fs::remove_dir_all(keg)
                .with_context(|| format!("Failed to remove stale keg: {}", keg.display()))?;
        }
        std::fs::create_dir_all(keg)
            .with_context(|| format!("Failed to create keg: {}", keg.display()))?;
        Ok(())
    }

    /// Enumerate installed kegs, sorted by formula name.
    pub fn installed(&self) -> Result<Vec<InstalledKeg>> {
        let mut kegs = Vec::new();
        for formula_entry in std::fs::read_dir(&self.root)? {
            let formula_dir = formula_entry?.path();
            if !formula_dir.is_dir() {
                continue;
            }
            let name = formula_dir.file_name().unwrap_or_default().to_string_lossy().to_string();
            for keg_entry in std::fs::read_dir(&formula_dir)? {
                let keg_path = keg_entry?.path();
                if !keg_path.is_dir() {
                    continue;
                }
                kegs.push(InstalledKeg {
                    name: name.clone(),
                    versioned_name: keg_path
                        .file_name()
                        .unwrap_or_default()
                        .to_string_lossy()
                        .to_string(),
                    receipt: Receipt::load(&keg_path),
                    path: keg_path,
                });
            }
        }
        kegs.sort_by(|a, b| (&a.name, &a.versioned_name).cmp(&(&b.name, &b.versioned_name)));
        Ok(kegs)
    }
}
