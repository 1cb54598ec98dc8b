//! Bottle lookup: the precompiled-binary fast path.
//!
//! A bottle is a prebuilt artifact for one (formula, revision, platform
//! tag) triple, published under the formula's bottle `root_url`. The
//! catalog is a pure lookup over the formula's own bottle table; it never
//! touches the network. When no entry matches the host's platform tag and
//! the formula's current revision, the orchestrator falls back to the
//! source build path.
//!
//! The `rebuild` counter only participates in the artifact's published
//! filename; it never relaxes eligibility (a revision mismatch is always
//! a fallback to source, never a compatibility guess).

use crate::formula::{CellarPolicy, FormulaSpec};
use crate::platform::HostPlatform;

/// A bottle selected for the host, ready to fetch and pour.
#[derive(Debug, Clone, PartialEq)]
pub struct BottleArtifact {
    /// Platform tag the artifact was built for
    pub tag: String,
    /// sha256 hex digest of the artifact blob
    pub sha256: String,
    /// Rebuild counter (names the artifact)
    pub rebuild: u32,
    /// Relocation policy
    pub cellar: CellarPolicy,
    /// Fully resolved download URL
    pub url: String,
}

/// Pure lookup of bottle availability. Read-mostly and safe for concurrent
/// use; holds no state beyond what the formula specs already carry.
#[derive(Debug, Default, Clone, Copy)]
pub struct BottleCatalog;

impl BottleCatalog {
    /// Create the catalog.
    pub fn new() -> Self {
        Self
    }

    /// Find a bottle usable on `host` for the formula's current revision.
    ///
    /// Returns `None` when the formula publishes no bottles, publishes no
    /// entry for the host's platform tag, was revised since the bottles
    /// were poured, or lacks a `root_url` to fetch from.
    pub fn lookup(&self, spec: &FormulaSpec, host: &HostPlatform) -> Option<BottleArtifact> {
        let bottle = spec.bottle.as_ref()?;

        if bottle.revision != spec.revision {
            tracing::debug!(
                formula = %spec.name,
                bottle_revision = bottle.revision,
                formula_revision = spec.revision,
                "Bottle revision mismatch, falling back to source build"
            );
            return None;
        }

        let sha256 = bottle.sha256.get(&host.bottle_tag)?;
        let root_url = bottle.root_url.as_ref()?;

        Some(BottleArtifact {
            tag: host.bottle_tag.clone(),
            sha256: sha256.clone(),
            rebuild: bottle.rebuild,
            cellar: bottle.cellar.clone(),
            url: bottle_url(root_url, spec, &host.bottle_tag, bottle.rebuild),
        })
    }
}

/// The published filename scheme:
/// `<root>/<name>-<version>.<tag>.bottle[.<rebuild>].tar.gz`.
fn bottle_url(root_url: &str, spec: &FormulaSpec, tag: &str, rebuild: u32) -> String {
    let root = root_url.trim_end_matches('/');
    if rebuild == 0 {
        format!("{root}/{}-{}.{tag}.bottle.tar.gz", spec.name, spec.versioned_name())
    } else {
        format!("{root}/{}-{}.{tag}.bottle.{rebuild}.tar.gz", spec.name, spec.versioned_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::{BottleSpec, Resource};
    use crate::platform::{OsFamily, PlatformVersion};
    use std::collections::BTreeMap;

    fn spec_with_bottle(revision: u32, bottle_revision: u32, rebuild: u32) -> FormulaSpec {
        FormulaSpec {
            name: "aom".to_string(),
            version: "1.0.0".to_string(),
            revision,
            desc: None,
            homepage: None,
            source: Resource {
                name: String::new(),
                url: "https://example.com/aom-1.0.0.tar.gz".to_string(),
                sha256: "00".to_string(),
            },
            min_platform: None,
            env: Default::default(),
            dependencies: Vec::new(),
            resources: Vec::new(),
            bottle: Some(BottleSpec {
                root_url: Some("https://bottles.example.com/".to_string()),
                revision: bottle_revision,
                rebuild,
                cellar: CellarPolicy::AnySkipRelocation,
                sha256: BTreeMap::from([(
                    "mojave".to_string(),
                    "27bc975b1126e5d12ea77df58bbe2d9c66c36859cf1708ad77480b328b8b8451".to_string(),
                )]),
            }),
            install: Vec::new(),
            test: None,
        }
    }

    fn mojave() -> HostPlatform {
        HostPlatform::new(OsFamily::Macos, PlatformVersion::new(10, 14), "x86_64", "mojave")
    }

    #[test]
    fn test_lookup_matches_tag_and_revision() {
        // Scenario D: bottle revision 0 matches formula revision 0.
        let spec = spec_with_bottle(0, 0, 0);
        let artifact = BottleCatalog::new().lookup(&spec, &mojave()).unwrap();
        assert_eq!(artifact.tag, "mojave");
        assert_eq!(
            artifact.url,
            "https://bottles.example.com/aom-1.0.0.mojave.bottle.tar.gz"
        );
        assert_eq!(artifact.cellar, CellarPolicy::AnySkipRelocation);
    }

    #[test]
    fn test_revision_mismatch_is_ineligible() {
        let spec = spec_with_bottle(1, 0, 0);
        assert!(BottleCatalog::new().lookup(&spec, &mojave()).is_none());
    }

    #[test]
    fn test_unknown_platform_tag_is_ineligible() {
        let spec = spec_with_bottle(0, 0, 0);
        let linux =
            HostPlatform::new(OsFamily::Linux, PlatformVersion::new(6, 1), "x86_64", "x86_64_linux");
        assert!(BottleCatalog::new().lookup(&spec, &linux).is_none());
    }

    #[test]
    fn test_rebuild_counter_names_artifact() {
        let spec = spec_with_bottle(0, 0, 1);
        let artifact = BottleCatalog::new().lookup(&spec, &mojave()).unwrap();
        assert_eq!(
            artifact.url,
            "https://bottles.example.com/aom-1.0.0.mojave.bottle.1.tar.gz"
        );
    }

    #[test]
    fn test_missing_root_url_is_ineligible() {
        let mut spec = spec_with_bottle(0, 0, 0);
        spec.bottle.as_mut().unwrap().root_url = None;
        assert!(BottleCatalog::new().lookup(&spec, &mojave()).is_none());
    }

    #[test]
    fn test_no_bottle_table() {
        let mut spec = spec_with_bottle(0, 0, 0);
        spec.bottle = None;
        assert!(BottleCatalog::new().lookup(&spec, &mojave()).is_none());
    }
}
