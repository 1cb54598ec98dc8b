//! Immutable build environment overlays.
//!
//! A formula's environment customizations ("use -O3", "override CC") are
//! not process-wide mutations: they are collected once per build invocation
//! into a [`BuildEnvironment`] and explicitly threaded into every external
//! command the recipe runs. The overlay is never mutated after
//! construction; step-local overrides are merged on top at spawn time via
//! [`BuildEnvironment::merged_env`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Environment customizations a formula may request, as written in the
/// `[env]` table of its spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvRequest {
    /// Optimization level, e.g. `"O2"` or `"O3"`; appended to `CFLAGS`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimize: Option<String>,
    /// C compiler override (`CC`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<String>,
    /// Extra compiler flags appended to `CFLAGS`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cflags: Option<String>,
    /// Linker flags (`LDFLAGS`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ldflags: Option<String>,
    /// Arbitrary extra variables, applied last
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
}

/// The computed, immutable environment overlay for one build invocation.
///
/// Computed once from the formula's [`EnvRequest`] and the keg prefix, then
/// passed down to the executor. The base process environment is inherited
/// by spawned commands; this overlay only adds or overrides variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildEnvironment {
    vars: BTreeMap<String, String>,
}

impl BuildEnvironment {
    /// Compute the overlay for a build of `formula` installing into `prefix`.
    pub fn for_build(request: &EnvRequest, prefix: &Path) -> Self {
        let mut vars = BTreeMap::new();

        let mut cflags = Vec::new();
        if let Some(ref opt) = request.optimize {
            cflags.push(format!("-{opt}"));
        }
        if let Some(ref extra) = request.cflags {
            cflags.push(extra.clone());
        }
        if !cflags.is_empty() {
            vars.insert("CFLAGS".to_string(), cflags.join(" "));
        }
        if let Some(ref cc) = request.cc {
            vars.insert("CC".to_string(), cc.clone());
        }
        if let Some(ref ldflags) = request.ldflags {
            vars.insert("LDFLAGS".to_string(), ldflags.clone());
        }

        // The keg prefix is always visible to recipe commands.
        vars.insert("MALT_PREFIX".to_string(), prefix.display().to_string());

        for (k, v) in &request.vars {
            vars.insert(k.clone(), v.clone());
        }

        Self { vars }
    }

    /// An empty overlay; used by the test runner, whose commands only see
    /// the prefix.
    pub fn for_test(prefix: &Path) -> Self {
        Self {
            vars: BTreeMap::from([("MALT_PREFIX".to_string(), prefix.display().to_string())]),
        }
    }

    /// The base overlay variables.
    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    /// Merge step-local overrides over the base overlay, producing the
    /// final variable set for one command spawn. `self` is untouched.
    pub fn merged_env(&self, step_overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = self.vars.clone();
        for (k, v) in step_overrides {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }
}
