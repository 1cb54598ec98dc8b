//! Malt - formula-driven build and install orchestration.
//!
//! Malt installs third-party software described by *formulas*: declarative
//! TOML documents specifying where to fetch sources, how to verify them, how
//! to build and install them into an isolated *keg*, and how to smoke-test
//! the result. Dependencies between formulas are resolved into a total
//! install order; formulas with precompiled *bottles* for the host platform
//! skip the build entirely.
//!
//! # Pipeline
//!
//! A `malt build` run flows through these stages:
//!
//! 1. **Load** - formulas are parsed from the formula directory into an
//!    immutable [`formula::FormulaLibrary`]
//! 2. **Resolve** - [`resolver`] turns dependency edges into an install
//!    order, rejecting cycles and unmet platform requirements before any
//!    side effect
//! 3. **Cache check** - [`cellar`] receipts short-circuit formulas whose
//!    keg is already current for this platform and dependency set
//! 4. **Bottle or build** - [`bottle`] selects a precompiled artifact when
//!    one matches; otherwise [`fetch`] verifies the source and [`executor`]
//!    runs the install recipe under a scoped [`env::BuildEnvironment`]
//! 5. **Receipt** - every install writes a `RECEIPT.toml` that doubles as
//!    the artifact-cache entry
//! 6. **Test** - [`tester`] optionally runs the formula's acceptance recipe
//!    in an ephemeral staging directory
//!
//! The [`orchestrator`] drives all of this concurrently over a bounded
//! worker pool while honoring the dependency order.
//!
//! # Guarantees
//!
//! - Fetched content is consumed only after its sha256 matches; a mismatch
//!   is fatal and never retried
//! - Resolution failures (cycles, platform) happen before any fetch/build
//! - Install recipes are static data; the engine never executes
//!   formula-supplied code beyond the declared argv steps
//! - A failing acceptance test never reverts a completed install

pub mod bottle;
pub mod cellar;
pub mod cli;
pub mod config;
pub mod core;
pub mod env;
pub mod executor;
pub mod fetch;
pub mod formula;
pub mod orchestrator;
pub mod platform;
pub mod resolver;
pub mod tester;
