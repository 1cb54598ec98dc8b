//! The `deps` command: show a formula's resolved dependency set.
//!
//! The flat form prints the install-ordered closure (dependencies first);
//! `--tree` renders the dependency tree with edge-kind annotations.

use anyhow::Result;
use clap::Args;

use crate::config::MaltConfig;
use crate::platform::HostPlatform;
use crate::resolver::{DependencyResolver, ResolveOptions};

/// Show a formula's resolved dependencies.
#[derive(Args, Debug)]
pub struct DepsCommand {
    /// Formula name
    formula: String,

    /// Render as a tree instead of a flat list
    #[arg(long)]
    tree: bool,

    /// Include optional dependencies
    #[arg(long)]
    with_optional: bool,

    /// Include recommended dependencies
    #[arg(long)]
    with_recommended: bool,
}

impl DepsCommand {
    pub async fn execute(self, config: &MaltConfig) -> Result<()> {
        let library = super::load_library(config)?;
        let host = HostPlatform::detect();
        let options = ResolveOptions {
            include_optional: self.with_optional,
            include_recommended: self.with_recommended,
        };

        let resolution =
            DependencyResolver::new(&library, &host, options).resolve(&[&self.formula])?;

        if self.tree {
            print!("{}", resolution.tree_string(&self.formula));
        } else {
            for spec in &resolution.order {
                if spec.name != self.formula {
                    println!("{}", spec.name);
                }
            }
        }

        Ok(())
    }
}
