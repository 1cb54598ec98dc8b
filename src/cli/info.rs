//! The `info` command: show a formula's metadata and install status.

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use crate::cellar::{Cellar, InstallSource, Receipt};
use crate::config::MaltConfig;

/// Show a formula's metadata, dependencies, and install status.
#[derive(Args, Debug)]
pub struct InfoCommand {
    /// Formula name
    formula: String,
}

impl InfoCommand {
    pub async fn execute(self, config: &MaltConfig) -> Result<()> {
        let library = super::load_library(config)?;
        let spec = library.get(&self.formula)?;

        println!("{}: {}", spec.name.bold(), spec.versioned_name());
        if let Some(ref desc) = spec.desc {
            println!("{desc}");
        }
        if let Some(ref homepage) = spec.homepage {
            println!("{}", homepage.underline());
        }

        if !spec.dependencies.is_empty() {
            let deps: Vec<String> = spec
                .dependencies
                .iter()
                .map(|d| format!("{} ({})", d.name, d.kind))
                .collect();
            println!("{} {}", "Dependencies:".bold(), deps.join(", "));
        }

        if let Some(ref requirement) = spec.min_platform {
            println!("{} {requirement}", "Requires:".bold());
        }

        if let Some(ref bottle) = spec.bottle {
            let tags: Vec<&str> = bottle.sha256.keys().map(String::as_str).collect();
            println!("{} {}", "Bottle tags:".bold(), tags.join(", "));
        }

        let cellar = Cellar::new(&config.cellar_dir)?;
        let keg = cellar.keg_path(&spec);
        if keg.exists() {
            let how = match Receipt::load(&keg).map(|r| r.source) {
                Some(InstallSource::Bottle) => " (poured from bottle)",
                Some(InstallSource::Source) => " (built from source)",
                None => "",
            };
            println!("{} {}{how}", "Installed:".bold(), keg.display());
        } else {
            println!("{} not installed", "Installed:".bold());
        }

        Ok(())
    }
}
