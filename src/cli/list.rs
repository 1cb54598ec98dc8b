//! The `list` command: enumerate installed kegs.

use anyhow::Result;
use clap::Args;
use colored::Colorize;

use crate::cellar::{Cellar, InstallSource};
use crate::config::MaltConfig;

/// List installed kegs.
#[derive(Args, Debug)]
pub struct ListCommand {
    /// Show receipts' install source and platform tag
    #[arg(long)]
    details: bool,
}

impl ListCommand {
    pub async fn execute(self, config: &MaltConfig) -> Result<()> {
        let cellar = Cellar::new(&config.cellar_dir)?;
        let kegs = cellar.installed()?;

        if kegs.is_empty() {
            println!("No formulas installed");
            return Ok(());
        }

        for keg in kegs {
            if self.details {
                let annotation = keg.receipt.as_ref().map_or_else(
                    || "no receipt".to_string(),
                    |r| {
                        let how = match r.source {
                            InstallSource::Bottle => "bottle",
                            InstallSource::Source => "source",
                        };
                        format!("{how}, {}", r.platform_tag)
                    },
                );
                println!("{} {} ({annotation})", keg.name.bold(), keg.versioned_name);
            } else {
                println!("{} {}", keg.name.bold(), keg.versioned_name);
            }
        }

        Ok(())
    }
}
