//! Malt CLI entry point.
//!
//! Parses the command line, runs the selected command, and maps failures to
//! user-friendly output and the documented process exit codes (checksum
//! mismatch, unsupported platform, dependency cycle, and test failure each
//! get their own code).

use clap::Parser;
use malt_cli::cli;
use malt_cli::core::user_friendly_error;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    // Set up colored output for Windows
    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    if let Err(e) = cli.execute().await {
        let error_ctx = user_friendly_error(e);
        error_ctx.display();
        std::process::exit(error_ctx.exit_code());
    }
}
