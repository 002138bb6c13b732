//! multi-updater command-line entry point.
//!
//! Parses arguments, installs the logging subscriber once, and dispatches to
//! [`multi_updater::cli`]. Errors are printed through
//! [`user_friendly_error`] and mapped to an exit status; successful commands
//! may still return a non-zero status (the update script's own).

use anyhow::Result;
use clap::Parser;
use multi_updater::cli;
use multi_updater::core::error::user_friendly_error;
use multi_updater::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    #[cfg(windows)]
    colored::control::set_virtual_terminal(true).ok();

    if let Err(e) = logging::init(&cli.log_config()) {
        eprintln!("warning: {e:#}");
    }

    match cli.execute().await {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            let error_ctx = user_friendly_error(e);
            error_ctx.display();
            std::process::exit(error_ctx.exit_code());
        }
    }
}
