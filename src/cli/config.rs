//! `config`: show, create or locate the configuration file.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use super::CliConfig;
use crate::config::GlobalConfig;

#[derive(Args, Debug)]
pub struct ConfigCommand {
    #[command(subcommand)]
    command: Option<ConfigSubcommands>,
}

#[derive(Subcommand, Debug)]
enum ConfigSubcommands {
    /// Print the effective configuration (default)
    Show,

    /// Write a configuration file with every default filled in
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,

        /// Record this directory as the location of update-all.sh
        #[arg(long, value_name = "DIR")]
        script_dir: Option<PathBuf>,
    },

    /// Print the configuration file path
    Path,
}

impl ConfigCommand {
    pub async fn execute(self, cli: &CliConfig) -> Result<i32> {
        let path = match &cli.config_path {
            Some(path) => path.clone(),
            None => GlobalConfig::default_path()?,
        };

        match self.command.unwrap_or(ConfigSubcommands::Show) {
            ConfigSubcommands::Show => Self::show(cli, &path).await?,
            ConfigSubcommands::Init {
                force,
                script_dir,
            } => Self::init(&path, force, script_dir).await?,
            ConfigSubcommands::Path => println!("{}", path.display()),
        }
        Ok(0)
    }

    async fn show(cli: &CliConfig, path: &std::path::Path) -> Result<()> {
        let config = cli.load().await?;

        println!("{}", "Configuration".bold());
        if path.exists() {
            println!("Location: {}", path.display());
        } else {
            println!("Location: {} {}", path.display(), "(not created, using defaults)".dimmed());
        }
        match config.resolve_script_dir() {
            Ok(dir) => println!("Script directory: {}\n", dir.display()),
            Err(e) => println!("Script directory: {}\n", format!("unresolved ({e})").red()),
        }
        println!("{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
        Ok(())
    }

    async fn init(path: &std::path::Path, force: bool, script_dir: Option<PathBuf>) -> Result<()> {
        if path.exists() && !force {
            println!("{} Configuration already exists at: {}", "✗".red(), path.display());
            println!("  Use --force to overwrite");
            return Ok(());
        }

        let config = GlobalConfig {
            script_dir,
            ..Default::default()
        };
        config.save_to(path).await?;

        println!("{} Created configuration at: {}", "✓".green(), path.display());
        println!("\n{}", toml::to_string_pretty(&config).context("Failed to render configuration")?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_writes_defaults_and_respects_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        ConfigCommand::init(&path, false, Some(PathBuf::from("/opt/app"))).await.unwrap();
        let written = GlobalConfig::load_from(&path).await.unwrap();
        assert_eq!(written.script_dir, Some(PathBuf::from("/opt/app")));
        assert!(written.components.flatpak);

        // Without --force the file is left alone
        ConfigCommand::init(&path, false, None).await.unwrap();
        let again = GlobalConfig::load_from(&path).await.unwrap();
        assert_eq!(again.script_dir, Some(PathBuf::from("/opt/app")));

        ConfigCommand::init(&path, true, None).await.unwrap();
        let forced = GlobalConfig::load_from(&path).await.unwrap();
        assert_eq!(forced.script_dir, None);
    }
}
