//! `kanban-relay config`: view, validate and create relay.toml.

use std::path::Path;

use anyhow::{Context, Result, bail};

use kanban_relay::relay_config::RelayConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Relay Configuration");
            println!("===================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {} (using defaults)", config_path.display());
            }
            println!();

            let mut config = RelayConfig::load(config_path)?;
            config.apply_env()?;
            println!("Effective values (with env overrides):");
            println!();
            print!("{}", config.to_toml()?);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults (valid).", config_path.display());
                return Ok(());
            }

            let config = RelayConfig::load(config_path)?;
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration problems:");
                for problem in &problems {
                    println!("  - {}", problem);
                }
                println!();
                bail!("{} problem(s) in {}", problems.len(), config_path.display());
            }
            println!();
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                println!("{} already exists.", config_path.display());
                println!("Use --force to overwrite it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
                && !parent.exists()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }

            RelayConfig::default().save(config_path)?;

            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [supervisor] binary, timeout_ms");
            println!("  - [queue] / [breaker] concurrency and failure limits");
            println!("  - [watcher] dir, debounce_ms, suffixes");
            println!("  - [server] host, port");
            println!();
        }
    }

    Ok(())
}
