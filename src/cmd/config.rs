//! Configuration view and validation commands (`dockhand config`).

use std::path::Path;

use anyhow::Result;

use super::super::ConfigCommands;
use dockhand::config::DockhandConfig;

const REDACTED: &str = "<redacted>";

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No {} found, showing defaults", config_path.display());
            }
            println!("# Effective values (with env overrides)");
            println!();

            let mut config = DockhandConfig::resolve(config_path)?;
            if config.webhook.secret.is_some() {
                config.webhook.secret = Some(REDACTED.to_string());
            }
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            println!("Validating configuration...");

            let config = DockhandConfig::resolve(config_path)?;
            let warnings = config.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists.", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(config_path, DockhandConfig::default().to_toml()?)?;
            println!("Created {}", config_path.display());
        }
    }

    Ok(())
}
