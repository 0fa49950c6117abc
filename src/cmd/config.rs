//! Configuration view and validation commands: `propyield config`.

use anyhow::{Context, Result};
use std::path::Path;

use propyield::config::{AppConfig, CONFIG_FILE_NAME, PropyieldToml};

use super::super::ConfigCommands;

fn set_or_unset(value: Option<String>) -> &'static str {
    if value.is_some() { "set" } else { "unset" }
}

pub fn cmd_config(data_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = data_dir.join(CONFIG_FILE_NAME);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("propyield configuration");
            println!("=======================");
            println!();

            let config = AppConfig::new(data_dir.to_path_buf())?;
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}", CONFIG_FILE_NAME, config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let shown = toml::to_string_pretty(&config.toml.redacted())
                .context("Failed to render configuration")?;
            println!("{}", shown.trim_end());
            println!();

            // Env overrides are resolved at read time, so show what is in effect.
            println!("Effective values (with env overrides):");
            println!("  database = {}", config.db_path().display());
            println!("  openai_api_key = {}", set_or_unset(config.toml.openai_api_key()));
            println!("  assistant_id = {}", set_or_unset(config.toml.assistant_id()));
            println!("  maps_api_key = {}", set_or_unset(config.toml.maps_api_key()));
            println!("  admin_token = {}", set_or_unset(config.toml.admin_token()));
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let toml = if config_path.exists() {
                PropyieldToml::load(&config_path)?
            } else {
                println!("No {} found. Checking defaults.", CONFIG_FILE_NAME);
                PropyieldToml::default()
            };
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE_NAME, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(data_dir).with_context(|| {
                format!("Failed to create data directory {}", data_dir.display())
            })?;
            PropyieldToml::default().save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE_NAME, config_path.display());
            println!();
            println!("Secrets are best kept in the environment or a .env file:");
            println!("  OPENAI_API_KEY, OPENAI_ASSISTANT_ID, GOOGLE_MAPS_API_KEY, PROPYIELD_ADMIN_TOKEN");
            println!();
        }
    }

    Ok(())
}
