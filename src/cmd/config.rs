//! Configuration view and validation commands for `outreach config`.

use anyhow::Result;

use outreach::outreach_config::{CONFIG_FILE_NAME, OutreachConfig};

use super::super::ConfigCommands;

fn print_effective(config: &OutreachConfig) {
    println!("[server]");
    println!("  host = \"{}\"", config.server.host);
    println!("  port = {}", config.server.port);
    println!("  db_path = \"{}\"", config.server.db_path.display());
    println!("  cors = {}", config.server.cors);
    println!();
    println!("[batch]");
    println!("  call_timeout_secs = {}", config.batch.call_timeout_secs);
    println!("  lease_ttl_secs = {}", config.batch.lease_ttl_secs);
    println!("  max_window_wait_secs = {}", config.batch.max_window_wait_secs);
    println!("  claim_backoff_ms = {}", config.batch.claim_backoff_ms);
    let excluded: Vec<_> = config.batch.excluded_statuses.iter().map(|s| s.as_str()).collect();
    println!("  excluded_statuses = {:?}", excluded);
    println!("  event_capacity = {}", config.batch.event_capacity);
    println!();
    println!("[adapter]");
    println!("  base_url = \"{}\"", config.adapter.base_url);
    println!("  request_timeout_secs = {}", config.adapter.request_timeout_secs);
    println!();
    println!("[classifier]");
    println!("  hot_keywords = {:?}", config.classifier.hot_keywords);
    println!("  warm_keywords = {:?}", config.classifier.warm_keywords);
    println!();
    println!("[logging]");
    println!("  format = \"{}\"", config.logging.format);
    println!("  level = \"{}\"", config.logging.level);
    if let Some(dir) = &config.logging.dir {
        println!("  dir = \"{}\"", dir.display());
    }
    println!();
}

pub fn cmd_config(config_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config_dir.join(CONFIG_FILE_NAME);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Outreach Configuration");
            println!("======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No outreach.toml found at {}", config_path.display());
                println!("Using defaults. Run 'outreach config init' to create one.");
            }
            println!();

            println!("Effective values (with env overrides):");
            println!();
            let config = OutreachConfig::resolve(config_dir)?;
            print_effective(&config);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = OutreachConfig::resolve(config_dir)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                if config_path.exists() {
                    println!("Configuration is valid.");
                } else {
                    println!("No outreach.toml found. Using defaults (valid).");
                }
            } else {
                println!("Configuration problems:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
                println!();
                anyhow::bail!("{} configuration problem(s) found", warnings.len());
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("outreach.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !config_dir.exists() {
                std::fs::create_dir_all(config_dir)?;
            }
            OutreachConfig::default().save(&config_path)?;

            println!("Created outreach.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, db_path");
            println!("  - [batch] timeouts, lease TTL, excluded statuses");
            println!("  - [adapter] base_url of the telephony service");
            println!("  - [classifier] hot and warm keywords");
            println!();
        }
    }

    Ok(())
}
