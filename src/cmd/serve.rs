//! Server and setup commands for `outreach serve`, `outreach init`.

use anyhow::Result;
use std::path::Path;

use outreach::batch::server::{ServerConfig, open_db, start_server};
use outreach::outreach_config::{CONFIG_FILE_NAME, OutreachConfig};

pub async fn cmd_serve(config: OutreachConfig) -> Result<()> {
    let warnings = config.validate();
    if !warnings.is_empty() {
        for warning in &warnings {
            eprintln!("  - {}", warning);
        }
        anyhow::bail!("Invalid configuration; run 'outreach config validate' for details");
    }

    start_server(ServerConfig::from(&config)).await
}

pub fn cmd_init(config_dir: &Path, db_path: &Path) -> Result<()> {
    let config_path = config_dir.join(CONFIG_FILE_NAME);
    if config_path.exists() {
        println!("Using existing {}", config_path.display());
    } else {
        std::fs::create_dir_all(config_dir)?;
        OutreachConfig::default().save(&config_path)?;
        println!("Created {}", config_path.display());
    }

    let db_path = if db_path.is_relative() {
        config_dir.join(db_path)
    } else {
        db_path.to_path_buf()
    };
    open_db(&db_path)?;
    println!("Outreach database initialized at {}", db_path.display());
    Ok(())
}
