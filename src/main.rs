use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use outreach::outreach_config::{LogFormat, OutreachConfig};

mod cmd;

#[derive(Parser)]
#[command(name = "outreach")]
#[command(version, about = "Sequential outreach orchestrator with live event streaming")]
pub struct Cli {
    /// Directory holding outreach.toml (defaults to the current directory)
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Server URL for remote commands. Overrides [server] host/port.
    #[arg(long, global = true, env = "OUTREACH_SERVER_URL")]
    pub server: Option<String>,

    /// Log output format: pretty, json
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind
        #[arg(long)]
        host: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Base URL of the telephony service
        #[arg(long)]
        adapter_url: Option<String>,

        /// Enable permissive CORS for a locally served dashboard
        #[arg(long)]
        cors: bool,
    },
    /// Create outreach.toml and the database if they do not exist
    Init {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Start a batch job for a campaign
    Start {
        campaign_id: i64,

        /// Skip contacts called within this many hours
        #[arg(long, default_value = "0")]
        cooldown_hours: u32,

        /// Consecutive outside-window retries before the job pauses
        #[arg(long, default_value = "3")]
        max_retries: u32,
    },
    /// Pause a running batch job after its in-flight call
    Pause { job_id: i64 },
    /// Resume a paused batch job
    Resume { job_id: i64 },
    /// Cancel a batch job
    Stop {
        job_id: i64,

        /// Operator recorded as having cancelled the job
        #[arg(long, env = "USER", default_value = "cli")]
        by: String,
    },
    /// Show the current batch job and contacts of a campaign
    Status {
        campaign_id: i64,

        /// Print the read model as JSON
        #[arg(long)]
        json: bool,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default outreach.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config_dir = match cli.config_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&config_dir, command.clone());
    }

    let mut config = OutreachConfig::resolve(&config_dir)?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    let _log_guard = outreach::logging::init_logging(&config.logging)?;
    let server_url = cli.server.clone().unwrap_or_else(|| config.server_url());

    match cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            adapter_url,
            cors,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(db_path) = db_path {
                config.server.db_path = db_path;
            }
            if let Some(url) = adapter_url {
                config.adapter.base_url = url;
            }
            config.server.cors |= cors;
            cmd::cmd_serve(config).await?;
        }
        Commands::Init { db_path } => {
            let db_path = db_path.unwrap_or_else(|| config.server.db_path.clone());
            cmd::cmd_init(&config_dir, &db_path)?;
        }
        Commands::Start {
            campaign_id,
            cooldown_hours,
            max_retries,
        } => cmd::cmd_start(&server_url, campaign_id, cooldown_hours, max_retries).await?,
        Commands::Pause { job_id } => cmd::cmd_pause(&server_url, job_id).await?,
        Commands::Resume { job_id } => cmd::cmd_resume(&server_url, job_id).await?,
        Commands::Stop { job_id, by } => cmd::cmd_stop(&server_url, job_id, &by).await?,
        Commands::Status { campaign_id, json } => {
            cmd::cmd_status(&server_url, campaign_id, json).await?
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}
