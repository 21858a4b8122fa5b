//! Configuration for the outreach orchestrator.
//!
//! Settings are read from `outreach.toml`, then environment variables, then
//! CLI flags, each layer overriding the previous one. Every field has a
//! default, so an empty or missing file is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3180
//! db_path = ".outreach/outreach.db"
//! cors = false
//!
//! [batch]
//! call_timeout_secs = 90
//! lease_ttl_secs = 180
//! max_window_wait_secs = 900
//! claim_backoff_ms = 500
//! excluded_statuses = ["HOT"]
//! event_capacity = 1024
//!
//! [adapter]
//! base_url = "http://127.0.0.1:8090"
//! request_timeout_secs = 120
//!
//! [classifier]
//! hot_keywords = ["sign up", "buy"]
//! warm_keywords = ["pricing", "call me back"]
//!
//! [logging]
//! format = "pretty"
//! level = "info"
//! dir = ".outreach/logs"
//! ```
//!
//! Recognized environment overrides: `OUTREACH_HOST`, `OUTREACH_PORT`,
//! `OUTREACH_DB_PATH`, `OUTREACH_ADAPTER_URL`, `OUTREACH_LOG_FORMAT`,
//! `OUTREACH_LOG_DIR`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use outreach_common::InterestStatus;

use crate::batch::BatchSettings;
use crate::batch::classify::KeywordClassifier;

pub const CONFIG_FILE_NAME: &str = "outreach.toml";

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Permissive CORS for a locally served dashboard
    pub cors: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3180,
            db_path: PathBuf::from(".outreach/outreach.db"),
            cors: false,
        }
    }
}

/// Executor loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    pub call_timeout_secs: u64,
    pub lease_ttl_secs: u64,
    pub max_window_wait_secs: u64,
    pub claim_backoff_ms: u64,
    /// Interest statuses never dialed automatically
    pub excluded_statuses: Vec<InterestStatus>,
    /// Buffered events per stream subscriber before it lags
    pub event_capacity: usize,
}

impl Default for BatchSection {
    fn default() -> Self {
        let defaults = BatchSettings::default();
        Self {
            call_timeout_secs: defaults.call_timeout.as_secs(),
            lease_ttl_secs: defaults.lease_ttl.as_secs(),
            max_window_wait_secs: defaults.max_window_wait.as_secs(),
            claim_backoff_ms: defaults.claim_backoff.as_millis() as u64,
            excluded_statuses: defaults.excluded_statuses,
            event_capacity: crate::batch::emitter::DEFAULT_CAPACITY,
        }
    }
}

impl BatchSection {
    pub fn to_settings(&self) -> BatchSettings {
        BatchSettings {
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            max_window_wait: Duration::from_secs(self.max_window_wait_secs),
            claim_backoff: Duration::from_millis(self.claim_backoff_ms),
            excluded_statuses: self.excluded_statuses.clone(),
        }
    }
}

/// External telephony service the HTTP call adapter talks to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSection {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

impl Default for AdapterSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8090".to_string(),
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub format: LogFormat,
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    /// Directory for daily-rolling log files; stderr only when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: "info".to_string(),
            dir: None,
        }
    }
}

/// Contents of `outreach.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutreachConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub batch: BatchSection,
    #[serde(default)]
    pub adapter: AdapterSection,
    #[serde(default)]
    pub classifier: KeywordClassifier,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl OutreachConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse outreach.toml")
    }

    /// Load `outreach.toml` from `dir`, or the defaults if there is none.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize outreach.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `OUTREACH_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = var("OUTREACH_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("OUTREACH_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid OUTREACH_PORT '{}'", port))?;
        }
        if let Some(path) = var("OUTREACH_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Some(url) = var("OUTREACH_ADAPTER_URL") {
            self.adapter.base_url = url;
        }
        if let Some(format) = var("OUTREACH_LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        if let Some(dir) = var("OUTREACH_LOG_DIR") {
            self.logging.dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// Load from `dir` and apply environment overrides.
    pub fn resolve(dir: &Path) -> Result<Self> {
        let mut config = Self::load_or_default(dir)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Validate the configuration and return any problems found.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.batch.call_timeout_secs == 0 {
            warnings.push("batch.call_timeout_secs must be greater than 0".to_string());
        }
        if self.batch.lease_ttl_secs == 0 {
            warnings.push("batch.lease_ttl_secs must be greater than 0".to_string());
        }
        // A lease that can expire during one call lets a second loop take over.
        if self.batch.lease_ttl_secs <= self.batch.call_timeout_secs {
            warnings.push(format!(
                "batch.lease_ttl_secs ({}) must exceed batch.call_timeout_secs ({})",
                self.batch.lease_ttl_secs, self.batch.call_timeout_secs
            ));
        }
        if self.batch.max_window_wait_secs == 0 {
            warnings.push("batch.max_window_wait_secs must be greater than 0".to_string());
        }
        if self.batch.event_capacity == 0 {
            warnings.push("batch.event_capacity must be greater than 0".to_string());
        }
        if !self.adapter.base_url.starts_with("http://")
            && !self.adapter.base_url.starts_with("https://")
        {
            warnings.push(format!(
                "adapter.base_url '{}' is not an http(s) URL",
                self.adapter.base_url
            ));
        }
        if self.adapter.request_timeout_secs < self.batch.call_timeout_secs {
            warnings.push(format!(
                "adapter.request_timeout_secs ({}) is shorter than batch.call_timeout_secs ({})",
                self.adapter.request_timeout_secs, self.batch.call_timeout_secs
            ));
        }
        if self.classifier.hot_keywords.is_empty() && self.classifier.warm_keywords.is_empty() {
            warnings.push("classifier has no keywords; every answered call scores COLD".to_string());
        }

        warnings
    }

    /// Base URL of a running server, for remote CLI commands.
    pub fn server_url(&self) -> String {
        format!("http://{}:{}", self.server.host, self.server.port)
    }
}
