use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the report builder.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Search backend connection configuration.
    #[serde(default)]
    pub search: SearchConfig,

    /// IP geolocation database configuration.
    #[serde(default)]
    pub geoip: GeoIpConfig,

    /// Report database connection configuration.
    #[serde(default)]
    pub report_db: ReportDbConfig,

    /// Path of the last-successful-run checkpoint file.
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
}

/// Search backend connection configuration.
#[derive(Debug, Deserialize)]
pub struct SearchConfig {
    /// Cluster endpoints, tried in order (e.g. "https://search1:9200").
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Connection timeout. Default: 60s.
    #[serde(default = "default_search_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            endpoints: Vec::new(),
            connect_timeout: default_search_timeout(),
        }
    }
}

/// IP geolocation database configuration.
#[derive(Debug, Default, Deserialize)]
pub struct GeoIpConfig {
    /// Path of the ip_from/ip_to CSV range file.
    #[serde(default)]
    pub database: PathBuf,
}

/// Report database connection configuration.
#[derive(Debug, Deserialize)]
pub struct ReportDbConfig {
    /// Database hosts as `host[:port]`, tried in order.
    #[serde(default)]
    pub hosts: Vec<String>,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub database: String,

    /// Connection timeout. Default: 10s.
    #[serde(default = "default_db_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ReportDbConfig {
    fn default() -> Self {
        ReportDbConfig {
            hosts: Vec::new(),
            user: String::new(),
            password: String::new(),
            database: String::new(),
            connect_timeout: default_db_timeout(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("/var/lib/auditoor/report.date")
}

fn default_search_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_db_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.search.endpoints.is_empty() {
            bail!("search.endpoints is required");
        }
        if self.search.endpoints.iter().any(|e| e.is_empty()) {
            bail!("search.endpoints must not contain empty entries");
        }

        if self.geoip.database.as_os_str().is_empty() {
            bail!("geoip.database is required");
        }

        if self.report_db.hosts.is_empty() {
            bail!("report_db.hosts is required");
        }
        if self.report_db.user.is_empty() {
            bail!("report_db.user is required");
        }
        if self.report_db.database.is_empty() {
            bail!("report_db.database is required");
        }

        if self.checkpoint_path.as_os_str().is_empty() {
            bail!("checkpoint_path is required");
        }

        Ok(())
    }
}
