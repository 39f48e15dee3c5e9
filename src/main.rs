use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use auditoor::checkpoint::Checkpoint;
use auditoor::config::Config;
use auditoor::driver::Runner;
use auditoor::geo::RangeDb;
use auditoor::report::MySqlReport;
use auditoor::search::Client;

/// Daily cloud-service audit activity report builder.
#[derive(Parser)]
#[command(name = "auditoor", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Reprocess the last N days (1-7) regardless of the checkpoint.
    days: Option<i64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} ({}/{})",
            RELEASE,
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("auditoor {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for a report run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    let override_days = match cli.days {
        Some(days) if (1..=7).contains(&days) => Some(days),
        Some(days) => {
            tracing::warn!(days, "day count out of range (1-7), using checkpoint logic");
            None
        }
        None => None,
    };

    tracing::info!(version = version::RELEASE, "starting auditoor");

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg, override_days).await })
}

async fn run(cfg: Config, override_days: Option<i64>) -> Result<()> {
    // Configuration and connectivity failures here are fatal; once the day
    // loop starts, failures are handled at day granularity inside the
    // runner and the process still exits cleanly.
    let search = Client::new(&cfg.search)?;
    let geo_db = RangeDb::load(&cfg.geoip.database)
        .with_context(|| format!("loading geo database {}", cfg.geoip.database.display()))?;
    let store = MySqlReport::connect(&cfg.report_db).await?;
    store.ensure_schema().await?;
    let checkpoint = Checkpoint::new(cfg.checkpoint_path.clone());

    let now = Local::now();
    let tz = *now.offset();
    let today = now.date_naive();

    let mut runner = Runner::new(search, geo_db, store, checkpoint, tz);
    let summary = runner.run(override_days, today).await?;

    tracing::info!(
        start = %summary.start,
        days_completed = summary.days_completed,
        failed_day = ?summary.failed_day,
        "auditoor finished",
    );

    Ok(())
}
