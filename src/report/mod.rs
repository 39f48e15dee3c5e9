use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use tracing::{debug, info, warn};

use crate::config::ReportDbConfig;

/// One destination row: aggregation key plus location metrics and count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRow {
    pub tenant: String,
    pub date: NaiveDate,
    pub service: String,
    pub activity: String,
    pub country_code: String,
    pub longitude: String,
    pub latitude: String,
    pub domain: String,
    pub number: u64,
}

/// Destination store for aggregated rows, behind a trait so the run driver
/// can be exercised against an in-memory fake.
pub trait ReportSink: Send + Sync {
    /// Persists one day's rows in a single atomic transaction. A day is
    /// always recomputed from scratch, so existing rows are overwritten
    /// (last-writer-wins); re-running the same day is idempotent.
    fn write_day(
        &self,
        day: NaiveDate,
        rows: &[ReportRow],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

const UPSERT: &str = "INSERT INTO activity_info \
    (tenant, date, service, activity, country_code, longitude, latitude, domain, number) \
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
    ON DUPLICATE KEY UPDATE number = VALUES(number), \
    longitude = VALUES(longitude), latitude = VALUES(latitude)";

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS activity_info (\
    tenant VARCHAR(64) NOT NULL, \
    date DATE NOT NULL, \
    service VARCHAR(64) NOT NULL, \
    activity VARCHAR(32) NOT NULL, \
    country_code VARCHAR(8) NOT NULL, \
    longitude VARCHAR(16) NOT NULL DEFAULT '', \
    latitude VARCHAR(16) NOT NULL DEFAULT '', \
    domain VARCHAR(255) NOT NULL DEFAULT '-', \
    number BIGINT UNSIGNED NOT NULL, \
    UNIQUE KEY activity_info_key (tenant, date, service, activity, country_code, domain)\
    )";

/// MySQL report store.
pub struct MySqlReport {
    pool: MySqlPool,
}

impl MySqlReport {
    /// Connects to the first reachable host of a replicated report database.
    /// Hosts are `host[:port]`; failover is sequential, not parallel.
    pub async fn connect(cfg: &ReportDbConfig) -> Result<Self> {
        let timeout = if cfg.connect_timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.connect_timeout
        };

        for host in &cfg.hosts {
            let (host, port) = match host.rsplit_once(':') {
                Some((h, p)) => (
                    h,
                    p.parse::<u16>()
                        .with_context(|| format!("invalid port in report host {host}"))?,
                ),
                None => (host.as_str(), 3306),
            };

            let options = MySqlConnectOptions::new()
                .host(host)
                .port(port)
                .username(&cfg.user)
                .password(&cfg.password)
                .database(&cfg.database);

            match MySqlPoolOptions::new()
                .max_connections(1)
                .acquire_timeout(timeout)
                .connect_with(options)
                .await
            {
                Ok(pool) => {
                    info!(host, port, "connected to report database");
                    return Ok(MySqlReport { pool });
                }
                Err(err) => {
                    warn!(host, port, error = %err, "report database host unreachable");
                }
            }
        }

        bail!("no reachable report database host");
    }

    /// Creates the destination table when it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .context("creating activity_info table")?;
        Ok(())
    }
}

impl ReportSink for MySqlReport {
    async fn write_day(&self, day: NaiveDate, rows: &[ReportRow]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("opening report transaction")?;

        for row in rows {
            let result = sqlx::query(UPSERT)
                .bind(&row.tenant)
                .bind(row.date)
                .bind(&row.service)
                .bind(&row.activity)
                .bind(&row.country_code)
                .bind(&row.longitude)
                .bind(&row.latitude)
                .bind(&row.domain)
                .bind(row.number)
                .execute(&mut *tx)
                .await;

            if let Err(err) = result {
                // Roll back the whole day; partial days are never committed.
                if let Err(rb) = tx.rollback().await {
                    warn!(%day, error = %rb, "rollback failed");
                }
                return Err(err).with_context(|| {
                    format!(
                        "upserting row ({}, {}, {}, {})",
                        row.tenant, row.date, row.service, row.activity
                    )
                });
            }
        }

        tx.commit()
            .await
            .with_context(|| format!("committing report rows for {day}"))?;

        debug!(%day, rows = rows.len(), "report rows committed");
        Ok(())
    }
}
