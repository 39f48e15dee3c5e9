use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::warn;

/// Persisted marker of the last fully processed run, holding one
/// `YYYY-MM-DD` value. The next run's window is derived from it, never from
/// wall-clock alone, so no day is silently skipped.
pub struct Checkpoint {
    path: PathBuf,
}

impl Checkpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Checkpoint { path: path.into() }
    }

    /// Reads the checkpoint date. Absent file means no checkpoint;
    /// unparseable content is treated the same, with a warning, so a
    /// corrupted file degrades to the default window instead of aborting.
    pub fn load(&self) -> Result<Option<NaiveDate>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("reading checkpoint file {}", self.path.display())
                })
            }
        };

        match data.trim().parse::<NaiveDate>() {
            Ok(date) => Ok(Some(date)),
            Err(_) => {
                warn!(
                    path = %self.path.display(),
                    content = data.trim(),
                    "ignoring unparseable checkpoint"
                );
                Ok(None)
            }
        }
    }

    /// Atomically replaces the checkpoint with `date` (temp file + rename,
    /// so a crash mid-write never leaves a torn value).
    pub fn store(&self, date: NaiveDate) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, format!("{}\n", date.format("%Y-%m-%d")))
            .with_context(|| format!("writing checkpoint file {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing checkpoint file {}", self.path.display()))?;
        Ok(())
    }
}
