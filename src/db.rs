use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono_tz::Tz;
use rusqlite::Connection;

use crate::sample::Sample;

pub const BATCH_TIME_FORMAT: &str = "%Y-%m-%d %H-%M-%S";
pub const BATCH_FILE_EXTENSION: &str = "db";

/// Destination for drained batches. One call per batch.
pub trait BatchStore {
    fn write(&mut self, batch: &[Sample]) -> Result<PathBuf, anyhow::Error>;
}

/// `data-YYYY-MM-DD HH-MM-SS.<ext>` for the earliest sample in `batch`.
pub fn batch_file_name(batch: &[Sample], tz: &Tz, ext: &str) -> Option<String> {
    let earliest = batch.iter().map(|s| s.timestamp).min()?;
    Some(format!(
        "data-{}.{ext}",
        earliest.with_timezone(tz).format(BATCH_TIME_FORMAT)
    ))
}

/// Writes every batch into its own SQLite file under `dir`.
#[derive(Debug)]
pub struct SqliteBatchStore {
    dir: PathBuf,
    tz: Tz,
}

impl SqliteBatchStore {
    pub fn new(dir: impl Into<PathBuf>, tz: Tz) -> Result<Self, anyhow::Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
        Ok(Self { dir, tz })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl BatchStore for SqliteBatchStore {
    fn write(&mut self, batch: &[Sample]) -> Result<PathBuf, anyhow::Error> {
        let name = batch_file_name(batch, &self.tz, BATCH_FILE_EXTENSION)
            .context("Refusing to write an empty batch")?;
        let path = self.dir.join(name);

        let mut conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database file {}", path.display()))?;
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pin INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                humidity REAL NOT NULL,
                temperature_f REAL NOT NULL
            );
            ",
        )
        .context("Failed to create table")?;

        let tx = conn.transaction().context("Failed to begin transaction")?;
        {
            let mut stmt = tx
                .prepare(
                    r"
                    INSERT INTO samples (pin, timestamp, humidity, temperature_f) VALUES (?1, ?2, ?3, ?4)",
                )
                .context("Failed to prepare insert")?;
            for sample in batch {
                stmt.execute(rusqlite::params![
                    sample.pin,
                    sample.timestamp.to_rfc3339(),
                    sample.humidity,
                    sample.temperature_f,
                ])
                .context("Failed to insert sample into table")?;
            }
        }
        tx.commit().context("Failed to commit batch")?;

        Ok(path)
    }
}
