use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::aggregator::record::{TpsRecord, CSV_HEADER};

/// Durable CSV report of every emitted record.
///
/// The file is truncated on creation and synced to disk after each row.
pub struct ReportWriter {
    path: PathBuf,
    file: File,
}

impl ReportWriter {
    /// Creates or truncates the report and writes the header.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .with_context(|| format!("creating report file {}", path.display()))?;

        let mut writer = Self { path, file };
        writer.write_line(&format!("{CSV_HEADER}\n"))?;

        tracing::info!(path = %writer.path.display(), "report file created");

        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record.
    pub fn write(&mut self, record: &TpsRecord) -> Result<()> {
        self.write_line(&record.csv_row())
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("writing report file {}", self.path.display()))?;
        self.file
            .flush()
            .with_context(|| format!("flushing report file {}", self.path.display()))?;
        self.file
            .sync_data()
            .with_context(|| format!("syncing report file {}", self.path.display()))
    }
}
