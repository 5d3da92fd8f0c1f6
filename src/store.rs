//! Durable storage for the latest [Snapshot] and the
//! append-only activity log.
//!
//! The store owns every file in its directory. Nothing
//! else in the crate reads or writes those files directly.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::snapshot::Snapshot;
use crate::watch::{ChangeEvent, ChangeKind};

mod export;
pub use export::ExportFormat;

/// Default directory, relative to the project root,
/// that holds everything the store writes.
pub const DEFAULT_REPORT_DIR: &str = "activity_tracker";

/// File name of the persisted report.
const REPORT_FILE: &str = "report.yml";

/// File name the report is staged under before
/// it atomically replaces [REPORT_FILE].
const REPORT_STAGING_FILE: &str = "report.yml.tmp";

/// File name of the activity log.
const LOG_FILE: &str = "log.txt";

/// Format of timestamps in activity log lines.
const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Reads and writes a project's report and activity log.
#[derive(Clone, Debug)]
pub struct ReportStore {
    dir: PathBuf,
}

impl ReportStore {
    /// Returns a store that keeps its files in `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the directory holding the store's files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join(REPORT_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    /// Returns every path this store may write to.
    pub fn written_paths(&self) -> Vec<PathBuf> {
        let mut paths = vec![
            self.dir.clone(),
            self.report_path(),
            self.dir.join(REPORT_STAGING_FILE),
            self.log_path(),
        ];
        paths.extend(ExportFormat::ALL.iter().map(|format| self.export_path(*format)));
        paths
    }

    /// Loads the last persisted snapshot.
    ///
    /// Returns `Ok(None)` if no snapshot has been persisted yet.
    pub async fn load(&self) -> Result<Option<Snapshot>, StoreError> {
        let path = self.report_path();
        let yaml = match fs::read_to_string(&path).await {
            Ok(yaml) => yaml,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        let snapshot = serde_yaml::from_str(&yaml).map_err(|e| StoreError::Malformed {
            path,
            message: e.to_string(),
        })?;

        Ok(Some(snapshot))
    }

    /// Atomically replaces the persisted snapshot with `snapshot`.
    ///
    /// The snapshot is staged in a sibling file and renamed over
    /// the report, so readers see either the old or the new
    /// report in full.
    pub async fn save(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let yaml = serde_yaml::to_string(snapshot).map_err(|e| StoreError::Encode {
            path: self.report_path(),
            message: e.to_string(),
        })?;

        self.ensure_dir().await?;

        let staging = self.dir.join(REPORT_STAGING_FILE);
        fs::write(&staging, yaml)
            .await
            .map_err(|source| StoreError::Io {
                path: staging.clone(),
                source,
            })?;

        let report = self.report_path();
        fs::rename(&staging, &report)
            .await
            .map_err(|source| StoreError::Io {
                path: report.clone(),
                source,
            })?;

        tracing::debug!("Saved report to {}", report.display());
        Ok(())
    }

    /// Appends `entries` to the activity log, creating the log
    /// (and the store directory) if they don't exist.
    ///
    /// All entries are written with a single write.
    pub async fn append_log(&self, entries: &[ActivityLogEntry]) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }

        self.ensure_dir().await?;

        let mut lines = String::new();
        for entry in entries {
            lines.push_str(&entry.to_string());
            lines.push('\n');
        }

        let path = self.log_path();
        let io_error = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        let mut log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_error)?;
        log.write_all(lines.as_bytes()).await.map_err(io_error)?;
        log.flush().await.map_err(io_error)?;

        Ok(())
    }

    async fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })
    }
}

/// One line of the activity log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivityLogEntry {
    pub timestamp: DateTime<Local>,
    pub kind: ChangeKind,
    /// Path relative to the project root, with forward slashes.
    pub path: String,
}

impl From<&ChangeEvent> for ActivityLogEntry {
    fn from(change: &ChangeEvent) -> Self {
        Self {
            timestamp: change.timestamp,
            kind: change.kind,
            path: change.display_path(),
        }
    }
}

impl fmt::Display for ActivityLogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.timestamp.format(LOG_TIMESTAMP_FORMAT),
            self.kind,
            self.path
        )
    }
}

/// An error that occurs while reading or writing a [ReportStore].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted file couldn't be parsed.
    #[error("malformed {}: {message}", path.display())]
    Malformed { path: PathBuf, message: String },

    /// A snapshot couldn't be encoded.
    #[error("failed to encode {}: {message}", path.display())]
    Encode { path: PathBuf, message: String },

    /// No report has been persisted yet.
    #[error("no report found at {}", .0.display())]
    NoReport(PathBuf),
}
