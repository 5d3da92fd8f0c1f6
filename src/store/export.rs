//! Exports of the persisted report into other formats.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde_yaml::Value;
use tokio::fs;

use super::{ReportStore, StoreError};
use crate::snapshot::Snapshot;

/// A format the persisted report can be exported to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 2] = [ExportFormat::Json, ExportFormat::Csv];

    /// Returns the extension of files in this format.
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(format!("unsupported format: {}", other)),
        }
    }
}

impl ReportStore {
    /// Returns the path the report is exported to in `format`.
    pub fn export_path(&self, format: ExportFormat) -> PathBuf {
        self.dir.join(format!("report.{}", format.extension()))
    }

    /// Exports the persisted report in `format`, returning
    /// the path of the exported file.
    pub async fn export(&self, format: ExportFormat) -> Result<PathBuf, StoreError> {
        let snapshot = self
            .load()
            .await?
            .ok_or_else(|| StoreError::NoReport(self.report_path()))?;

        let path = self.export_path(format);
        let contents = match format {
            ExportFormat::Json => {
                serde_json::to_string_pretty(&snapshot).map_err(|e| StoreError::Encode {
                    path: path.clone(),
                    message: e.to_string(),
                })?
            }
            ExportFormat::Csv => to_csv(&snapshot),
        };

        fs::write(&path, contents)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;

        tracing::info!("Exported report to {}", path.display());
        Ok(path)
    }
}

/// Renders `snapshot` as `Key,Value` rows.
///
/// Mappings are listed one entry per row below their key,
/// sequences one item per row below an item count.
fn to_csv(snapshot: &Snapshot) -> String {
    let mut csv = String::new();
    push_row(&mut csv, "Key", "Value");

    for (key, value) in snapshot.iter() {
        match value {
            Value::Mapping(entries) => {
                push_row(&mut csv, key, "");
                for (entry_key, entry_value) in entries {
                    push_row(
                        &mut csv,
                        &format!("  {}", cell(entry_key)),
                        &json_cell(entry_value),
                    );
                }
            }
            Value::Sequence(items) => {
                push_row(&mut csv, key, &format!("{} items", items.len()));
                for item in items {
                    push_row(&mut csv, "", &cell(item));
                }
            }
            scalar => push_row(&mut csv, key, &cell(scalar)),
        }
    }

    csv
}

/// Renders a value as plain text, falling back to JSON
/// for anything that isn't a scalar.
fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => json_cell(other),
    }
}

fn json_cell(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| format!("{:?}", value))
}

fn push_row(csv: &mut String, key: &str, value: &str) {
    csv.push_str(&quote(key));
    csv.push(',');
    csv.push_str(&quote(value));
    csv.push('\n');
}

/// Quotes a CSV field if it contains a delimiter, quote, or line break.
fn quote(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
