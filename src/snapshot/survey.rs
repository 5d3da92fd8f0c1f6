//! A static survey of a Rails-style project tree.
//!
//! The survey reads files and the project's git history; it
//! never boots the application, so model reflection and route
//! tables are not part of the resulting snapshot.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::SystemTime;

use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};

use super::{ProducesSnapshots, ProductionError, Snapshot};

/// Application directories whose Ruby files are listed and counted.
const APP_DIRS: &[(&str, &str)] = &[
    ("models", "app/models"),
    ("controllers", "app/controllers"),
    ("jobs", "app/jobs"),
    ("mailers", "app/mailers"),
    ("services", "app/services"),
];

/// Number of recently modified migrations to report.
const RECENT_MIGRATIONS: usize = 10;

/// Number of commits to report.
const GIT_LOG_DEPTH: usize = 20;

/// Reported when no Rails version can be found in `Gemfile.lock`.
const NOT_RAILS: &str = "Not a Rails project";

/// Reported when no database adapter can be determined.
const UNKNOWN_DATABASE: &str = "Unknown";

/// Produces [Snapshot]s by statically surveying a project tree.
#[derive(Clone, Debug, Default)]
pub struct ProjectSurvey;

impl ProducesSnapshots for ProjectSurvey {
    fn produce(&self, root: &Path) -> Result<Snapshot, ProductionError> {
        if !root.is_dir() {
            return Err(ProductionError::MissingRoot(root.to_path_buf()));
        }
        // Relative roots like `.` have no name of their own.
        let root = &std::fs::canonicalize(root).map_err(|source| ProductionError::Io {
            path: root.to_path_buf(),
            source,
        })?;

        let project_name = root
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut snapshot = Snapshot::new()
            .with("project_name", project_name)
            .with("ruby_version", ruby_version(root)?)
            .with("rails_version", rails_version(root)?)
            .with("database", database_adapter(root)?);

        for (key, dir) in APP_DIRS {
            snapshot = snapshot.with(*key, list_ruby_files(root, dir)?);
        }

        Ok(snapshot
            .with("migrations", migration_changes(root)?)
            .with("schema_hash", schema_hash(root)?)
            .with("git_log", git_log(root)))
    }
}

/// Reads `path`, returning `None` if it doesn't exist.
fn read_optional(path: &Path) -> Result<Option<String>, ProductionError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ProductionError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn ruby_version(root: &Path) -> Result<Value, ProductionError> {
    Ok(read_optional(&root.join(".ruby-version"))?
        .map(|version| version.trim().to_string())
        .filter(|version| !version.is_empty())
        .map(Value::from)
        .unwrap_or(Value::Null))
}

fn rails_version(root: &Path) -> Result<Value, ProductionError> {
    let Some(lockfile) = read_optional(&root.join("Gemfile.lock"))? else {
        return Ok(NOT_RAILS.into());
    };

    // Locked gems are listed as `    rails (7.1.3)`.
    let version = lockfile.lines().find_map(|line| {
        line.trim()
            .strip_prefix("rails (")
            .and_then(|rest| rest.strip_suffix(')'))
            .map(str::to_string)
    });

    Ok(version.unwrap_or_else(|| NOT_RAILS.into()).into())
}

fn database_adapter(root: &Path) -> Result<Value, ProductionError> {
    let path = root.join("config/database.yml");
    let Some(contents) = read_optional(&path)? else {
        return Ok(UNKNOWN_DATABASE.into());
    };

    // ERB makes some real database.yml files unparseable
    // outside Rails; those are reported as unknown.
    let adapter = serde_yaml::from_str::<Value>(&contents)
        .and_then(|mut config| {
            // Rails environments inherit `<<: *default`.
            config.apply_merge()?;
            Ok(config)
        })
        .ok()
        .and_then(|config| {
            config
                .get("development")?
                .get("adapter")?
                .as_str()
                .map(str::to_string)
        });

    match adapter {
        Some(adapter) => Ok(adapter.into()),
        None => {
            tracing::debug!("No development adapter in {}", path.display());
            Ok(UNKNOWN_DATABASE.into())
        }
    }
}

/// Returns the files under `root` matching `pattern` (relative
/// to `root`), as sorted relative paths.
fn glob_relative(root: &Path, pattern: &str) -> Result<Vec<PathBuf>, ProductionError> {
    let full_pattern = format!(
        "{}/{}",
        glob::Pattern::escape(&root.to_string_lossy()),
        pattern
    );

    let paths = glob::glob(&full_pattern).map_err(|e| ProductionError::Malformed {
        path: root.to_path_buf(),
        message: format!("invalid glob pattern {}: {}", full_pattern, e),
    })?;

    let mut files = Vec::new();
    for entry in paths {
        let path = entry.map_err(|e| ProductionError::Io {
            path: e.path().to_path_buf(),
            source: std::io::Error::new(e.error().kind(), e.error().to_string()),
        })?;
        if path.is_file()
            && let Ok(relative) = path.strip_prefix(root)
        {
            files.push(relative.to_path_buf());
        }
    }

    files.sort();
    Ok(files)
}

/// Formats `path` with forward slashes on every platform.
fn slashed(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn list_ruby_files(root: &Path, dir: &str) -> Result<Value, ProductionError> {
    let files = glob_relative(root, &format!("{}/**/*.rb", dir))?;

    let mut listing = Mapping::new();
    listing.insert("count".into(), (files.len() as u64).into());
    listing.insert(
        "files".into(),
        Value::Sequence(files.iter().map(|f| slashed(f).into()).collect()),
    );

    Ok(Value::Mapping(listing))
}

fn migration_changes(root: &Path) -> Result<Value, ProductionError> {
    let files = glob_relative(root, "db/migrate/*.rb")?;

    let mut dated = Vec::with_capacity(files.len());
    for file in &files {
        let modified = std::fs::metadata(root.join(file))
            .and_then(|metadata| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        dated.push((modified, file));
    }
    dated.sort();

    let recent: Vec<Value> = dated
        .iter()
        .skip(dated.len().saturating_sub(RECENT_MIGRATIONS))
        .filter_map(|(_, file)| file.file_stem())
        .map(|stem| migration_name(&stem.to_string_lossy()).into())
        .collect();

    let mut changes = Mapping::new();
    changes.insert("count".into(), (files.len() as u64).into());
    changes.insert("recent_changes".into(), Value::Sequence(recent));

    Ok(Value::Mapping(changes))
}

/// Strips the numeric version prefix from a migration's file stem.
fn migration_name(stem: &str) -> String {
    match stem.split_once('_') {
        Some((version, name))
            if !version.is_empty() && version.chars().all(|c| c.is_ascii_digit()) =>
        {
            name.to_string()
        }
        _ => stem.to_string(),
    }
}

fn schema_hash(root: &Path) -> Result<Value, ProductionError> {
    let path = root.join("db/schema.rb");
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Value::Null),
        Err(source) => return Err(ProductionError::Io { path, source }),
    };

    Ok(hex::encode(Sha256::digest(&bytes)).into())
}

/// Returns the project's most recent commits, or an empty
/// list if the project isn't a git repository.
fn git_log(root: &Path) -> Value {
    let output = Command::new("git")
        .arg("log")
        .arg("--pretty=format:%h - %an (%ad): %s")
        .arg("--date=short")
        .arg("-n")
        .arg(GIT_LOG_DEPTH.to_string())
        .current_dir(root)
        .output();

    let lines = match output {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|line| Value::from(line.to_string()))
            .collect(),
        Ok(output) => {
            tracing::debug!(
                "git log failed in {}: {}",
                root.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            Vec::new()
        }
        Err(e) => {
            tracing::debug!("git unavailable: {}", e);
            Vec::new()
        }
    };

    Value::Sequence(lines)
}
