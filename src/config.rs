//! Loading of `Spoor.toml` configuration files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tokio::fs;

use crate::store::{DEFAULT_REPORT_DIR, ReportStore};
use crate::watch::{DEFAULT_QUIESCENCE, IgnoreSet, ignore::DEFAULT_IGNORE_PATTERNS};

/// Default configuration profile.
const DEFAULT_CONFIG_PROFILE: &str = "default";

/// Default configuration file name, relative to the project root.
pub const DEFAULT_CONFIG_FILE: &str = "Spoor.toml";

/// Environment variable that enables or disables watching,
/// overriding any configuration file.
pub const ENABLED_ENV: &str = "SPOOR_ENABLED";

/// Default grace period for in-flight regenerations on stop.
const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Default configuration file contents.
pub const DEFAULT_CONFIG_TOML: &str = r#"# Spoor activity tracking configuration

[default]
# Set to false (or SPOOR_ENABLED=false) to disable watching.
enabled = true
# Directory holding report.yml and log.txt. Always ignored by the watcher.
report_dir = "activity_tracker"
# Milliseconds without changes before a batch of changes is handled.
quiescence_ms = 500
# Milliseconds to wait after startup before the first report.
startup_delay_ms = 0
# Milliseconds to wait for a running regeneration on stop.
grace_ms = 5000
# Glob patterns, relative to the project root, to ignore.
# The report directory and `*.log` files are always ignored.
ignore = ["**/tmp", "**/log", ".git", "node_modules"]

[quiet]
quiescence_ms = 2000
"#;

/// Raw TOML structure of a `Spoor.toml` file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(flatten)]
    profiles: BTreeMap<String, ConfigProfile>,
}

/// Profile-level configuration in a `Spoor.toml` file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigProfile {
    pub enabled: Option<bool>,
    pub report_dir: Option<String>,
    pub quiescence_ms: Option<u64>,
    pub startup_delay_ms: Option<u64>,
    pub grace_ms: Option<u64>,
    pub ignore: Option<Vec<String>>,
}

impl ConfigProfile {
    /// Merges this profile with another, with `other`
    /// taking precedence, and returning the merged profile.
    fn merge(&self, other: &ConfigProfile) -> ConfigProfile {
        ConfigProfile {
            enabled: other.enabled.or(self.enabled),
            report_dir: other.report_dir.clone().or_else(|| self.report_dir.clone()),
            quiescence_ms: other.quiescence_ms.or(self.quiescence_ms),
            startup_delay_ms: other.startup_delay_ms.or(self.startup_delay_ms),
            grace_ms: other.grace_ms.or(self.grace_ms),
            ignore: other.ignore.clone().or_else(|| self.ignore.clone()),
        }
    }
}

/// Fully resolved settings for watching a project.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub enabled: bool,
    /// Report directory, relative to the project root.
    pub report_dir: String,
    pub quiescence: Duration,
    pub startup_delay: Duration,
    pub grace: Duration,
    /// User ignore patterns; see [Settings::ignore_set].
    pub ignore: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_profile(&ConfigProfile::default())
    }
}

impl Settings {
    fn from_profile(profile: &ConfigProfile) -> Self {
        Self {
            enabled: profile.enabled.unwrap_or(true),
            report_dir: profile
                .report_dir
                .clone()
                .unwrap_or_else(|| DEFAULT_REPORT_DIR.into()),
            quiescence: profile
                .quiescence_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_QUIESCENCE),
            startup_delay: Duration::from_millis(profile.startup_delay_ms.unwrap_or(0)),
            grace: profile
                .grace_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_GRACE),
            ignore: profile.ignore.clone().unwrap_or_else(|| {
                DEFAULT_IGNORE_PATTERNS
                    .iter()
                    .map(|pattern| pattern.to_string())
                    .collect()
            }),
        }
    }

    /// Applies the value of [ENABLED_ENV], if any.
    ///
    /// Unrecognized values are logged and ignored.
    fn with_enabled_env(mut self, value: Option<&str>) -> Self {
        if let Some(value) = value {
            match parse_enabled(value) {
                Some(enabled) => self.enabled = enabled,
                None => tracing::warn!("Ignoring unrecognized {}={:?}", ENABLED_ENV, value),
            }
        }
        self
    }

    /// Returns the store for a project rooted at `root`.
    pub fn store(&self, root: &Path) -> ReportStore {
        ReportStore::new(root.join(&self.report_dir))
    }

    /// Returns the watcher's ignore set: the configured patterns,
    /// the report directory, and log files.
    pub fn ignore_set(&self) -> Result<IgnoreSet, ConfigError> {
        IgnoreSet::for_store(self.ignore.as_slice(), &self.report_dir)
            .map_err(|e| ConfigError::InvalidPattern(e.to_string()))
    }
}

/// Parses an environment-style boolean.
pub fn parse_enabled(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// An error that occurs while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Malformed(String),

    #[error("missing selected profile: {0}")]
    MissingProfile(String),

    #[error("invalid ignore pattern: {0}")]
    InvalidPattern(String),
}

/// Loads settings for the project at `root`.
///
/// Reads `config_file` if given, otherwise `Spoor.toml` in `root`;
/// a missing default file yields default settings. The selected
/// `profile` is merged over the default profile, and [ENABLED_ENV]
/// overrides the result.
pub async fn load_settings(
    root: &Path,
    config_file: Option<&Path>,
    profile: Option<&str>,
) -> Result<Settings, ConfigError> {
    let path = config_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| root.join(DEFAULT_CONFIG_FILE));

    let toml_str = match fs::read_to_string(&path).await {
        Ok(toml_str) => toml_str,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && config_file.is_none() => {
            tracing::debug!("No {} found; using defaults", path.display());
            String::new()
        }
        Err(source) => return Err(ConfigError::Io { path, source }),
    };

    let settings = load_settings_from_str(&toml_str, profile)?;
    let env = std::env::var(ENABLED_ENV).ok();
    Ok(settings.with_enabled_env(env.as_deref()))
}

/// Parses a `Spoor.toml` string and merges the selected profile
/// over the default.
fn load_settings_from_str(toml_str: &str, profile: Option<&str>) -> Result<Settings, ConfigError> {
    let profile_name = profile.unwrap_or(DEFAULT_CONFIG_PROFILE);

    let raw: RawConfig =
        toml::from_str(toml_str).map_err(|e| ConfigError::Malformed(e.to_string()))?;

    let default_profile = raw
        .profiles
        .get(DEFAULT_CONFIG_PROFILE)
        .cloned()
        .unwrap_or_default();

    let merged = if profile_name == DEFAULT_CONFIG_PROFILE {
        default_profile
    } else {
        let selected = raw
            .profiles
            .get(profile_name)
            .ok_or_else(|| ConfigError::MissingProfile(profile_name.into()))?;
        default_profile.merge(selected)
    };

    Ok(Settings::from_profile(&merged))
}

/// Creates a default configuration file in `root` if one doesn't exist.
pub async fn init(root: &Path) -> Result<(), ConfigError> {
    let config_path = root.join(DEFAULT_CONFIG_FILE);
    let io_error = |source| ConfigError::Io {
        path: config_path.clone(),
        source,
    };

    if fs::try_exists(&config_path).await.map_err(io_error)? {
        tracing::warn!("{} already exists", config_path.display());
        return Ok(());
    }

    fs::write(&config_path, DEFAULT_CONFIG_TOML)
        .await
        .map_err(io_error)?;
    tracing::info!("Created {}", config_path.display());

    Ok(())
}
