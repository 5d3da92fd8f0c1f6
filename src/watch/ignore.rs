//! Glob-based filtering of watched paths.

use std::path::{Component, Path};

use glob::{MatchOptions, Pattern, PatternError};

/// Patterns ignored in every project unless configured otherwise.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &["**/tmp", "**/log", ".git", "node_modules"];

/// Matches log files at any depth.
const LOG_FILE_PATTERN: &str = "*.log";

/// Separators aren't literal, so `*` also spans directories.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A set of glob patterns matched against paths
/// relative to a watched root.
///
/// A path is ignored when the path itself, or any of
/// its ancestors, matches a pattern: `tmp` ignores
/// everything beneath `tmp/`.
#[derive(Clone, Debug, Default)]
pub struct IgnoreSet {
    patterns: Vec<Pattern>,
}

impl IgnoreSet {
    /// Returns an ignore set matching `patterns`.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PatternError> {
        let mut set = Self::default();
        for pattern in patterns {
            set.add(pattern.as_ref())?;
        }
        Ok(set)
    }

    /// Returns an ignore set matching `patterns`, the report
    /// directory `report_dir`, and log files.
    pub fn for_store<S: AsRef<str>>(patterns: &[S], report_dir: &str) -> Result<Self, PatternError> {
        let mut set = Self::new(patterns)?;
        set.add(&Pattern::escape(report_dir.trim_end_matches('/')))?;
        set.add(LOG_FILE_PATTERN)?;
        Ok(set)
    }

    /// Adds `pattern` to the set.
    pub fn add(&mut self, pattern: &str) -> Result<(), PatternError> {
        let pattern = Pattern::new(pattern.trim_end_matches('/'))?;
        if !self.patterns.contains(&pattern) {
            self.patterns.push(pattern);
        }
        Ok(())
    }

    /// Returns true iff `relative` (a path relative to
    /// the watched root) is ignored.
    pub fn is_ignored(&self, relative: &Path) -> bool {
        let mut prefix = String::new();
        for component in relative.components() {
            let Component::Normal(name) = component else {
                continue;
            };
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(&name.to_string_lossy());

            if self
                .patterns
                .iter()
                .any(|pattern| pattern.matches_with(&prefix, MATCH_OPTIONS))
            {
                return true;
            }
        }
        false
    }

    /// Returns the set's patterns as strings.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(Pattern::as_str)
    }
}
