//! Point-in-time snapshots of a project, the things
//! that [ProducesSnapshots], and structural comparison
//! between snapshots.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

pub mod survey;

/// A structured, point-in-time representation of a project's state.
///
/// Snapshots are opaque to everything except their producer:
/// the rest of the crate only stores, loads, and compares them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    entries: BTreeMap<String, Value>,
}

impl Snapshot {
    /// Returns a new, empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to `value`, returning the snapshot.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Returns the value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Returns an iterator over the snapshot's top-level
    /// entries, in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Value)> for Snapshot {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// A thing that produces [Snapshot]s of a project.
///
/// Producers may block for several seconds and may fail;
/// callers run them off any latency-sensitive path.
pub trait ProducesSnapshots: Send + Sync {
    /// Produces a fresh snapshot of the project rooted at `root`.
    fn produce(&self, root: &Path) -> Result<Snapshot, ProductionError>;
}

impl<F> ProducesSnapshots for F
where
    F: Fn(&Path) -> Result<Snapshot, ProductionError> + Send + Sync,
{
    fn produce(&self, root: &Path) -> Result<Snapshot, ProductionError> {
        self(root)
    }
}

/// An error that occurs while producing a [Snapshot].
#[derive(Debug, thiserror::Error)]
pub enum ProductionError {
    /// The project root doesn't exist.
    #[error("project root {} does not exist", .0.display())]
    MissingRoot(PathBuf),

    /// Reading project state failed.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Project state existed but couldn't be interpreted.
    #[error("malformed {}: {message}", path.display())]
    Malformed { path: PathBuf, message: String },

    /// The producer panicked.
    #[error("snapshot producer panicked: {0}")]
    Panicked(String),

    /// Any other producer-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Returns true iff `a` and `b` are structurally equal.
///
/// Mapping keys are compared without regard to their order;
/// sequences are compared element by element, in order.
pub fn equal(a: &Snapshot, b: &Snapshot) -> bool {
    a.entries.len() == b.entries.len()
        && a.entries.iter().all(|(key, value)| {
            b.entries
                .get(key)
                .is_some_and(|other| values_equal(value, other))
        })
}

/// Returns the sorted top-level keys whose values differ
/// between `a` and `b`, including keys present on one side only.
pub fn changed_keys(a: &Snapshot, b: &Snapshot) -> Vec<String> {
    let mut changed: Vec<String> = a
        .entries
        .iter()
        .filter(|(key, value)| {
            !b.entries
                .get(*key)
                .is_some_and(|other| values_equal(value, other))
        })
        .map(|(key, _)| key.clone())
        .collect();

    changed.extend(
        b.entries
            .keys()
            .filter(|key| !a.entries.contains_key(*key))
            .cloned(),
    );

    changed.sort();
    changed
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Mapping(a), Value::Mapping(b)) => {
            a.len() == b.len()
                && a.iter().all(|(key, value)| {
                    b.get(key)
                        .is_some_and(|other| values_equal(value, other))
                })
        }
        (Value::Sequence(a), Value::Sequence(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| values_equal(a, b))
        }
        (Value::Tagged(a), Value::Tagged(b)) => a.tag == b.tag && values_equal(&a.value, &b.value),
        (a, b) => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn mapping_key_order_is_irrelevant() {
        let a = Snapshot::new().with("models", yaml("{count: 2, files: [a.rb, b.rb]}"));
        let b = Snapshot::new().with("models", yaml("{files: [a.rb, b.rb], count: 2}"));
        assert!(equal(&a, &b));
        assert!(changed_keys(&a, &b).is_empty());
    }

    #[test]
    fn sequence_order_is_significant() {
        let a = Snapshot::new().with("git_log", yaml("[one, two]"));
        let b = Snapshot::new().with("git_log", yaml("[two, one]"));
        assert!(!equal(&a, &b));
        assert_eq!(vec!["git_log".to_string()], changed_keys(&a, &b));
    }

    #[test]
    fn nested_differences_are_detected() {
        let a = Snapshot::new()
            .with("project_name", "shop")
            .with("migrations", yaml("{count: 3, recent_changes: [create_users]}"));
        let b = Snapshot::new()
            .with("project_name", "shop")
            .with("migrations", yaml("{count: 4, recent_changes: [create_users]}"));
        assert!(!equal(&a, &b));
        assert_eq!(vec!["migrations".to_string()], changed_keys(&a, &b));
    }

    #[test]
    fn one_sided_keys_are_changes() {
        let a = Snapshot::new().with("schema_hash", Value::Null);
        let b = Snapshot::new().with("database", "postgresql");
        assert!(!equal(&a, &b));
        assert!(!equal(&a, &Snapshot::new()));
        assert_eq!(
            vec!["database".to_string(), "schema_hash".to_string()],
            changed_keys(&a, &b)
        );
    }

    #[test]
    fn empty_snapshots_are_equal() {
        assert!(equal(&Snapshot::new(), &Snapshot::new()));
    }

    #[test]
    fn closures_produce_snapshots() {
        let producer = |root: &Path| -> Result<Snapshot, ProductionError> {
            Ok(Snapshot::new().with("root", root.to_string_lossy().to_string()))
        };
        let snapshot = producer.produce(Path::new("/srv/app")).unwrap();
        assert_eq!(Some(&Value::from("/srv/app")), snapshot.get("root"));
    }
}
