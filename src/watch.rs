//! Recursive file watching with ignore filtering and
//! quiescence-windowed batching.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::store::ReportStore;

pub mod coalesce;
pub mod ignore;

pub use ignore::IgnoreSet;

/// Default quiescence window.
pub const DEFAULT_QUIESCENCE: Duration = Duration::from_millis(500);

/// The kind of change observed on a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Added => "Added",
            ChangeKind::Modified => "Modified",
            ChangeKind::Removed => "Removed",
        })
    }
}

/// A change observed on a single path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Path relative to the watched root.
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// When the change was observed.
    pub timestamp: DateTime<Local>,
}

impl ChangeEvent {
    /// Returns a change of `kind` on `path`, observed now.
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            timestamp: Local::now(),
        }
    }

    /// Returns the change's path with forward slashes on every platform.
    pub fn display_path(&self) -> String {
        self.path
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// A non-empty, ordered set of changes observed within
/// one quiescence window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeBatch {
    events: Vec<ChangeEvent>,
}

impl ChangeBatch {
    /// Returns a batch of `events`, or `None` if `events` is empty.
    pub fn new(events: Vec<ChangeEvent>) -> Option<Self> {
        if events.is_empty() {
            None
        } else {
            Some(Self { events })
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Always false; batches are never empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<ChangeEvent> {
        self.events
    }
}

/// An error that prevents a [Watcher] from starting.
#[derive(Debug, thiserror::Error)]
pub enum WatchSetupError {
    /// The root to watch is missing or inaccessible.
    #[error("cannot watch {}: {source}", path.display())]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The OS refused to establish the watch.
    #[error("failed to watch {}: {source}", path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    /// A path the report store writes to isn't ignored,
    /// so every save would trigger another regeneration.
    #[error("{} is written by the report store but not ignored by the watcher", .0.display())]
    SelfTrigger(PathBuf),
}

/// Checks that every path `store` writes to beneath `root`
/// is ignored by `ignore`.
pub fn ensure_self_excluded(
    root: &Path,
    ignore: &IgnoreSet,
    store: &ReportStore,
) -> Result<(), WatchSetupError> {
    for path in store.written_paths() {
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        if !ignore.is_ignored(relative) {
            return Err(WatchSetupError::SelfTrigger(path));
        }
    }
    Ok(())
}

/// Watches a directory tree, delivering [ChangeBatch]es to a handler.
///
/// The watch lasts until [Watcher::stop] is called or the
/// watcher is dropped.
pub struct Watcher {
    root: PathBuf,
    watcher: RecommendedWatcher,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Watcher {
    /// Starts watching `root` recursively.
    ///
    /// Paths matched by `ignore` are dropped as they're observed.
    /// Each time `window` passes without a new change, the changes
    /// seen since the last batch are delivered to `handler` as one
    /// batch. `handler` is called from a single task, one batch at
    /// a time, and should return quickly.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<H>(
        root: &Path,
        ignore: IgnoreSet,
        window: Duration,
        handler: H,
    ) -> Result<Self, WatchSetupError>
    where
        H: FnMut(ChangeBatch) + Send + 'static,
    {
        let root = std::fs::canonicalize(root).map_err(|source| WatchSetupError::Root {
            path: root.to_path_buf(),
            source,
        })?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let callback_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    for change in classify(&callback_root, &event) {
                        if ignore.is_ignored(&change.path) {
                            continue;
                        }
                        // The receiver only closes once the watcher stops.
                        let _ = event_tx.send(change);
                    }
                }
                Err(error) => {
                    tracing::warn!("Watch error: {:?}", error);
                }
            }
        })
        .map_err(|source| WatchSetupError::Watch {
            path: root.clone(),
            source,
        })?;

        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|source| WatchSetupError::Watch {
                path: root.clone(),
                source,
            })?;

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(coalesce::coalesce(event_rx, window, stop_rx, handler));

        tracing::info!("Watching {} for changes", root.display());
        Ok(Self {
            root,
            watcher,
            stop,
            task,
        })
    }

    /// Returns the (canonical) root being watched.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stops watching, releasing the OS watch.
    ///
    /// No batch is delivered after this returns.
    pub async fn stop(self) {
        let Self {
            root,
            mut watcher,
            stop,
            task,
        } = self;

        stop.send_replace(true);
        if let Err(e) = watcher.unwatch(&root) {
            tracing::debug!("Unwatch of {} failed: {}", root.display(), e);
        }
        drop(watcher);

        if let Err(e) = task.await {
            tracing::warn!("Watch task ended abnormally: {}", e);
        }
        tracing::info!("Stopped watching {}", root.display());
    }
}

/// Translates a raw OS event into changes on paths relative to `root`.
fn classify(root: &Path, event: &Event) -> Vec<ChangeEvent> {
    let kinds: Vec<(&PathBuf, ChangeKind)> = match event.kind {
        // Only files are tracked.
        EventKind::Create(CreateKind::Folder) | EventKind::Remove(RemoveKind::Folder) => Vec::new(),
        EventKind::Create(_) => event.paths.iter().map(|p| (p, ChangeKind::Added)).collect(),
        EventKind::Remove(_) => event.paths.iter().map(|p| (p, ChangeKind::Removed)).collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => event.paths.iter().map(|p| (p, ChangeKind::Removed)).collect(),
            RenameMode::To => event.paths.iter().map(|p| (p, ChangeKind::Added)).collect(),
            RenameMode::Both if event.paths.len() >= 2 => vec![
                (&event.paths[0], ChangeKind::Removed),
                (&event.paths[1], ChangeKind::Added),
            ],
            // Unpaired renames only tell us the path moved; its
            // current existence tells us which side we saw.
            _ => event
                .paths
                .iter()
                .map(|p| {
                    if p.exists() {
                        (p, ChangeKind::Added)
                    } else {
                        (p, ChangeKind::Removed)
                    }
                })
                .collect(),
        },
        EventKind::Modify(_) => event.paths.iter().map(|p| (p, ChangeKind::Modified)).collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    };

    kinds
        .into_iter()
        .filter_map(|(path, kind)| {
            let relative = path.strip_prefix(root).ok()?;
            if relative.as_os_str().is_empty() {
                return None;
            }
            Some(ChangeEvent::new(relative, kind))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, DataChange};

    fn raw(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        event
    }

    fn classified(event: Event) -> Vec<(String, ChangeKind)> {
        classify(Path::new("/srv/app"), &event)
            .into_iter()
            .map(|change| (change.display_path(), change.kind))
            .collect()
    }

    #[test]
    fn classifies_basic_events() {
        assert_eq!(
            vec![("a.rb".to_string(), ChangeKind::Added)],
            classified(raw(EventKind::Create(CreateKind::File), &["/srv/app/a.rb"]))
        );
        assert_eq!(
            vec![("app/b.rb".to_string(), ChangeKind::Modified)],
            classified(raw(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                &["/srv/app/app/b.rb"]
            ))
        );
        assert_eq!(
            vec![("c.rb".to_string(), ChangeKind::Removed)],
            classified(raw(EventKind::Remove(RemoveKind::File), &["/srv/app/c.rb"]))
        );
    }

    #[test]
    fn classifies_renames() {
        assert_eq!(
            vec![
                ("old.rb".to_string(), ChangeKind::Removed),
                ("new.rb".to_string(), ChangeKind::Added),
            ],
            classified(raw(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &["/srv/app/old.rb", "/srv/app/new.rb"]
            ))
        );
        assert_eq!(
            vec![("gone.rb".to_string(), ChangeKind::Removed)],
            classified(raw(
                EventKind::Modify(ModifyKind::Name(RenameMode::Any)),
                &["/srv/app/gone.rb"]
            ))
        );
    }

    #[test]
    fn drops_access_and_foreign_paths() {
        assert!(
            classified(raw(
                EventKind::Access(AccessKind::Read),
                &["/srv/app/a.rb"]
            ))
            .is_empty()
        );
        assert!(classified(raw(EventKind::Create(CreateKind::File), &["/etc/passwd"])).is_empty());
        assert!(classified(raw(EventKind::Create(CreateKind::Folder), &["/srv/app"])).is_empty());
    }

    #[test]
    fn drops_directory_events() {
        assert!(
            classified(raw(
                EventKind::Create(CreateKind::Folder),
                &["/srv/app/app/services"]
            ))
            .is_empty()
        );
        assert!(
            classified(raw(
                EventKind::Remove(RemoveKind::Folder),
                &["/srv/app/app/services"]
            ))
            .is_empty()
        );
    }

    #[test]
    fn batches_are_never_empty() {
        assert!(ChangeBatch::new(Vec::new()).is_none());
        let batch = ChangeBatch::new(vec![ChangeEvent::new("a.rb", ChangeKind::Added)]).unwrap();
        assert!(!batch.is_empty());
        assert_eq!(1, batch.len());
    }

    #[test]
    fn detects_unignored_store_paths() {
        let root = Path::new("/srv/app");
        let store = ReportStore::new(root.join("activity_tracker"));

        let covered = IgnoreSet::for_store(&["tmp"], "activity_tracker").unwrap();
        assert!(ensure_self_excluded(root, &covered, &store).is_ok());

        let uncovered = IgnoreSet::new(&["tmp"]).unwrap();
        assert!(matches!(
            ensure_self_excluded(root, &uncovered, &store),
            Err(WatchSetupError::SelfTrigger(_))
        ));

        // Stores outside the watched tree can't trigger it.
        let outside = ReportStore::new("/var/spoor/app");
        assert!(ensure_self_excluded(root, &uncovered, &outside).is_ok());
    }

    #[tokio::test]
    async fn missing_root_fails_fast() {
        let project = tempfile::tempdir().unwrap();
        let result = Watcher::start(
            &project.path().join("missing"),
            IgnoreSet::default(),
            DEFAULT_QUIESCENCE,
            |_| {},
        );
        assert!(matches!(result, Err(WatchSetupError::Root { .. })));
    }
}
