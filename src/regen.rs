//! Single-flight regeneration of a project's report.
//!
//! A [Coordinator] turns triggers into report regenerations,
//! running at most one at a time. Triggers that arrive while a
//! regeneration is running are coalesced into a single trailing
//! regeneration that starts as soon as the current one finishes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::snapshot::{ProducesSnapshots, ProductionError, Snapshot};
use crate::store::{ActivityLogEntry, ReportStore, StoreError};
use crate::watch::{ChangeBatch, ChangeEvent, ChangeKind};

/// Something that asks for a regeneration.
#[derive(Debug)]
pub enum Trigger {
    /// Persist a snapshot that was already produced during startup.
    Startup(Snapshot),

    /// Regenerate without any observed changes.
    Manual,

    /// Regenerate after changes were observed.
    Changes(ChangeBatch),
}

/// Whether a regeneration is in flight, and whether
/// another was requested in the meantime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunState {
    pub running: bool,
    pub pending: bool,
}

impl RunState {
    pub fn is_idle(&self) -> bool {
        !self.running
    }
}

/// An error that abandons a regeneration.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("snapshot production failed: {0}")]
    Production(#[from] ProductionError),

    #[error("report storage failed: {0}")]
    Storage(#[from] StoreError),

    /// A regeneration run by the coordinator failed; the cause
    /// was logged when it happened.
    #[error("regeneration failed: {0}")]
    Failed(String),
}

/// Everything guarded by the coordinator's lock.
#[derive(Debug)]
struct Ledger {
    state: RunState,
    /// Changes awaiting the next regeneration.
    queued: Vec<ChangeEvent>,
    /// A snapshot to persist instead of producing one.
    prepared: Option<Snapshot>,
    /// Why the most recent regeneration failed, if it did.
    last_failure: Option<String>,
    accepting: bool,
}

struct Inner {
    root: PathBuf,
    producer: Arc<dyn ProducesSnapshots>,
    store: ReportStore,
    runtime: Handle,
    ledger: Mutex<Ledger>,
    idle: watch::Sender<bool>,
}

/// Coordinates report regenerations for one project.
///
/// Cloning a coordinator yields another handle to the same
/// coordinator.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Returns a coordinator regenerating the report of the project
    /// at `root` with `producer`, persisting it to `store`.
    ///
    /// Must be called from within a tokio runtime; regenerations
    /// run on that runtime no matter which thread triggers them.
    pub fn new(
        root: impl Into<PathBuf>,
        producer: Arc<dyn ProducesSnapshots>,
        store: ReportStore,
    ) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                root: root.into(),
                producer,
                store,
                runtime: Handle::current(),
                ledger: Mutex::new(Ledger {
                    state: RunState::default(),
                    queued: Vec::new(),
                    prepared: None,
                    last_failure: None,
                    accepting: true,
                }),
                idle,
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn store(&self) -> &ReportStore {
        &self.inner.store
    }

    pub fn producer(&self) -> Arc<dyn ProducesSnapshots> {
        self.inner.producer.clone()
    }

    /// Returns the current run state.
    pub fn state(&self) -> RunState {
        self.inner.ledger().state
    }

    /// Requests a regeneration.
    ///
    /// Starts a regeneration immediately if none is running;
    /// otherwise marks one as pending. Never waits on a running
    /// regeneration. Returns false if the coordinator has been
    /// shut down and the trigger was dropped.
    pub fn trigger(&self, trigger: Trigger) -> bool {
        let mut ledger = self.inner.ledger();
        if !ledger.accepting {
            tracing::debug!("Dropping {} trigger after shutdown", trigger_name(&trigger));
            return false;
        }

        match trigger {
            Trigger::Startup(snapshot) => ledger.prepared = Some(snapshot),
            Trigger::Manual => {}
            Trigger::Changes(batch) => ledger.queued.extend(batch.into_events()),
        }

        if ledger.state.running {
            ledger.state.pending = true;
            tracing::debug!("Regeneration running; queued a trailing run");
            return true;
        }

        ledger.state.running = true;
        self.inner.idle.send_replace(false);
        drop(ledger);

        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move { inner.drive().await });
        true
    }

    /// Waits until no regeneration is running.
    pub async fn wait_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        // The sender lives as long as `self`, so this can't fail.
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Triggers a regeneration and waits for it (and any trailing
    /// run) to finish, returning the outcome of the last run.
    pub async fn run(&self, trigger: Trigger) -> Result<(), RunError> {
        if !self.trigger(trigger) {
            return Err(RunError::Failed("coordinator is shut down".into()));
        }
        self.wait_idle().await;
        match self.inner.ledger().last_failure.clone() {
            Some(cause) => Err(RunError::Failed(cause)),
            None => Ok(()),
        }
    }

    /// Stops accepting triggers and waits up to `grace` for an
    /// in-flight regeneration to finish.
    ///
    /// A pending trailing regeneration is dropped. A regeneration
    /// still running after `grace` is abandoned to finish on its own.
    pub async fn shutdown(&self, grace: Duration) {
        {
            let mut ledger = self.inner.ledger();
            ledger.accepting = false;
            ledger.state.pending = false;
        }

        if tokio::time::timeout(grace, self.wait_idle()).await.is_err() {
            tracing::warn!(
                "Regeneration still running after {:?}; abandoning it",
                grace
            );
        }
    }
}

impl Inner {
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs regenerations until no trailing run is pending.
    async fn drive(self: Arc<Self>) {
        loop {
            let (changes, prepared) = {
                let mut ledger = self.ledger();
                (std::mem::take(&mut ledger.queued), ledger.prepared.take())
            };

            let count = changes.len();
            let result = self.regenerate(&changes, prepared).await;

            let mut ledger = self.ledger();
            match result {
                Ok(()) => {
                    tracing::info!("Report regenerated ({} changes)", count);
                    ledger.last_failure = None;
                }
                Err(e) => {
                    tracing::error!("Regeneration failed: {}", e);
                    ledger.last_failure = Some(e.to_string());
                    // The changes haven't been logged yet; carry them
                    // into the next regeneration.
                    let newer = std::mem::replace(&mut ledger.queued, changes);
                    ledger.queued.extend(newer);
                }
            }

            if ledger.state.pending && ledger.accepting {
                ledger.state.pending = false;
                continue;
            }
            ledger.state = RunState::default();
            self.idle.send_replace(true);
            break;
        }
    }

    /// Produces (unless `prepared`), persists, and logs one regeneration.
    async fn regenerate(
        &self,
        changes: &[ChangeEvent],
        prepared: Option<Snapshot>,
    ) -> Result<(), RunError> {
        let snapshot = match prepared {
            Some(snapshot) => snapshot,
            None => produce(self.producer.clone(), self.root.clone()).await?,
        };

        self.store.save(&snapshot).await?;

        if changes.is_empty() {
            return Ok(());
        }

        let entries: Vec<ActivityLogEntry> = changes.iter().map(ActivityLogEntry::from).collect();
        for entry in &entries {
            tracing::info!("{}", entry);
        }

        // The report is already committed, so a failed append
        // doesn't abandon the regeneration.
        if let Err(e) = self.store.append_log(&entries).await {
            tracing::error!("Failed to append activity log: {}", e);
        }

        tracing::info!("{}", summarize(changes));
        Ok(())
    }
}

/// Runs `producer` on the blocking pool.
pub async fn produce(
    producer: Arc<dyn ProducesSnapshots>,
    root: PathBuf,
) -> Result<Snapshot, ProductionError> {
    tokio::task::spawn_blocking(move || producer.produce(&root))
        .await
        .map_err(|e| ProductionError::Panicked(e.to_string()))?
}

/// Summarizes `changes` as a count of files by kind.
fn summarize(changes: &[ChangeEvent]) -> String {
    let count = |kind| changes.iter().filter(|c| c.kind == kind).count();
    format!(
        "{} files changed: {} added, {} modified, {} removed",
        changes.len(),
        count(ChangeKind::Added),
        count(ChangeKind::Modified),
        count(ChangeKind::Removed)
    )
}

fn trigger_name(trigger: &Trigger) -> &'static str {
    match trigger {
        Trigger::Startup(_) => "startup",
        Trigger::Manual => "manual",
        Trigger::Changes(_) => "changes",
    }
}
