//! The startup entry point that keeps a project's report current.
//!
//! Starting a sidecar brings the report up to date once, then
//! watches the project and regenerates the report as it changes.
//! Nothing here returns an error or panics into the host: every
//! failure is logged, and the sidecar keeps going where it can.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::{ConfigError, Settings};
use crate::regen::{self, Coordinator, RunError, Trigger};
use crate::snapshot::{self, ProducesSnapshots};
use crate::store::{ReportStore, StoreError};
use crate::watch::{self, WatchSetupError, Watcher};

/// A running sidecar: a project watcher feeding a [Coordinator].
pub struct Sidecar {
    watcher: Watcher,
    coordinator: Coordinator,
}

impl Sidecar {
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Stops watching, then waits up to `grace` for an
    /// in-flight regeneration to finish.
    pub async fn stop(self, grace: Duration) {
        self.watcher.stop().await;
        self.coordinator.shutdown(grace).await;
    }
}

/// Starts a sidecar for the project at `root` in the background.
///
/// Must be called from within a tokio runtime.
pub fn spawn(
    root: PathBuf,
    settings: Settings,
    producer: Arc<dyn ProducesSnapshots>,
) -> JoinHandle<Option<Sidecar>> {
    tokio::spawn(async move { start(root, settings, producer).await })
}

/// Starts a sidecar for the project at `root`.
///
/// Returns `None` if tracking is disabled or the project can't be
/// watched; neither stops the caller.
pub async fn start(
    root: PathBuf,
    settings: Settings,
    producer: Arc<dyn ProducesSnapshots>,
) -> Option<Sidecar> {
    if !settings.enabled {
        tracing::info!("Activity tracking is disabled");
        return None;
    }

    if !settings.startup_delay.is_zero() {
        tokio::time::sleep(settings.startup_delay).await;
    }

    let store = settings.store(&root);
    let coordinator = Coordinator::new(root.clone(), producer, store.clone());

    match refresh_on_startup(&coordinator).await {
        Ok(true) => tracing::info!("Report updated"),
        Ok(false) => tracing::info!("No project changes detected"),
        Err(e) => tracing::error!("Startup report failed: {}", e),
    }

    match start_watcher(&root, &settings, &store, coordinator.clone()) {
        Ok(watcher) => Some(Sidecar {
            watcher,
            coordinator,
        }),
        Err(e) => {
            tracing::error!("Watcher not started: {}", e);
            None
        }
    }
}

/// Regenerates the report if it differs from the project's
/// current state, returning whether it did.
pub async fn refresh_on_startup(coordinator: &Coordinator) -> Result<bool, RunError> {
    let previous = load_previous(coordinator.store()).await;

    let current = regen::produce(coordinator.producer(), coordinator.root().to_path_buf()).await?;

    if let Some(previous) = &previous {
        if snapshot::equal(previous, &current) {
            return Ok(false);
        }
        tracing::info!(
            "Project activity changed ({}); updating report",
            snapshot::changed_keys(previous, &current).join(", ")
        );
    } else {
        tracing::info!("No previous report; generating one");
    }

    coordinator.run(Trigger::Startup(current)).await?;
    Ok(true)
}

/// Loads the persisted report, treating an unreadable
/// one as absent so it gets replaced.
async fn load_previous(store: &ReportStore) -> Option<snapshot::Snapshot> {
    match store.load().await {
        Ok(previous) => previous,
        Err(e @ StoreError::Malformed { .. }) => {
            tracing::warn!("Replacing unreadable report: {}", e);
            None
        }
        Err(e) => {
            tracing::warn!("Could not load previous report: {}", e);
            None
        }
    }
}

/// An error that keeps a sidecar's watcher from starting.
#[derive(Debug, thiserror::Error)]
enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Watch(#[from] WatchSetupError),
}

fn start_watcher(
    root: &Path,
    settings: &Settings,
    store: &ReportStore,
    coordinator: Coordinator,
) -> Result<Watcher, StartError> {
    let ignore = settings.ignore_set()?;
    watch::ensure_self_excluded(root, &ignore, store)?;

    let watcher = Watcher::start(root, ignore, settings.quiescence, move |batch| {
        coordinator.trigger(Trigger::Changes(batch));
    })?;
    Ok(watcher)
}
