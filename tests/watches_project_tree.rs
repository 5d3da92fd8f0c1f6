use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use spoor::config::Settings;
use spoor::regen::{Coordinator, Trigger};
use spoor::snapshot::{ProducesSnapshots, ProductionError, Snapshot};
use spoor::watch::{self, ChangeBatch, ChangeKind, Watcher};

const WINDOW: Duration = Duration::from_millis(300);

fn settings() -> Settings {
    Settings {
        quiescence: WINDOW,
        ..Settings::default()
    }
}

/// Counts the Ruby files at the top of the project.
fn producer() -> Arc<dyn ProducesSnapshots> {
    Arc::new(|root: &Path| -> Result<Snapshot, ProductionError> {
        let files = std::fs::read_dir(root)
            .map_err(|source| ProductionError::Io {
                path: root.to_path_buf(),
                source,
            })?
            .filter_map(Result::ok)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "rb"))
            .count();
        Ok(Snapshot::new().with("files", files as u64))
    })
}

/// Starts a watcher on `root` that forwards every batch to the
/// returned receiver and to `coordinator`.
fn watch_into(
    root: &Path,
    coordinator: Option<Coordinator>,
) -> (Watcher, mpsc::UnboundedReceiver<ChangeBatch>) {
    let settings = settings();
    let store = settings.store(root);
    let ignore = settings.ignore_set().unwrap();
    watch::ensure_self_excluded(root, &ignore, &store).unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    let watcher = Watcher::start(root, ignore, WINDOW, move |batch: ChangeBatch| {
        if let Some(coordinator) = &coordinator {
            coordinator.trigger(Trigger::Changes(batch.clone()));
        }
        let _ = tx.send(batch);
    })
    .unwrap();
    (watcher, rx)
}

fn append(path: &Path, line: &str) {
    let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
    writeln!(file, "{}", line).unwrap();
}

async fn settle() {
    tokio::time::sleep(WINDOW * 4).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn logs_one_batch_per_burst() {
    let project = tempfile::tempdir().unwrap();
    let root = project.path();
    std::fs::write(root.join("b.rb"), "class B; end\n").unwrap();
    std::fs::write(root.join("c.rb"), "class C; end\n").unwrap();

    let store = settings().store(root);
    let coordinator = Coordinator::new(root, producer(), store.clone());
    let (watcher, mut batches) = watch_into(root, Some(coordinator.clone()));
    settle().await;

    std::fs::write(root.join("a.rb"), "class A; end\n").unwrap();
    append(&root.join("b.rb"), "# first");
    append(&root.join("b.rb"), "# second");
    std::fs::remove_file(root.join("c.rb")).unwrap();
    // Directories aren't files; creating one isn't a change.
    std::fs::create_dir(root.join("lib")).unwrap();

    let batch = tokio::time::timeout(Duration::from_secs(10), batches.recv())
        .await
        .unwrap()
        .unwrap();
    let mut changes: Vec<(String, ChangeKind)> = batch
        .iter()
        .map(|change| (change.display_path(), change.kind))
        .collect();
    changes.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        vec![
            ("a.rb".to_string(), ChangeKind::Added),
            ("b.rb".to_string(), ChangeKind::Modified),
            ("c.rb".to_string(), ChangeKind::Removed),
        ],
        changes
    );

    settle().await;
    coordinator.wait_idle().await;
    // Writing the report and log didn't trigger another batch.
    assert!(batches.try_recv().is_err());

    let log = std::fs::read_to_string(store.log_path()).unwrap();
    assert_eq!(3, log.lines().count());
    assert!(log.lines().any(|line| line.ends_with("] Removed: c.rb")));

    let report = store.load().await.unwrap().unwrap();
    assert_eq!(Some(&serde_yaml::Value::from(2u64)), report.get("files"));

    watcher.stop().await;
    coordinator.shutdown(Duration::from_secs(5)).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn regenerations_do_not_retrigger() {
    let project = tempfile::tempdir().unwrap();
    let root = project.path();

    let coordinator = Coordinator::new(root, producer(), settings().store(root));
    let (watcher, mut batches) = watch_into(root, None);
    settle().await;

    for _ in 0..100 {
        assert!(coordinator.trigger(Trigger::Manual));
        coordinator.wait_idle().await;
    }
    settle().await;

    assert!(batches.try_recv().is_err());
    assert!(coordinator.store().report_path().exists());

    watcher.stop().await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn activity_log_only_grows() {
    let project = tempfile::tempdir().unwrap();
    let root = project.path();

    let store = settings().store(root);
    let coordinator = Coordinator::new(root, producer(), store.clone());
    let (watcher, mut batches) = watch_into(root, Some(coordinator.clone()));
    settle().await;

    std::fs::File::create(root.join("first.rb")).unwrap();
    tokio::time::timeout(Duration::from_secs(10), batches.recv())
        .await
        .unwrap()
        .unwrap();
    settle().await;
    coordinator.wait_idle().await;
    let before = std::fs::read_to_string(store.log_path()).unwrap();

    std::fs::write(root.join("second.rb"), "class Second; end\n").unwrap();
    tokio::time::timeout(Duration::from_secs(10), batches.recv())
        .await
        .unwrap()
        .unwrap();
    settle().await;
    coordinator.wait_idle().await;
    let after = std::fs::read_to_string(store.log_path()).unwrap();

    assert!(after.starts_with(&before));
    assert!(after[before.len()..].trim_end().ends_with("Added: second.rb"));

    watcher.stop().await;
    coordinator.shutdown(Duration::from_secs(5)).await;
}

#[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
async fn stopped_watcher_delivers_nothing() {
    let project = tempfile::tempdir().unwrap();
    let root = project.path();

    let (watcher, mut batches) = watch_into(root, None);
    watcher.stop().await;

    std::fs::write(root.join("late.rb"), "class Late; end\n").unwrap();
    settle().await;

    // The handler was dropped with the watcher, closing the channel.
    assert!(matches!(
        batches.try_recv(),
        Err(mpsc::error::TryRecvError::Disconnected)
    ));
}
