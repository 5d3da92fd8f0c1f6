//! Coalescing of raw change events into quiescence-windowed batches.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};

use super::{ChangeBatch, ChangeEvent, ChangeKind};

/// Accumulates [ChangeEvent]s for a single window.
///
/// Repeated events on a path collapse into one event with
/// the path's latest kind and timestamp, kept at the position
/// the path was first seen in. A path added in the window stays
/// added while it's only modified afterwards.
#[derive(Debug, Default)]
pub struct Coalescer {
    events: Vec<ChangeEvent>,
    positions: HashMap<PathBuf, usize>,
}

impl Coalescer {
    pub fn push(&mut self, event: ChangeEvent) {
        match self.positions.get(&event.path) {
            Some(&position) => {
                let existing = &mut self.events[position];
                let kind = match (existing.kind, event.kind) {
                    (ChangeKind::Added, ChangeKind::Modified) => ChangeKind::Added,
                    (_, kind) => kind,
                };
                *existing = ChangeEvent { kind, ..event };
            }
            None => {
                self.positions.insert(event.path.clone(), self.events.len());
                self.events.push(event);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Takes the accumulated events as a batch, leaving
    /// the coalescer empty.
    ///
    /// Returns `None` if no events were accumulated.
    pub fn take(&mut self) -> Option<ChangeBatch> {
        self.positions.clear();
        ChangeBatch::new(std::mem::take(&mut self.events))
    }
}

/// Reads events from `events` until `stop` is signalled or
/// every sender is dropped, delivering one batch to `handler`
/// each time `window` passes without a new event.
///
/// Batches are delivered one at a time, from this task.
/// Events accumulated when the loop stops are discarded.
pub(super) async fn coalesce<H>(
    mut events: mpsc::UnboundedReceiver<ChangeEvent>,
    window: Duration,
    mut stop: watch::Receiver<bool>,
    mut handler: H,
) where
    H: FnMut(ChangeBatch),
{
    let mut pending = Coalescer::default();
    let mut deadline = Instant::now();

    loop {
        tokio::select! {
            biased;

            _ = stop.changed() => break,

            event = events.recv() => match event {
                Some(event) => {
                    tracing::trace!("{} {}", event.kind, event.path.display());
                    pending.push(event);
                    deadline = Instant::now() + window;
                }
                None => break,
            },

            _ = sleep_until(deadline), if !pending.is_empty() => {
                if let Some(batch) = pending.take() {
                    tracing::debug!("Delivering batch of {} changes", batch.len());
                    handler(batch);
                }
            }
        }
    }

    if !pending.is_empty() {
        tracing::debug!("Discarding undelivered changes on stop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(path: &str, kind: ChangeKind) -> ChangeEvent {
        ChangeEvent::new(path, kind)
    }

    #[test]
    fn collapses_repeated_paths() {
        let mut coalescer = Coalescer::default();
        coalescer.push(event("a.rb", ChangeKind::Added));
        coalescer.push(event("b.rb", ChangeKind::Modified));
        coalescer.push(event("b.rb", ChangeKind::Modified));
        coalescer.push(event("a.rb", ChangeKind::Modified));
        coalescer.push(event("c.rb", ChangeKind::Removed));

        let batch = coalescer.take().unwrap();
        let summary: Vec<_> = batch
            .iter()
            .map(|e| (e.path.to_string_lossy().to_string(), e.kind))
            .collect();
        assert_eq!(
            vec![
                ("a.rb".to_string(), ChangeKind::Added),
                ("b.rb".to_string(), ChangeKind::Modified),
                ("c.rb".to_string(), ChangeKind::Removed),
            ],
            summary
        );

        assert!(coalescer.is_empty());
        assert!(coalescer.take().is_none());
    }

    #[test]
    fn keeps_last_kind_of_each_path() {
        let mut coalescer = Coalescer::default();
        for kind in [
            ChangeKind::Added,
            ChangeKind::Modified,
            ChangeKind::Modified,
            ChangeKind::Removed,
        ] {
            coalescer.push(event("tmp.rb", kind));
        }

        let batch = coalescer.take().unwrap();
        assert_eq!(1, batch.len());
        assert_eq!(ChangeKind::Removed, batch.iter().next().unwrap().kind);
    }

    #[test]
    fn added_paths_stay_added_when_written() {
        let mut coalescer = Coalescer::default();
        coalescer.push(event("new.rb", ChangeKind::Added));
        coalescer.push(event("new.rb", ChangeKind::Modified));
        coalescer.push(event("new.rb", ChangeKind::Modified));
        coalescer.push(event("old.rb", ChangeKind::Removed));
        coalescer.push(event("old.rb", ChangeKind::Added));
        coalescer.push(event("old.rb", ChangeKind::Modified));

        let kinds: Vec<_> = coalescer.take().unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(vec![ChangeKind::Added, ChangeKind::Added], kinds);
    }

    /// Spawns a coalescing task that forwards batches to a channel.
    fn spawn_coalesce(
        window: Duration,
    ) -> (
        mpsc::UnboundedSender<ChangeEvent>,
        watch::Sender<bool>,
        mpsc::UnboundedReceiver<ChangeBatch>,
        tokio::task::JoinHandle<()>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(coalesce(event_rx, window, stop_rx, move |batch| {
            let _ = batch_tx.send(batch);
        }));
        (event_tx, stop_tx, batch_rx, task)
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_one_batch_per_quiet_window() {
        let window = Duration::from_millis(500);
        let (events, _stop, mut batches, _task) = spawn_coalesce(window);

        events.send(event("a.rb", ChangeKind::Added)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        events.send(event("b.rb", ChangeKind::Modified)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        events.send(event("b.rb", ChangeKind::Modified)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        events.send(event("c.rb", ChangeKind::Removed)).unwrap();

        // Events keep arriving inside the window, so nothing is delivered yet.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(batches.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let batch = batches.try_recv().unwrap();
        let kinds: Vec<_> = batch.iter().map(|e| e.kind).collect();
        assert_eq!(
            vec![ChangeKind::Added, ChangeKind::Modified, ChangeKind::Removed],
            kinds
        );
        assert!(batches.try_recv().is_err());

        // A later change starts a new window.
        events.send(event("d.rb", ChangeKind::Added)).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(1, batches.try_recv().unwrap().len());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_discards_pending_changes() {
        let (events, stop, mut batches, task) = spawn_coalesce(Duration::from_millis(500));

        events.send(event("a.rb", ChangeKind::Added)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.send_replace(true);
        task.await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(batches.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ends_when_senders_drop() {
        let (events, _stop, _batches, task) = spawn_coalesce(Duration::from_millis(500));
        drop(events);
        task.await.unwrap();
    }
}
