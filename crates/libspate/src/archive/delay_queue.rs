// Persistent timer queue for deferred file deletions. The worker acts
// before it removes the persisted entry, so a crash can act twice on the
// same file but never lose a scheduled action; the action itself is
// idempotent (removal of a version that is already gone is a no-op).

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bincode::Options;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use libspate_core::{ArchiveTime, FileId};

use crate::error::Result;

type Action = Box<dyn Fn(&FileId) + Send + Sync>;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Debug)]
struct QueueEntry {
    due_millis: i64,
    file: FileId,
}

pub struct DelayedActionQueue {
    path: PathBuf,
    entries: Mutex<BinaryHeap<Reverse<QueueEntry>>>,
    changed: Notify,
    action: Action,
}

fn bopts() -> impl bincode::Options {
    bincode::DefaultOptions::new()
}

impl DelayedActionQueue {
    /// Loads the queue persisted at `path` (an absent file is an empty
    /// queue, a corrupt one is dropped with a warning) and binds it to the
    /// action to perform when entries come due.
    pub fn load(path: PathBuf, action: Action) -> Result<Arc<Self>> {
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match bopts().deserialize::<Vec<QueueEntry>>(&bytes) {
                Ok(list) => list.into_iter().map(Reverse).collect(),
                Err(e) => {
                    warn!(?path, "deletion queue unreadable, starting empty: {e}");
                    BinaryHeap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BinaryHeap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(?path, entries = entries.len(), "loaded deletion queue");
        Ok(Arc::new(Self {
            path,
            entries: Mutex::new(entries),
            changed: Notify::new(),
            action,
        }))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Schedules the action on `file` after `delay_millis`. A non-positive
    /// delay acts inline.
    pub fn act_upon_eventually(&self, file: FileId, delay_millis: i64) {
        if delay_millis <= 0 {
            (self.action)(&file);
            return;
        }
        let entry = QueueEntry {
            due_millis: ArchiveTime::now().as_millis() + delay_millis,
            file,
        };
        {
            let mut entries = self.entries.lock();
            entries.push(Reverse(entry));
            self.persist(&entries);
        }
        self.changed.notify_one();
    }

    fn persist(&self, entries: &BinaryHeap<Reverse<QueueEntry>>) {
        let list: Vec<&QueueEntry> = entries.iter().map(|r| &r.0).collect();
        let result = (|| -> Result<()> {
            let bytes = bopts()
                .serialize(&list)
                .map_err(|e| crate::error::Error::Other(e.into()))?;
            let mut tmp = self.path.clone();
            tmp.as_mut_os_string().push(".tmp");
            std::fs::write(&tmp, &bytes)?;
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(path = ?self.path, "error persisting deletion queue: {e:#}");
        }
    }

    /// The worker: sleeps until the earliest entry is due, acts, then
    /// removes the entry and persists. Runs until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            let next = self.entries.lock().peek().map(|r| r.0.clone());
            let entry = match next {
                Some(entry) => entry,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = self.changed.notified() => continue,
                    }
                }
            };
            let wait = entry.due_millis - ArchiveTime::now().as_millis();
            if wait > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    // An earlier entry may have been scheduled meanwhile.
                    _ = self.changed.notified() => continue,
                    _ = tokio::time::sleep(Duration::from_millis(wait as u64)) => {}
                }
            }
            trace!(file = %entry.file, "acting on due entry");
            (self.action)(&entry.file);
            let mut entries = self.entries.lock();
            let mut rest: Vec<Reverse<QueueEntry>> = std::mem::take(&mut *entries).into_vec();
            if let Some(pos) = rest.iter().position(|r| r.0 == entry) {
                rest.remove(pos);
            }
            *entries = rest.into();
            self.persist(&entries);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libspate_core::ArchivePath;

    fn file_id(name: &str) -> FileId {
        FileId {
            path: ArchivePath::new(name).unwrap(),
            time: ArchiveTime::from_millis(1),
        }
    }

    fn counting_queue(path: PathBuf) -> (Arc<DelayedActionQueue>, Arc<Mutex<Vec<FileId>>>) {
        let acted: Arc<Mutex<Vec<FileId>>> = Default::default();
        let acted2 = acted.clone();
        let queue = DelayedActionQueue::load(
            path,
            Box::new(move |id| acted2.lock().push(id.clone())),
        )
        .unwrap();
        (queue, acted)
    }

    #[test]
    fn test_non_positive_delay_acts_inline() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, acted) = counting_queue(dir.path().join("q"));
        queue.act_upon_eventually(file_id("a"), 0);
        queue.act_upon_eventually(file_id("b"), -5);
        assert_eq!(acted.lock().len(), 2);
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_due_entries_acted_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, acted) = counting_queue(dir.path().join("q"));
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(queue.clone().run(cancel.clone()));

        queue.act_upon_eventually(file_id("late"), 60);
        queue.act_upon_eventually(file_id("early"), 20);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            acted.lock().iter().map(|f| f.path.to_string()).collect::<Vec<_>>(),
            vec!["early", "late"]
        );
        assert!(queue.is_empty());
        cancel.cancel();
        worker.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q");
        {
            let (queue, _acted) = counting_queue(path.clone());
            queue.act_upon_eventually(file_id("persisted"), 3_600_000);
            assert_eq!(queue.len(), 1);
        }
        let (queue, acted) = counting_queue(path);
        assert_eq!(queue.len(), 1);

        // Overdue entries fire immediately on the next worker pass.
        queue.act_upon_eventually(file_id("due"), 1);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(queue.clone().run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(acted.lock().len(), 1);
        assert_eq!(queue.len(), 1, "far-future entry still queued");
        cancel.cancel();
        worker.await.unwrap().unwrap();
    }

    #[test]
    fn test_corrupt_queue_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q");
        std::fs::write(&path, b"\xff\xff\xff garbage").unwrap();
        let (queue, _) = counting_queue(path);
        assert!(queue.is_empty());
    }
}
