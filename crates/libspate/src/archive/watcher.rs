// Watches the visible archive tree on the publishing node. A file that
// appears is stamped with a strictly-later archive time and announced; a
// file that disappears produces a removal notice (administrative files
// excepted). Event-queue overflow degrades to a warning and a re-walk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use notify::Watcher as _;
use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, error_span, trace, warn};

use libspate_core::{
    ArchivePath, ArchiveTime, DEFAULT_PIECE_SIZE, FileId, FileInfo, Filter,
    spawn_utils::{BlockingSpawner, spawn, spawn_with_cancel},
};

use super::Archive;

#[derive(Debug)]
pub enum WatchEvent {
    Appeared(FileInfo),
    Removed(FileId),
}

struct ThreadCancelEvent {
    mutex: Mutex<bool>,
    condvar: Condvar,
}

impl ThreadCancelEvent {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            mutex: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    fn cancel(&self) {
        let mut g = self.mutex.lock();
        *g = true;
        self.condvar.notify_all();
    }

    fn wait_until_cancelled(&self) {
        let mut g = self.mutex.lock();
        while !*g {
            self.condvar.wait(&mut g);
        }
    }
}

pub struct FileWatcher {}

impl FileWatcher {
    /// Starts the watcher thread and its async pump. Emitted events go to
    /// `events`; the receiver side is typically wired to the local node's
    /// peer fan-out.
    pub fn start(
        archive: Arc<Archive>,
        events: UnboundedSender<WatchEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let root = archive.root().to_path_buf();

        spawn_with_cancel(
            error_span!("watch_pump", root = ?root),
            cancel.clone(),
            pump(archive, raw_rx, events),
        );

        let cancel_event = ThreadCancelEvent::new();
        {
            let cancel_event = cancel_event.clone();
            spawn(error_span!("watch_cancel"), async move {
                cancel.cancelled().await;
                trace!("cancelling watcher thread");
                cancel_event.cancel();
                Ok(())
            });
        }

        std::thread::spawn(move || {
            let span = error_span!("watcher", ?root);
            span.in_scope(|| {
                if let Err(e) = watch_thread(root, raw_tx, &cancel_event) {
                    error!("watcher thread failed: {e:#}");
                }
            })
        });
        Ok(())
    }
}

fn watch_thread(
    root: PathBuf,
    tx: UnboundedSender<notify::Result<notify::Event>>,
    cancel_event: &ThreadCancelEvent,
) -> anyhow::Result<()> {
    let mut watcher = notify::recommended_watcher(move |ev| {
        if tx.send(ev).is_err() {
            debug!("watch pump gone, dropping event");
        }
    })
    .context("error creating watcher")?;
    watcher
        .watch(&root, notify::RecursiveMode::Recursive)
        .context("error watching archive root")?;
    cancel_event.wait_until_cancelled();
    debug!("watcher thread done");
    Ok(())
}

struct Pump {
    archive: Arc<Archive>,
    known: HashMap<ArchivePath, ArchiveTime>,
    events: UnboundedSender<WatchEvent>,
    spawner: BlockingSpawner,
}

async fn pump(
    archive: Arc<Archive>,
    mut rx: UnboundedReceiver<notify::Result<notify::Event>>,
    events: UnboundedSender<WatchEvent>,
) -> anyhow::Result<()> {
    let mut pump = Pump {
        archive,
        known: HashMap::new(),
        events,
        spawner: BlockingSpawner::default(),
    };
    // Learn the extant tree so later deletions can name a version; nothing
    // is announced for it (peers learn extant files at handshake).
    for info in pump.walk_all()? {
        pump.known.insert(info.id.path.clone(), info.id.time);
    }

    while let Some(ev) = rx.recv().await {
        let ev = match ev {
            Ok(ev) => ev,
            Err(e) => {
                warn!("watch error: {e}");
                continue;
            }
        };
        if ev.need_rescan() {
            warn!("watch event queue overflowed, re-walking the tree");
            pump.rescan();
            continue;
        }
        use notify::event::ModifyKind;
        match ev.kind {
            // Data modifications count as appearances too: a file created
            // empty and then filled must be re-stamped once its bytes are
            // in place, or the first announcement wins with size zero.
            notify::EventKind::Create(_)
            | notify::EventKind::Modify(
                ModifyKind::Name(_) | ModifyKind::Data(_) | ModifyKind::Any,
            ) => {
                for path in &ev.paths {
                    pump.handle_appeared(path);
                }
            }
            notify::EventKind::Remove(_) => {
                for path in &ev.paths {
                    pump.handle_removed(path);
                }
            }
            other => trace!(kind = ?other, "ignoring event"),
        }
    }
    Ok(())
}

impl Pump {
    fn walk_all(&self) -> anyhow::Result<Vec<FileInfo>> {
        self.spawner
            .spawn_block_in_place(|| self.archive.walk(&Filter::Everything))
            .context("error walking archive")
    }

    fn to_archive_path(&self, path: &std::path::Path) -> Option<ArchivePath> {
        let apath = ArchivePath::from_fs_path(self.archive.root(), path).ok()?;
        if apath.is_hidden() {
            return None;
        }
        Some(apath)
    }

    fn handle_appeared(&mut self, fs_path: &std::path::Path) {
        let Some(apath) = self.to_archive_path(fs_path) else {
            return;
        };
        let md = match std::fs::metadata(fs_path) {
            Ok(md) => md,
            // Already gone again; the remove event will follow.
            Err(_) => return,
        };
        if md.is_dir() {
            // Recursive watching already covers the new directory; walk it
            // for files that landed before the watch caught up.
            let appeared: Vec<PathBuf> = walkdir::WalkDir::new(fs_path)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .collect();
            for file in appeared {
                self.handle_appeared(&file);
            }
            return;
        }
        if !md.is_file() {
            return;
        }
        let disk_time = match md.modified() {
            Ok(t) => ArchiveTime::from(t),
            Err(e) => {
                warn!(path = %apath, "cannot read mtime: {e}");
                return;
            }
        };
        let prev = self.known.get(&apath).copied();
        if prev == Some(disk_time) {
            // Already stamped and announced.
            return;
        }
        // Stamp a version strictly later than anything seen on this path.
        let base = prev.map_or(disk_time, |p| p.max(disk_time));
        let time = self.spawner.spawn_block_in_place(|| {
            let time = ArchiveTime::strictly_after(Some(base));
            // Write access so the stamp also lands on platforms that
            // reject timestamp updates through read-only handles.
            let file = std::fs::OpenOptions::new().write(true).open(fs_path)?;
            file.set_modified(time.to_system_time())?;
            Ok::<_, std::io::Error>(time)
        });
        let time = match time {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %apath, "cannot stamp file: {e}");
                return;
            }
        };
        self.known.insert(apath.clone(), time);
        let info = FileInfo {
            id: FileId { path: apath, time },
            size: md.len(),
            piece_size: DEFAULT_PIECE_SIZE,
            time_to_live: self.archive.default_time_to_live(),
        };
        debug!(id = %info.id, size = info.size, "file appeared");
        let _ = self.events.send(WatchEvent::Appeared(info));
    }

    fn handle_removed(&mut self, fs_path: &std::path::Path) {
        let Some(apath) = self.to_archive_path(fs_path) else {
            return;
        };
        if fs_path.exists() {
            return;
        }
        // Could be a directory: forget everything underneath it.
        let removed: Vec<(ArchivePath, ArchiveTime)> = self
            .known
            .iter()
            .filter(|(known, _)| *known == &apath || known.starts_with(&apath))
            .map(|(p, t)| (p.clone(), *t))
            .collect();
        for (path, time) in removed {
            self.known.remove(&path);
            if path.is_admin() {
                continue;
            }
            debug!(%path, "file removed");
            let _ = self
                .events
                .send(WatchEvent::Removed(FileId { path, time }));
        }
    }

    fn rescan(&mut self) {
        let walked = match self.walk_all() {
            Ok(w) => w,
            Err(e) => {
                warn!("re-walk failed: {e:#}");
                return;
            }
        };
        let mut seen = HashMap::new();
        for info in walked {
            seen.insert(info.id.path.clone(), info.id.time);
        }
        // Files that vanished while events were lost.
        let gone: Vec<(ArchivePath, ArchiveTime)> = self
            .known
            .iter()
            .filter(|(p, _)| !seen.contains_key(*p))
            .map(|(p, t)| (p.clone(), *t))
            .collect();
        for (path, time) in gone {
            self.known.remove(&path);
            if !path.is_admin() {
                let _ = self
                    .events
                    .send(WatchEvent::Removed(FileId { path, time }));
            }
        }
        // Files that appeared unnoticed.
        let root = self.archive.root().to_path_buf();
        let unseen: Vec<ArchivePath> = seen
            .keys()
            .filter(|p| !self.known.contains_key(*p))
            .cloned()
            .collect();
        for path in unseen {
            self.handle_appeared(&path.to_fs_path(&root));
        }
    }
}
