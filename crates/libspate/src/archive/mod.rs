// The on-disk piece store. Files assemble invisibly under the hidden
// subtree and surface into the visible tree only when complete; the archive
// keeps at most one version per path, always the newest it has seen.

mod delay_queue;
mod disk_file;
pub mod watcher;

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use libspate_core::{
    ArchivePath, ArchiveTime, Config, DEFAULT_PIECE_SIZE, FileId, FileInfo, Filter, Piece,
    PieceSpec,
    archive_path::HIDDEN_DIR_NAME,
};

use crate::error::{Error, Result, is_file_table_full};

pub use delay_queue::DelayedActionQueue;
use disk_file::DiskFile;
pub use disk_file::PutOutcome;

/// Name of the persisted deletion queue inside the hidden subtree.
pub const DELETION_QUEUE_FILE_NAME: &str = "fileDeletionQueue";

type Listener = Box<dyn Fn(&FileInfo) + Send + Sync>;

pub struct Archive {
    root: PathBuf,
    hidden_root: PathBuf,
    default_ttl: i64,
    cache: Mutex<LruCache<ArchivePath, Arc<DiskFile>>>,
    listeners: Mutex<Vec<Listener>>,
    delay_queue: OnceLock<Arc<DelayedActionQueue>>,
}

impl Archive {
    /// Opens the archive rooted at `root`. Leftover hidden files from an
    /// unclean shutdown are purged, except the persisted deletion queue.
    pub fn new(root: impl Into<PathBuf>, config: &Config) -> Result<Arc<Self>> {
        let root = root.into();
        let hidden_root = root.join(HIDDEN_DIR_NAME);
        std::fs::create_dir_all(&hidden_root)?;
        purge_hidden_tree(&hidden_root)?;
        let cap = NonZeroUsize::new(config.active_file_cache_size.max(1)).unwrap();
        Ok(Arc::new(Self {
            root,
            hidden_root,
            default_ttl: config.default_time_to_live,
            cache: Mutex::new(LruCache::new(cap)),
            listeners: Mutex::new(Vec::new()),
            delay_queue: OnceLock::new(),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hidden_root(&self) -> &Path {
        &self.hidden_root
    }

    pub fn deletion_queue_path(&self) -> PathBuf {
        self.hidden_root.join(DELETION_QUEUE_FILE_NAME)
    }

    pub fn default_time_to_live(&self) -> i64 {
        self.default_ttl
    }

    /// Registers the deferred-deletion queue. The archive only holds the
    /// queue's scheduling surface; the queue holds the archive's removal
    /// surface, registered as a collaborator rather than an owner.
    pub fn set_delay_queue(&self, queue: Arc<DelayedActionQueue>) {
        let _ = self.delay_queue.set(queue);
    }

    /// Called with the completed file's info, outside any file lock.
    pub fn add_completion_listener(&self, listener: Listener) {
        self.listeners.lock().push(listener);
    }

    fn visible_path(&self, path: &ArchivePath) -> PathBuf {
        path.to_fs_path(&self.root)
    }

    fn hidden_path(&self, path: &ArchivePath) -> PathBuf {
        path.to_fs_path(&self.hidden_root)
    }

    /// Fetches (or creates) the single process-wide handle for this file
    /// version, arbitrating against both the cache and the disk. On
    /// file-table exhaustion the least-recently-used handle is closed and
    /// the open retried; with an empty cache the error propagates.
    fn disk_file(&self, info: &FileInfo) -> Result<Arc<DiskFile>> {
        let path = &info.id.path;
        loop {
            let stale = {
                let mut cache = self.cache.lock();
                match cache.get(path) {
                    Some(df) => {
                        let cached = df.info();
                        if cached.id.time == info.id.time {
                            if cached.conflicts_with(info) {
                                return Err(Error::VersionMismatch {
                                    id: info.id.clone(),
                                });
                            }
                            return Ok(df.clone());
                        }
                        if cached.id.time > info.id.time {
                            return Err(Error::StaleVersion {
                                path: path.clone(),
                                disk: cached.id.time,
                            });
                        }
                        cache.pop(path)
                    }
                    None => None,
                }
            };
            if let Some(old) = stale {
                debug!(%path, "newer version arrived, discarding archived copy");
                old.delete()?;
                continue;
            }

            match DiskFile::open(
                info.clone(),
                self.visible_path(path),
                self.hidden_path(path),
            ) {
                Ok(df) => {
                    let df = Arc::new(df);
                    let mut cache = self.cache.lock();
                    if let Some(existing) = cache.get(path) {
                        if existing.info().id.time == info.id.time {
                            // Raced with another opener of the same
                            // version; keep theirs.
                            return Ok(existing.clone());
                        }
                        // Raced with a different version; re-arbitrate.
                        drop(cache);
                        continue;
                    }
                    let evicted = cache.push(path.clone(), df.clone());
                    drop(cache);
                    if let Some((evicted_path, evicted_df)) = evicted {
                        trace!(path = %evicted_path, "open-file cache full, closing eldest");
                        if let Err(e) = evicted_df.close() {
                            warn!(path = %evicted_path, "error closing evicted file: {e:#}");
                        }
                    }
                    return Ok(df);
                }
                Err(Error::Io(e)) if is_file_table_full(&e) => {
                    let evicted = self.cache.lock().pop_lru();
                    match evicted {
                        Some((evicted_path, evicted_df)) => {
                            warn!("file table full, closing {evicted_path} and retrying");
                            if let Err(e) = evicted_df.close() {
                                warn!(path = %evicted_path, "error closing evicted file: {e:#}");
                            }
                        }
                        None => return Err(Error::Io(e)),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stores one piece. Completion schedules the file's deferred deletion
    /// (if it carries a non-negative time-to-live) and invokes the
    /// completion listeners with no file lock held.
    pub fn put_piece(&self, piece: &Piece) -> Result<PutOutcome> {
        let info = &piece.spec().info;
        let df = self.disk_file(info)?;
        let outcome = df.put_piece(piece)?;
        if matches!(outcome, PutOutcome::Written { completed: true }) {
            self.schedule_deletion(info);
            for listener in self.listeners.lock().iter() {
                listener(info);
            }
        }
        Ok(outcome)
    }

    pub fn get_piece(&self, spec: &PieceSpec) -> Result<Piece> {
        self.disk_file(&spec.info)?.get_piece(spec)
    }

    /// Whether the archive already holds this piece. A newer archived
    /// version also counts: the offered piece is obsolete either way.
    pub fn has_piece(&self, spec: &PieceSpec) -> Result<bool> {
        let path = &spec.info.id.path;
        let cached = self.cache.lock().peek(path).cloned();
        if let Some(df) = cached {
            let cached = df.info();
            if cached.id.time > spec.info.id.time {
                return Ok(true);
            }
            if cached.id.time == spec.info.id.time {
                if cached.conflicts_with(&spec.info) {
                    return Err(Error::VersionMismatch {
                        id: spec.info.id.clone(),
                    });
                }
                return df.has_piece(spec.index);
            }
            // Cached version is older; fall through to reopen.
        }
        let visible = self.visible_path(path);
        match std::fs::metadata(&visible) {
            Ok(md) => {
                let disk_time = ArchiveTime::from(md.modified()?);
                if disk_time >= spec.info.id.time {
                    return Ok(true);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if !self.hidden_path(path).exists() {
            return Ok(false);
        }
        match self.disk_file(&spec.info) {
            Ok(df) => df.has_piece(spec.index),
            Err(Error::StaleVersion { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Publishes a locally produced file: written to a hidden scratch
    /// path, fsynced, stamped with a strictly-later archive time, and
    /// atomically renamed into the visible tree.
    pub fn save(&self, path: &ArchivePath, bytes: &[u8], time_to_live: i64) -> Result<FileInfo> {
        let visible = self.visible_path(path);
        let prev = match std::fs::metadata(&visible) {
            Ok(md) => Some(ArchiveTime::from(md.modified()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let time = ArchiveTime::strictly_after(prev);

        let mut scratch = self.hidden_path(path);
        scratch.as_mut_os_string().push(".save");
        if let Some(parent) = scratch.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let result: Result<()> = (|| {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&scratch)?;
            {
                use std::io::Write;
                (&file).write_all(bytes)?;
            }
            file.sync_all()?;
            file.set_modified(time.to_system_time())?;
            if let Some(parent) = visible.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&scratch, &visible)?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = std::fs::remove_file(&scratch);
            return Err(e);
        }

        // Any open handle now refers to a superseded version.
        if let Some(old) = self.cache.lock().pop(path) {
            let _ = old.close();
        }
        let _ = std::fs::remove_file(self.hidden_path(path));

        let info = FileInfo::new(
            FileId {
                path: path.clone(),
                time,
            },
            bytes.len() as u64,
            DEFAULT_PIECE_SIZE,
            time_to_live,
        )
        .map_err(Error::Other)?;
        self.schedule_deletion(&info);
        Ok(info)
    }

    /// Deletes the file only if its current on-disk archive time equals the
    /// requested one, then prunes newly empty ancestor directories.
    /// Returns whether anything was removed.
    pub fn remove(&self, id: &FileId) -> Result<bool> {
        let matches_cache = self
            .cache
            .lock()
            .peek(&id.path)
            .map(|df| df.info().id.time == id.time)
            .unwrap_or(false);
        if matches_cache {
            if let Some(df) = self.cache.lock().pop(&id.path) {
                df.delete()?;
                prune_empty_dirs(self.visible_path(&id.path).parent(), &self.root);
                prune_empty_dirs(self.hidden_path(&id.path).parent(), &self.hidden_root);
                return Ok(true);
            }
        }

        let visible = self.visible_path(&id.path);
        match std::fs::metadata(&visible) {
            Ok(md) => {
                if ArchiveTime::from(md.modified()?) != id.time {
                    return Ok(false);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        match std::fs::remove_file(&visible) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        prune_empty_dirs(visible.parent(), &self.root);
        Ok(true)
    }

    /// Every extant visible file matching the filter, ordered by path.
    /// Used to seed a freshly handshaken peer with availability notices.
    pub fn walk(&self, filter: &Filter) -> Result<Vec<FileInfo>> {
        let mut out = BTreeMap::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| e.path() != self.hidden_root.as_path())
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("error walking archive: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(path) = ArchivePath::from_fs_path(&self.root, entry.path()) else {
                continue;
            };
            if !filter.matches(&path) {
                continue;
            }
            let Ok(md) = entry.metadata() else { continue };
            let Ok(modified) = md.modified() else { continue };
            let info = FileInfo::new(
                FileId {
                    path: path.clone(),
                    time: ArchiveTime::from(modified),
                },
                md.len(),
                DEFAULT_PIECE_SIZE,
                self.default_ttl,
            )
            .map_err(Error::Other)?;
            out.insert(path, info);
        }
        Ok(out.into_values().collect())
    }

    /// Reads back a whole visible file (the distributed-topology path).
    pub fn restore(&self, path: &ArchivePath) -> Result<Vec<u8>> {
        match std::fs::read(self.visible_path(path)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NoSuchFile(path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn archive_time(&self, path: &ArchivePath) -> Result<ArchiveTime> {
        match std::fs::metadata(self.visible_path(path)) {
            Ok(md) => Ok(ArchiveTime::from(md.modified()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NoSuchFile(path.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Closes every cached handle (writing trailers of incomplete files).
    pub fn close_all(&self) {
        let mut cache = self.cache.lock();
        while let Some((path, df)) = cache.pop_lru() {
            if let Err(e) = df.close() {
                warn!(%path, "error closing archived file: {e:#}");
            }
        }
    }

    fn schedule_deletion(&self, info: &FileInfo) {
        if info.time_to_live < 0 {
            return;
        }
        match self.delay_queue.get() {
            Some(queue) => {
                queue.act_upon_eventually(info.id.clone(), info.time_to_live * 1000);
            }
            None => debug!(
                path = %info.id.path,
                "no deletion queue registered, time-to-live ignored"
            ),
        }
    }
}

/// Startup cleanup of the hidden tree. The persisted deletion queue and
/// hidden files whose trailer still names them (resumable partial
/// downloads) stay; scratch leftovers and crash victims without a
/// bitmap go.
fn purge_hidden_tree(hidden_root: &Path) -> Result<()> {
    let walk: Vec<_> = walkdir::WalkDir::new(hidden_root)
        .contents_first(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .collect();
    for entry in walk {
        let path = entry.path();
        if path == hidden_root {
            continue;
        }
        if entry.file_type().is_dir() {
            // Gone if everything under it was purged.
            let _ = std::fs::remove_dir(path);
            continue;
        }
        if entry.file_name() == DELETION_QUEUE_FILE_NAME
            && path.parent() == Some(hidden_root)
        {
            continue;
        }
        let resumable = ArchivePath::from_fs_path(hidden_root, path)
            .map(|apath| disk_file::is_resumable_hidden_file(path, &apath))
            .unwrap_or(false);
        if resumable {
            continue;
        }
        debug!(?path, "purging unrecoverable hidden file");
        if let Err(e) = std::fs::remove_file(path) {
            warn!(?path, "error purging hidden file: {e}");
        }
    }
    Ok(())
}

/// Removes empty directories from `start` up to (but not including)
/// `stop`, stopping at the first non-empty or vanished one.
fn prune_empty_dirs(start: Option<&Path>, stop: &Path) {
    let mut current = start;
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            return;
        }
        match std::fs::remove_dir(dir) {
            Ok(()) => current = dir.parent(),
            // Not empty, already gone, or being raced; all fine.
            Err(_) => return,
        }
    }
}
