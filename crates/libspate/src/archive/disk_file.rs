// One archived file, stored as pieces. While incomplete it lives in the
// hidden tree with its piece map persisted in a trailer; once the last
// piece lands it is truncated, stamped, and atomically renamed into the
// visible tree.
//
// Trailer layout, appended after the declared size bytes:
//   serialized FileInfo | encoded PieceMap | 8-byte big-endian offset
// where the offset points at the start of the trailer (== declared size).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bincode::Options;
use byteorder::{BE, ByteOrder};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use libspate_core::{ArchiveTime, FileInfo, Piece, PieceMap, PieceSpec};

use crate::error::{Error, Result};

const TRAILER_OFFSET_LEN: u64 = 8;
const TRAILER_LIMIT: u64 = 1 << 20;

fn bopts() -> impl bincode::Options {
    bincode::DefaultOptions::new().with_limit(TRAILER_LIMIT)
}

pub enum PutOutcome {
    Written { completed: bool },
    AlreadyPresent,
}

enum State {
    Closed,
    /// Complete, read-only handle on the visible path.
    Visible(File),
    /// Incomplete, read-write handle on the hidden path.
    Hidden(File),
}

struct Inner {
    state: State,
    map: PieceMap,
}

pub(crate) struct DiskFile {
    info: FileInfo,
    visible_path: PathBuf,
    hidden_path: PathBuf,
    inner: Mutex<Inner>,
}

fn mtime(path: &Path) -> std::io::Result<ArchiveTime> {
    Ok(ArchiveTime::from(std::fs::metadata(path)?.modified()?))
}

fn read_trailer(file: &File, path: &libspate_core::ArchivePath) -> Result<(FileInfo, PieceMap)> {
    let corrupt = || Error::CorruptTrailer { path: path.clone() };
    let len = file.metadata()?.len();
    if len < TRAILER_OFFSET_LEN {
        return Err(corrupt());
    }
    let mut offset_buf = [0u8; 8];
    let mut f = file;
    f.seek(SeekFrom::Start(len - TRAILER_OFFSET_LEN))?;
    f.read_exact(&mut offset_buf)?;
    let offset = BE::read_u64(&offset_buf);
    if offset > len - TRAILER_OFFSET_LEN || len - offset > TRAILER_LIMIT {
        return Err(corrupt());
    }
    let mut trailer = vec![0u8; (len - TRAILER_OFFSET_LEN - offset) as usize];
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(&mut trailer)?;

    let mut cursor = std::io::Cursor::new(&trailer[..]);
    let info: FileInfo = bopts()
        .deserialize_from(&mut cursor)
        .map_err(|_| corrupt())?;
    let consumed = cursor.position() as usize;
    let (map, _) = PieceMap::decode(&trailer[consumed..]).map_err(|_| corrupt())?;
    if map.pieces() != info.piece_count() || offset != info.size {
        return Err(corrupt());
    }
    Ok((info, map))
}

fn write_trailer(file: &File, info: &FileInfo, map: &PieceMap) -> Result<()> {
    let mut buf = Vec::new();
    bopts()
        .serialize_into(&mut buf, info)
        .map_err(|e| Error::Other(anyhow::anyhow!("error serializing trailer: {e}")))?;
    map.encode(&mut buf);
    let mut offset = [0u8; 8];
    BE::write_u64(&mut offset, info.size);
    buf.extend_from_slice(&offset);

    // Piece data must be durable before the bitmap claims it is.
    file.sync_data()?;
    file.set_len(info.size)?;
    let mut f = file;
    f.seek(SeekFrom::Start(info.size))?;
    f.write_all(&buf)?;
    file.sync_data()?;
    Ok(())
}

/// Whether a hidden file carries a readable trailer naming itself. Files
/// that fail this (scratch leftovers, crash victims without a bitmap) are
/// unrecoverable and get purged at startup.
pub(crate) fn is_resumable_hidden_file(path: &Path, apath: &libspate_core::ArchivePath) -> bool {
    let Ok(file) = OpenOptions::new().read(true).open(path) else {
        return false;
    };
    match read_trailer(&file, apath) {
        Ok((info, _)) => info.id.path == *apath,
        Err(_) => false,
    }
}

/// Opens or creates on-disk state for `info`, applying the version
/// arbitration rules: a newer on-disk version rejects us, an older one is
/// discarded, an equal-time disagreement on geometry is a hard error, and
/// a corrupt hidden trailer means delete and recreate.
fn open_state(info: &FileInfo, visible: &Path, hidden: &Path) -> Result<(State, PieceMap)> {
    if let Ok(disk_time) = mtime(visible) {
        if disk_time > info.id.time {
            return Err(Error::StaleVersion {
                path: info.id.path.clone(),
                disk: disk_time,
            });
        }
        if disk_time == info.id.time {
            let file = OpenOptions::new().read(true).open(visible)?;
            if file.metadata()?.len() != info.size {
                return Err(Error::VersionMismatch {
                    id: info.id.clone(),
                });
            }
            return Ok((
                State::Visible(file),
                PieceMap::new_complete(info.piece_count()),
            ));
        }
        debug!(path = %info.id.path, "discarding older archived version {disk_time}");
        std::fs::remove_file(visible)?;
    }

    if hidden.exists() {
        let file = OpenOptions::new().read(true).write(true).open(hidden)?;
        match read_trailer(&file, &info.id.path) {
            Ok((disk_info, map)) => {
                if disk_info.id.time > info.id.time {
                    return Err(Error::StaleVersion {
                        path: info.id.path.clone(),
                        disk: disk_info.id.time,
                    });
                }
                if disk_info.id.time == info.id.time {
                    if disk_info.conflicts_with(info) {
                        return Err(Error::VersionMismatch {
                            id: info.id.clone(),
                        });
                    }
                    return Ok((State::Hidden(file), map));
                }
                debug!(path = %info.id.path, "discarding older in-progress version");
            }
            Err(Error::CorruptTrailer { .. }) => {
                warn!(path = %info.id.path, "hidden file trailer corrupt, recreating");
            }
            Err(e) => return Err(e),
        }
        drop(file);
        std::fs::remove_file(hidden)?;
    }

    if let Some(parent) = hidden.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(hidden)?;
    file.set_len(info.size)?;
    Ok((State::Hidden(file), PieceMap::new_empty(info.piece_count())))
}

impl DiskFile {
    pub fn open(info: FileInfo, visible_path: PathBuf, hidden_path: PathBuf) -> Result<Self> {
        let (state, map) = open_state(&info, &visible_path, &hidden_path)?;
        Ok(Self {
            info,
            visible_path,
            hidden_path,
            inner: Mutex::new(Inner { state, map }),
        })
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().map.is_complete()
    }

    fn ensure_open(&self, inner: &mut Inner) -> Result<()> {
        if matches!(inner.state, State::Closed) {
            let (state, map) = open_state(&self.info, &self.visible_path, &self.hidden_path)?;
            inner.state = state;
            inner.map = map;
        }
        Ok(())
    }

    /// Writes one piece. Re-writing a piece already present is a no-op.
    /// Returns whether this write completed the file; completion truncates
    /// the trailer, stamps the archive time as mtime, and atomically
    /// renames into the visible tree.
    pub fn put_piece(&self, piece: &Piece) -> Result<PutOutcome> {
        let spec = piece.spec();
        let mut inner = self.inner.lock();
        self.ensure_open(&mut inner)?;
        let inner = &mut *inner;
        if inner.map.get(spec.index) {
            return Ok(PutOutcome::AlreadyPresent);
        }
        let file = match &inner.state {
            State::Hidden(f) => f,
            // Complete files have every bit set, so this state is
            // unreachable once the map check above passed.
            State::Visible(_) | State::Closed => return Ok(PutOutcome::AlreadyPresent),
        };
        let mut f = file;
        f.seek(SeekFrom::Start(spec.offset()))?;
        f.write_all(piece.data())?;
        inner.map.set(spec.index);
        trace!(piece = %spec, "wrote piece");

        if !inner.map.is_complete() {
            return Ok(PutOutcome::Written { completed: false });
        }
        self.finalize(inner)?;
        Ok(PutOutcome::Written { completed: true })
    }

    fn finalize(&self, inner: &mut Inner) -> Result<()> {
        let file = match &inner.state {
            State::Hidden(f) => f,
            _ => return Ok(()),
        };
        file.set_len(self.info.size)?;
        file.sync_all()?;
        file.set_modified(self.info.id.time.to_system_time())?;
        if let Some(parent) = self.visible_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // A concurrent prune may delete the freshly created parents out
        // from under the rename; recreate and retry.
        let mut attempts = 0;
        loop {
            match std::fs::rename(&self.hidden_path, &self.visible_path) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && attempts < 3 => {
                    attempts += 1;
                    if let Some(parent) = self.visible_path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        inner.state = State::Closed;
        debug!(path = %self.info.id.path, "file complete, published");
        Ok(())
    }

    pub fn has_piece(&self, index: u32) -> Result<bool> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, State::Closed)
            && !self.visible_path.exists()
            && !self.hidden_path.exists()
        {
            // Nothing on disk; don't create archive state just to answer.
            return Ok(false);
        }
        self.ensure_open(&mut inner)?;
        Ok(inner.map.get(index))
    }

    /// Reads a piece that has been received.
    pub fn get_piece(&self, spec: &PieceSpec) -> Result<Piece> {
        let mut inner = self.inner.lock();
        self.ensure_open(&mut inner)?;
        if !inner.map.get(spec.index) {
            return Err(Error::MissingPiece {
                id: self.info.id.clone(),
                index: spec.index,
            });
        }
        let file = match &inner.state {
            State::Visible(f) | State::Hidden(f) => f,
            State::Closed => unreachable!("ensure_open leaves the file open"),
        };
        let mut buf = vec![0u8; spec.len() as usize];
        let mut f = file;
        f.seek(SeekFrom::Start(spec.offset()))?;
        f.read_exact(&mut buf)?;
        Piece::new(spec.clone(), buf).map_err(Error::Other)
    }

    /// Releases the OS handle. An incomplete file gets its trailer written
    /// so the piece map survives; the hidden file itself stays. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match &inner.state {
            State::Closed => return Ok(()),
            State::Visible(_) => {}
            State::Hidden(file) => {
                if !inner.map.is_complete() {
                    write_trailer(file, &self.info, &inner.map)?;
                }
            }
        }
        inner.state = State::Closed;
        Ok(())
    }

    /// Closes and unlinks both on-disk forms.
    pub fn delete(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.state = State::Closed;
        for path in [&self.visible_path, &self.hidden_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libspate_core::{ArchivePath, FileId};

    fn info_at(dir: &Path, size: u64, piece_size: u32, time: i64) -> (FileInfo, PathBuf, PathBuf) {
        let info = FileInfo::new(
            FileId {
                path: ArchivePath::new("DATA/f").unwrap(),
                time: ArchiveTime::from_millis(time),
            },
            size,
            piece_size,
            -1,
        )
        .unwrap();
        (info, dir.join("visible/DATA/f"), dir.join("hidden/DATA/f"))
    }

    fn piece(info: &FileInfo, index: u32, byte: u8) -> Piece {
        let spec = info.spec(index).unwrap();
        let len = spec.len() as usize;
        Piece::new(spec, vec![byte; len]).unwrap()
    }

    #[test]
    fn test_assemble_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let (info, visible, hidden) = info_at(dir.path(), 25, 10, 1000);
        let df = DiskFile::open(info.clone(), visible.clone(), hidden.clone()).unwrap();

        assert!(matches!(
            df.put_piece(&piece(&info, 2, 3)).unwrap(),
            PutOutcome::Written { completed: false }
        ));
        assert!(hidden.exists() && !visible.exists());
        assert!(df.has_piece(2).unwrap());
        assert!(!df.has_piece(0).unwrap());

        // Idempotent per piece.
        assert!(matches!(
            df.put_piece(&piece(&info, 2, 3)).unwrap(),
            PutOutcome::AlreadyPresent
        ));

        df.put_piece(&piece(&info, 0, 1)).unwrap();
        assert!(matches!(
            df.put_piece(&piece(&info, 1, 2)).unwrap(),
            PutOutcome::Written { completed: true }
        ));
        assert!(visible.exists() && !hidden.exists());
        assert_eq!(std::fs::metadata(&visible).unwrap().len(), 25);
        assert_eq!(mtime(&visible).unwrap(), info.id.time);

        let content = std::fs::read(&visible).unwrap();
        assert_eq!(&content[..10], &[1u8; 10]);
        assert_eq!(&content[10..20], &[2u8; 10]);
        assert_eq!(&content[20..], &[3u8; 5]);

        // Reads work off the published file.
        let got = df.get_piece(&info.spec(2).unwrap()).unwrap();
        assert_eq!(got.data(), &[3u8; 5]);
    }

    #[test]
    fn test_zero_byte_file() {
        let dir = tempfile::tempdir().unwrap();
        let (info, visible, _) = info_at(dir.path(), 0, 10, 1000);
        let df = DiskFile::open(info.clone(), visible.clone(), dir.path().join("hidden/DATA/f"))
            .unwrap();
        assert!(matches!(
            df.put_piece(&piece(&info, 0, 0)).unwrap(),
            PutOutcome::Written { completed: true }
        ));
        assert!(visible.exists());
        assert_eq!(std::fs::metadata(&visible).unwrap().len(), 0);
    }

    #[test]
    fn test_trailer_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (info, visible, hidden) = info_at(dir.path(), 25, 10, 1000);
        {
            let df = DiskFile::open(info.clone(), visible.clone(), hidden.clone()).unwrap();
            df.put_piece(&piece(&info, 1, 2)).unwrap();
            df.close().unwrap();
            df.close().unwrap();
        }
        // Trailer appended past the declared size.
        assert!(std::fs::metadata(&hidden).unwrap().len() > 25);

        let df = DiskFile::open(info.clone(), visible.clone(), hidden.clone()).unwrap();
        assert!(df.has_piece(1).unwrap());
        assert!(!df.has_piece(0).unwrap());
        df.put_piece(&piece(&info, 0, 1)).unwrap();
        df.put_piece(&piece(&info, 2, 3)).unwrap();
        assert!(visible.exists());
        let content = std::fs::read(&visible).unwrap();
        assert_eq!(content.len(), 25);
        assert_eq!(&content[10..20], &[2u8; 10]);
    }

    #[test]
    fn test_corrupt_trailer_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let (info, visible, hidden) = info_at(dir.path(), 25, 10, 1000);
        std::fs::create_dir_all(hidden.parent().unwrap()).unwrap();
        std::fs::write(&hidden, b"junk").unwrap();

        let df = DiskFile::open(info.clone(), visible, hidden).unwrap();
        assert!(!df.has_piece(0).unwrap());
    }

    #[test]
    fn test_version_arbitration() {
        let dir = tempfile::tempdir().unwrap();
        let (old, visible, hidden) = info_at(dir.path(), 25, 10, 1000);
        {
            let df = DiskFile::open(old.clone(), visible.clone(), hidden.clone()).unwrap();
            for i in 0..3 {
                df.put_piece(&piece(&old, i, 1)).unwrap();
            }
        }
        assert!(visible.exists());

        // Older than the archived copy: rejected.
        let (older, ..) = info_at(dir.path(), 25, 10, 500);
        assert!(matches!(
            DiskFile::open(older, visible.clone(), hidden.clone()),
            Err(Error::StaleVersion { .. })
        ));

        // Same time, different size: hard mismatch.
        let (conflicting, ..) = info_at(dir.path(), 30, 10, 1000);
        assert!(matches!(
            DiskFile::open(conflicting, visible.clone(), hidden.clone()),
            Err(Error::VersionMismatch { .. })
        ));

        // Newer: the archived copy is discarded and rebuilt.
        let (newer, ..) = info_at(dir.path(), 30, 10, 2000);
        let df = DiskFile::open(newer.clone(), visible.clone(), hidden.clone()).unwrap();
        assert!(!visible.exists());
        assert!(!df.has_piece(0).unwrap());
        for i in 0..3 {
            df.put_piece(&piece(&newer, i, 9)).unwrap();
        }
        assert!(visible.exists());
        assert_eq!(std::fs::metadata(&visible).unwrap().len(), 30);
    }

    #[test]
    fn test_exact_multiple_of_piece_size() {
        let dir = tempfile::tempdir().unwrap();
        let (info, visible, hidden) = info_at(dir.path(), 20, 10, 1000);
        assert_eq!(info.piece_count(), 2);
        let df = DiskFile::open(info.clone(), visible.clone(), hidden).unwrap();
        df.put_piece(&piece(&info, 0, 1)).unwrap();
        assert!(matches!(
            df.put_piece(&piece(&info, 1, 2)).unwrap(),
            PutOutcome::Written { completed: true }
        ));
        assert_eq!(std::fs::metadata(&visible).unwrap().len(), 20);
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let (info, visible, hidden) = info_at(dir.path(), 25, 10, 1000);
        let df = DiskFile::open(info.clone(), visible.clone(), hidden.clone()).unwrap();
        df.put_piece(&piece(&info, 0, 1)).unwrap();
        df.delete().unwrap();
        assert!(!hidden.exists() && !visible.exists());
        df.delete().unwrap();
    }
}
