use libspate_core::{ArchivePath, ArchiveTime, FileId};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The offered file version is older than what the archive holds.
    /// Pieces of such versions are silently dropped by callers.
    #[error("version of {path} is older than the archived {disk}")]
    StaleVersion { path: ArchivePath, disk: ArchiveTime },

    /// Same archive time, different size or piece size. Never reconcilable.
    #[error("file {id} disagrees with the archived copy on size or piece size")]
    VersionMismatch { id: FileId },

    /// The hidden file's trailer could not be read back. The file is
    /// deleted and recreated; callers treat this as transient.
    #[error("hidden file trailer for {path} is corrupt")]
    CorruptTrailer { path: ArchivePath },

    #[error("piece {index} of {id} has not been received")]
    MissingPiece { id: FileId, index: u32 },

    #[error("no archived copy of {0}")]
    NoSuchFile(ArchivePath),

    /// Neither the tracker nor the archived topology file could provide a
    /// topology. Fatal at subscribe time.
    #[error("topology unavailable: tracker unreachable and no archived copy")]
    TopologyUnavailable,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn is_stale_version(&self) -> bool {
        matches!(self, Error::StaleVersion { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Too many open files. Recovered by evicting the archive's LRU handle.
pub(crate) fn is_file_table_full(e: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
    }
    #[cfg(not(unix))]
    {
        let _ = e;
        false
    }
}
