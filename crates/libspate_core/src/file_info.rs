use serde::{Deserialize, Serialize};

use crate::{ArchivePath, ArchiveTime};

/// The canonical piece size, in bytes.
pub const DEFAULT_PIECE_SIZE: u32 = 131072;

pub fn last_element_size(total: u64, piece: u64) -> u64 {
    let rem = total % piece;
    if rem == 0 { piece } else { rem }
}

/// Identifies a specific version of a file.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub struct FileId {
    pub path: ArchivePath,
    pub time: ArchiveTime,
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.path, self.time)
    }
}

/// Immutable metadata of one file version: identity, size, piece size and
/// time-to-live (seconds; negative means indefinite).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct FileInfo {
    pub id: FileId,
    pub size: u64,
    pub piece_size: u32,
    pub time_to_live: i64,
}

impl FileInfo {
    pub fn new(id: FileId, size: u64, piece_size: u32, time_to_live: i64) -> anyhow::Result<Self> {
        if piece_size == 0 {
            anyhow::bail!("piece size must be positive");
        }
        Ok(Self {
            id,
            size,
            piece_size,
            time_to_live,
        })
    }

    /// A zero-byte file still has exactly one (empty) piece.
    pub fn piece_count(&self) -> u32 {
        if self.size == 0 {
            return 1;
        }
        self.size.div_ceil(self.piece_size as u64) as u32
    }

    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_size as u64
    }

    pub fn piece_size_at(&self, index: u32) -> u32 {
        if self.size == 0 {
            return 0;
        }
        if index + 1 == self.piece_count() {
            return last_element_size(self.size, self.piece_size as u64) as u32;
        }
        self.piece_size
    }

    pub fn validate_index(&self, index: u32) -> Option<u32> {
        if index < self.piece_count() { Some(index) } else { None }
    }

    pub fn spec(&self, index: u32) -> anyhow::Result<PieceSpec> {
        PieceSpec::new(self.clone(), index)
    }

    pub fn iter_piece_specs(&self) -> impl Iterator<Item = PieceSpec> + '_ {
        (0..self.piece_count()).map(move |index| PieceSpec {
            info: self.clone(),
            index,
        })
    }

    /// Same archive time but disagreeing geometry. Such a pair can never be
    /// reconciled and is surfaced as a hard error.
    pub fn conflicts_with(&self, other: &FileInfo) -> bool {
        self.id == other.id && (self.size != other.size || self.piece_size != other.piece_size)
    }
}

/// One piece of one file version.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct PieceSpec {
    pub info: FileInfo,
    pub index: u32,
}

impl PieceSpec {
    pub fn new(info: FileInfo, index: u32) -> anyhow::Result<Self> {
        if info.validate_index(index).is_none() {
            anyhow::bail!(
                "piece index {index} out of range for {} ({} pieces)",
                info.id,
                info.piece_count()
            );
        }
        Ok(Self { info, index })
    }

    pub fn offset(&self) -> u64 {
        self.info.piece_offset(self.index)
    }

    pub fn len(&self) -> u32 {
        self.info.piece_size_at(self.index)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Display for PieceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.info.id, self.index)
    }
}

/// A piece spec together with its bytes. Length is checked at construction
/// and holds from then on.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct Piece {
    spec: PieceSpec,
    data: Vec<u8>,
}

impl Piece {
    pub fn new(spec: PieceSpec, data: Vec<u8>) -> anyhow::Result<Self> {
        if data.len() != spec.len() as usize {
            anyhow::bail!(
                "piece {} carries {} bytes, expected {}",
                spec,
                data.len(),
                spec.len()
            );
        }
        Ok(Self { spec, data })
    }

    pub fn spec(&self) -> &PieceSpec {
        &self.spec
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
