pub mod archive_path;
pub mod archive_time;
pub mod config;
pub mod file_info;
pub mod filter;
pub mod piece_map;
pub mod spawn_utils;
pub mod topology;

pub use archive_path::ArchivePath;
pub use archive_time::ArchiveTime;
pub use config::Config;
pub use file_info::{DEFAULT_PIECE_SIZE, FileId, FileInfo, Piece, PieceSpec};
pub use filter::{Filter, Predicate};
pub use piece_map::PieceMap;
pub use topology::Topology;
