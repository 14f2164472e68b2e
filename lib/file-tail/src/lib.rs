#![deny(clippy::all)]

//! Rotation-aware tailing primitives for journal files.
//!
//! A [`FileTailer`] follows a single path across log rotation, detecting when
//! the file behind the path has been replaced or truncated and reopening it
//! transparently. Completed archives (`*.zip`) are drained through
//! [`archive::for_each_line`] instead of being tailed.

pub mod archive;
pub mod buffer;
mod metadata;
mod tailer;

pub use self::metadata::{FileIdent, PortableFileExt};
pub use self::tailer::{FileTailer, Rotation, TailLine, TailState};

pub type FilePosition = u64;

/// Where to begin reading a newly opened file.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ReadFrom {
    #[default]
    Beginning,
    End,
    Checkpoint(FilePosition),
}
