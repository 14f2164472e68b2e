use std::fs::File;
use std::io::{self, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::buffer::{read_until_with_max_size, ScanResult};
use crate::metadata::{path_ident, FileIdent, PortableFileExt};
use crate::{FilePosition, ReadFrom};

/// Lifecycle of a tailed file.
///
/// ```text
/// New -> Tailing <-> IdleWait -> RotatedOut -> Closed
/// ```
///
/// `Tailing` and `IdleWait` alternate as the file grows and drains.
/// `RotatedOut` marks the generation that was replaced or truncated behind
/// the path; [`FileTailer::rotate`] then re-enters `Tailing` on the new
/// generation. `Closed` is terminal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TailState {
    New,
    Tailing,
    IdleWait,
    RotatedOut,
    Closed,
}

/// What a rotation probe observed about the path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Rotation {
    /// Same file, nothing new to read.
    None,
    /// Same file and it has grown past our position.
    Grew,
    /// The path now points at a different file.
    Replaced,
    /// Same identity but the file shrank below our position (copytruncate).
    Shrunk,
    /// The path no longer exists.
    Vanished,
}

/// A line handed out by the tailer, with the byte offset it started at.
#[derive(Debug)]
pub struct TailLine {
    pub offset: FilePosition,
    pub bytes: Bytes,
}

/// Polling reader that follows one path across rotation.
///
/// The tailer owns the partial-line accumulator, so an incomplete write
/// observed at EOF is completed on a later call instead of being emitted
/// torn. Rotation is never detected implicitly: the caller probes with
/// [`check_rotation`](Self::check_rotation) and decides when to
/// [`rotate`](Self::rotate), which lets it persist the offset switch
/// atomically first.
pub struct FileTailer {
    path: PathBuf,
    reader: BufReader<File>,
    position: FilePosition,
    ident: FileIdent,
    state: TailState,
    buf: BytesMut,
    max_line_bytes: usize,
}

impl FileTailer {
    pub fn open(path: PathBuf, read_from: ReadFrom, max_line_bytes: usize) -> io::Result<Self> {
        let file = File::open(&path)?;
        let ident = file.file_ident()?;
        let mut reader = BufReader::new(file);

        let position = match read_from {
            ReadFrom::Beginning => 0,
            ReadFrom::End => reader.seek(SeekFrom::End(0))?,
            ReadFrom::Checkpoint(position) => reader.seek(SeekFrom::Start(position))?,
        };
        debug!(message = "Opened file for tailing.", path = ?path, %position);

        Ok(Self {
            path,
            reader,
            position,
            ident,
            state: TailState::New,
            buf: BytesMut::with_capacity(2048),
            max_line_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> FilePosition {
        self.position
    }

    pub fn ident(&self) -> FileIdent {
        self.ident
    }

    pub fn state(&self) -> TailState {
        self.state
    }

    /// Read the next complete line, or `None` when the file is drained.
    ///
    /// Draining moves the tailer into `IdleWait`; a successful later read
    /// moves it back to `Tailing`.
    pub fn read_line(&mut self) -> io::Result<Option<TailLine>> {
        if matches!(self.state, TailState::Closed | TailState::RotatedOut) {
            return Ok(None);
        }
        let offset = self.position - self.buf.len() as u64;
        match read_until_with_max_size(
            &mut self.reader,
            &mut self.position,
            b"\n",
            &mut self.buf,
            self.max_line_bytes,
        )? {
            ScanResult::Delimited(_) => {
                self.state = TailState::Tailing;
                let mut bytes = self.buf.split().freeze();
                // Journals written on Windows hosts end lines with \r\n.
                if bytes.last() == Some(&b'\r') {
                    bytes.truncate(bytes.len() - 1);
                }
                Ok(Some(TailLine { offset, bytes }))
            }
            ScanResult::Pending => {
                self.state = TailState::IdleWait;
                Ok(None)
            }
        }
    }

    /// Probe the path for rotation without touching the open handle.
    ///
    /// `Replaced`, `Shrunk` and `Vanished` all move this generation into
    /// `RotatedOut`; reads stop until the caller rotates.
    pub fn check_rotation(&mut self) -> io::Result<Rotation> {
        let (ident, len) = match path_ident(&self.path) {
            Ok(ident) => {
                let len = std::fs::metadata(&self.path)?.len();
                (ident, len)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.state = TailState::RotatedOut;
                return Ok(Rotation::Vanished);
            }
            Err(e) => return Err(e),
        };

        if ident != self.ident {
            debug!(message = "File identity changed behind path.", path = ?self.path);
            self.state = TailState::RotatedOut;
            return Ok(Rotation::Replaced);
        }
        if len < self.position {
            debug!(
                message = "File shrank below read position.",
                path = ?self.path,
                position = %self.position,
                size = %len,
            );
            self.state = TailState::RotatedOut;
            return Ok(Rotation::Shrunk);
        }
        if len > self.position {
            return Ok(Rotation::Grew);
        }
        Ok(Rotation::None)
    }

    /// Reopen the path from offset zero as a new generation.
    ///
    /// Any partial line buffered from the rotated-out generation is dropped:
    /// it can never be completed, and emitting it torn would corrupt the
    /// record stream.
    pub fn rotate(&mut self) -> io::Result<()> {
        let file = File::open(&self.path)?;
        self.ident = file.file_ident()?;
        self.reader = BufReader::new(file);
        self.position = 0;
        if !self.buf.is_empty() {
            trace!(
                message = "Dropping partial line at rotation boundary.",
                bytes = self.buf.len(),
            );
            self.buf.clear();
        }
        self.state = TailState::Tailing;
        Ok(())
    }

    /// Take whatever partial line is buffered, if any. Used at shutdown to
    /// report (not emit) an unterminated tail.
    pub fn take_partial(&mut self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.split().freeze())
        }
    }

    pub fn close(&mut self) {
        self.state = TailState::Closed;
    }
}
