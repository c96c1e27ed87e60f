//! Resumable tailing reader over one growing, line-delimited file.
//!
//! The reader hands out complete lines speculatively and only moves past
//! them on [`TailReader::advance`], so a caller can read, transmit, and
//! commit after external confirmation. The source file may be concurrently
//! appended to by another process; only bytes already flushed to disk are
//! consumed, so there is no read/write race for written data. The reader is
//! driven from a single control loop and needs no locking.

use crate::error::{Result, XferError};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

/// Read granularity, also the upper bound a single record line may occupy.
const READ_CHUNK: usize = 32768;

/// Outcome of [`TailReader::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStatus {
    /// New path, or same path with data available to read.
    Opened,
    /// Same path, same size and mtime, nothing buffered: a fast no-op.
    Unchanged,
}

#[derive(Debug)]
struct BufferedLine {
    text: String,
    /// Bytes this line occupied in the file, newline included.
    raw_len: u64,
}

#[derive(Debug, Default)]
pub struct TailReader {
    path: Option<PathBuf>,
    file: Option<File>,
    /// Partial (not yet newline-terminated) tail of the last read.
    frag: Vec<u8>,
    /// Complete lines waiting to be read or committed.
    lines: VecDeque<BufferedLine>,
    /// File offset of the first uncommitted byte.
    committed: u64,
    /// File offset of the next byte to fetch.
    fetch_pos: u64,
    /// Number of lines handed out by the most recent `read_lines`.
    lines_read: usize,
    size: u64,
    modified: Option<SystemTime>,
}

impl TailReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard all state; the next `open` starts from the beginning.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Point the reader at `path`.
    ///
    /// A different path than last time, or a file that shrank since last
    /// open, resets to start-of-file. Returns [`OpenStatus::Unchanged`] when
    /// the same file has nothing new and nothing buffered.
    pub async fn open(&mut self, path: &Path) -> Result<OpenStatus> {
        let meta = tokio::fs::metadata(path).await?;
        let size = meta.len();
        let modified = meta.modified().ok();

        if self.path.as_deref() != Some(path) {
            self.reset();
        } else {
            if modified == self.modified && self.lines.is_empty() && self.fetch_pos == size {
                return Ok(OpenStatus::Unchanged);
            }
            if size < self.size {
                self.reset();
            }
        }

        self.path = Some(path.to_path_buf());
        self.size = size;
        self.modified = modified;
        self.file = Some(File::open(path).await?);
        Ok(OpenStatus::Opened)
    }

    /// Drop the file handle. Buffered lines and offsets survive, so a later
    /// `open` of the same path resumes where this one left off.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Return up to `max` buffered complete lines, newline stripped.
    ///
    /// Reads forward from the file as needed but never blocks waiting for
    /// more data and never returns a partial line. The returned lines stay
    /// buffered until [`TailReader::advance`] commits them.
    pub async fn read_lines(&mut self, max: usize) -> Result<Vec<String>> {
        self.lines_read = 0;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| XferError::Store("tail reader is not open".into()))?;

        if self.lines.len() < max {
            file.seek(SeekFrom::Start(self.fetch_pos)).await?;
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                self.fetch_pos += n as u64;
                self.frag.extend_from_slice(&buf[..n]);
                while let Some(i) = self.frag.iter().position(|&b| b == b'\n') {
                    let raw: Vec<u8> = self.frag.drain(..=i).collect();
                    self.lines.push_back(BufferedLine {
                        text: String::from_utf8_lossy(&raw[..i]).into_owned(),
                        raw_len: raw.len() as u64,
                    });
                }
                if self.lines.len() >= max {
                    break;
                }
            }
        }

        let n = self.lines.len().min(max);
        self.lines_read = n;
        Ok(self.lines.iter().take(n).map(|l| l.text.clone()).collect())
    }

    /// Commit the lines returned by the most recent `read_lines`: they are
    /// dropped from the buffer and will not be returned again.
    pub fn advance(&mut self) {
        let n = self.lines_read.min(self.lines.len());
        for _ in 0..n {
            let line = self.lines.pop_front().expect("counted above");
            self.committed += line.raw_len;
        }
        self.lines_read = 0;
    }

    /// File offset of the first uncommitted byte.
    pub fn committed(&self) -> u64 {
        self.committed
    }
}
