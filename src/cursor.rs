//! Durable transfer checkpoints.
//!
//! A checkpoint is a single ASCII integer in a file: the smallest record
//! index not yet committed on this side of the transfer. Sender and receiver
//! each own an independent instance; they are never synchronized directly,
//! only through the ack/nack protocol.

use crate::error::{Result, XferError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// A checkpoint file. Created on first store; reads of a missing file yield
/// the initial cursor value 1.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: PathBuf,
}

impl Checkpoint {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cursor, defaulting to 1 when the file does not exist yet.
    pub fn load(&self) -> Result<u64> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(1),
            Err(e) => return Err(e.into()),
        };
        text.trim()
            .parse::<u64>()
            .map_err(|_| XferError::Store(format!("bad cursor in {}: {text:?}", self.path.display())))
    }

    /// Persist the cursor atomically: write a temp file in the same
    /// directory, fsync, then rename over the old file.
    pub fn store(&self, next: u64) -> Result<()> {
        let dir = self.path.parent().ok_or_else(|| {
            XferError::Store(format!("cursor path {} has no parent", self.path.display()))
        })?;
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        writeln!(tmp, "{next}")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| XferError::Store(format!("persisting {}: {e}", self.path.display())))?;
        Ok(())
    }

    /// Whether the checkpoint file exists on disk.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }
}
