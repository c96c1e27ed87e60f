//! Data-file naming, selection, and the receiver-side record store.
//!
//! Each deployment of a unit owns one newline-delimited data file under
//! `<root>/sn<serial>/raw/`, named by the deployment record's index padded
//! to 10 digits. The name carries a two-state prefix: `new` while the file
//! is provisional, `dep` once a downstream consumer has claimed it. The
//! sender selects among provisional files; the receiver writes to whichever
//! form exists, preferring the finalized one.

use crate::cursor::Checkpoint;
use crate::error::{Result, XferError};
use crate::record::Record;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

const PROVISIONAL_PREFIX: &str = "new";
const FINALIZED_PREFIX: &str = "dep";

/// Receiver-side cursor file name, shared with external consoles.
pub const RECEIVER_CURSOR_FILE: &str = "xfer.nextRecord";

/// Zero-pad a deployment index to the 10 digits used in file names.
pub fn pad10(n: u64) -> String {
    format!("{n:010}")
}

/// Directory holding one unit's data files.
pub fn unit_raw_dir(data_root: &Path, serial: &str) -> PathBuf {
    data_root.join(format!("sn{serial}")).join("raw")
}

/// Leading index of a provisional file name, if it is one.
fn provisional_index(name: &str) -> Option<u64> {
    name.strip_prefix(PROVISIONAL_PREFIX)?.parse().ok()
}

/// Provisional file indices for a unit, sorted descending. Missing
/// directories read as empty.
fn provisional_indices(data_root: &Path, serial: &str) -> Result<Vec<u64>> {
    let dir = unit_raw_dir(data_root, serial);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut indices: Vec<u64> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| provisional_index(&e.file_name().to_string_lossy()))
        .collect();
    indices.sort_unstable_by(|a, b| b.cmp(a));
    Ok(indices)
}

/// Find the data file most likely to contain the record at `cursor`: the
/// provisional file with the largest leading index ≤ `cursor`. When none
/// qualifies (the cursor was moved past all retained files), fall back to
/// the oldest retained file so transfer can resume at all.
pub fn find_data_file(data_root: &Path, serial: &str, cursor: u64) -> Result<Option<PathBuf>> {
    let indices = provisional_indices(data_root, serial)?;
    let dir = unit_raw_dir(data_root, serial);
    for &idx in &indices {
        if idx <= cursor {
            return Ok(Some(dir.join(format!("{PROVISIONAL_PREFIX}{}", pad10(idx)))));
        }
    }
    match indices.last() {
        Some(&oldest) => {
            tracing::warn!(
                serial,
                cursor,
                oldest,
                "cursor precedes all retained data files, falling back to oldest"
            );
            Ok(Some(dir.join(format!("{PROVISIONAL_PREFIX}{}", pad10(oldest)))))
        }
        None => Ok(None),
    }
}

/// First deployment boundary after `cursor`: the smallest provisional file
/// index strictly greater than it, used to cross into the next deployment
/// when the current file has nothing left to send.
pub fn next_deployment_start(data_root: &Path, serial: &str, cursor: u64) -> Result<Option<u64>> {
    let indices = provisional_indices(data_root, serial)?;
    Ok(indices.into_iter().filter(|&idx| idx > cursor).min())
}

/// Outcome of committing a validated batch into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// New records were appended and the checkpoint advanced.
    Appended { count: usize },
    /// Every record was already applied; nothing changed.
    Duplicate,
    /// No destination file existed and the batch does not begin a
    /// deployment; records were dropped but the checkpoint advanced.
    NoDestination,
}

/// Destination store on the receiving side: one directory per unit, one
/// data file per deployment, one cursor file per unit.
#[derive(Debug, Clone)]
pub struct RecordStore {
    root: PathBuf,
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn checkpoint_for(&self, serial: &str) -> Checkpoint {
        Checkpoint::at(self.root.join(format!("sn{serial}")).join(RECEIVER_CURSOR_FILE))
    }

    /// Durably and idempotently apply a validated batch.
    ///
    /// Records below the unit's checkpoint are dropped (a resend of applied
    /// data is a successful no-op); survivors are appended in order to the
    /// deployment's data file, then the checkpoint advances to `last + 1`.
    /// Any I/O failure surfaces before the checkpoint moves.
    ///
    /// Callers serialize commits per unit; this method does no locking.
    pub async fn commit(
        &self,
        serial: &str,
        last: u64,
        records: &[(Record, String)],
    ) -> Result<CommitOutcome> {
        let raw_dir = unit_raw_dir(&self.root, serial);
        tokio::fs::create_dir_all(&raw_dir).await?;

        let checkpoint = self.checkpoint_for(serial);
        if !checkpoint.exists() {
            checkpoint.store(1)?;
        }
        let next = checkpoint.load()?;

        let remaining: Vec<&(Record, String)> =
            records.iter().filter(|(rec, _)| rec.index >= next).collect();
        let Some((first, _)) = remaining.first().map(|r| (&r.0, &r.1)) else {
            tracing::debug!(serial, last, "batch fully below checkpoint, no-op");
            return Ok(CommitOutcome::Duplicate);
        };

        let suffix = pad10(first.deployment_file_index());
        let finalized = raw_dir.join(format!("{FINALIZED_PREFIX}{suffix}"));
        let provisional = raw_dir.join(format!("{PROVISIONAL_PREFIX}{suffix}"));

        let target = if finalized.is_file() {
            Some(finalized)
        } else if provisional.is_file() || first.is_deployment() {
            Some(provisional)
        } else {
            None
        };

        let outcome = match target {
            Some(path) => {
                let mut block = String::new();
                for (_, line) in &remaining {
                    block.push_str(line);
                    block.push('\n');
                }
                let mut file = tokio::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(&path)
                    .await?;
                file.write_all(block.as_bytes()).await?;
                file.flush().await?;
                file.sync_all().await?;
                CommitOutcome::Appended {
                    count: remaining.len(),
                }
            }
            None => {
                tracing::warn!(
                    serial,
                    deployment = first.deployment_file_index(),
                    count = remaining.len(),
                    "no data file for deployment and batch does not start one, dropping records"
                );
                CommitOutcome::NoDestination
            }
        };

        checkpoint.store(last + 1)?;
        Ok(outcome)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Read and trim a serial-number file, as provisioned on each unit.
pub fn read_serial_file(path: &Path) -> Result<String> {
    let text = fs::read_to_string(path)?;
    let serial = text.trim().to_string();
    if serial.is_empty() {
        return Err(XferError::Config(format!(
            "serial file {} is empty",
            path.display()
        )));
    }
    Ok(serial)
}
