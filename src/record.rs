//! Record model and strict decoding of untrusted JSON lines.
//!
//! Every line that crosses the wire or is tailed from a data file goes
//! through [`Record::parse`], which validates the fields the transfer layer
//! routes and orders by. Payload fields beyond those are carried opaquely
//! and never interpreted.

use crate::error::{Result, XferError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Record type tag marking the start of a deployment.
pub const DEPLOYMENT_TYPE: &str = "deployment";

/// One sample/event produced by a unit.
///
/// `index` is a per-unit, strictly increasing identity. `deployment_index`
/// points at the owning deployment record and is required for every record
/// that is not itself a deployment record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub serial_number: String,
    pub index: u64,
    pub record_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_index: Option<u64>,

    /// Payload fields the transfer layer does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Record {
    /// Decode one line as a record, strictly.
    ///
    /// Rejects anything that is not a JSON object, has a zero index, or is
    /// missing `deploymentIndex` on a non-deployment record. A failure here
    /// is fatal only to the line (sender) or the connection (receiver),
    /// never to the process.
    pub fn parse(line: &str) -> Result<Record> {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') || !trimmed.ends_with('}') {
            return Err(XferError::Record(format!(
                "not a JSON object: {}",
                truncate(trimmed, 50)
            )));
        }
        let record: Record = serde_json::from_str(trimmed)
            .map_err(|e| XferError::Record(format!("{e}: {}", truncate(trimmed, 50))))?;
        if record.index == 0 {
            return Err(XferError::Record("record index must be positive".into()));
        }
        if record.serial_number.is_empty() {
            return Err(XferError::Record("empty serialNumber".into()));
        }
        if !record.is_deployment() && record.deployment_index.is_none() {
            return Err(XferError::Record(format!(
                "record {} has no deploymentIndex",
                record.index
            )));
        }
        Ok(record)
    }

    pub fn is_deployment(&self) -> bool {
        self.record_type == DEPLOYMENT_TYPE
    }

    /// Index of the deployment data file this record belongs in: its own
    /// index for a deployment record, `deploymentIndex` otherwise.
    pub fn deployment_file_index(&self) -> u64 {
        if self.is_deployment() {
            self.index
        } else {
            self.deployment_index.unwrap_or(self.index)
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
