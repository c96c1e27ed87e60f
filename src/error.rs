//! Error types for the transfer subsystem.
//!
//! Leaf modules (tail, cursor, control, record, datafile, protocol parsing)
//! return `XferError`; the sender cycle and receiver connection handlers wrap
//! these in `anyhow` with context and absorb them at the cycle/connection
//! boundary.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("malformed record: {0}")]
    Record(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, XferError>;
