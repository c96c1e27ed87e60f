//! Batch receiver: accepts connections, validates each batch as an atomic
//! unit, persists it idempotently, and replies.
//!
//! Every accepted connection is handled by its own task with its own
//! context; the only state shared across tasks is the filesystem (data
//! files and checkpoints, keyed by unit) plus a per-unit commit mutex. The
//! sender guarantees at most one in-flight batch per unit; the mutex makes
//! that safe even against a duplicated or misbehaving sender.

use crate::config::ReceiverConfig;
use crate::datafile::RecordStore;
use crate::protocol::{read_line_limited, write_reply, BatchHeader, Reply, MAX_LINE_LEN};
use crate::record::Record;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// One fully validated in-flight batch.
#[derive(Debug)]
struct Batch {
    header: BatchHeader,
    serial: String,
    records: Vec<(Record, String)>,
}

/// Commit locks keyed by unit serial number.
#[derive(Default)]
struct UnitLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl UnitLocks {
    async fn for_unit(&self, serial: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().await;
        map.entry(serial.to_string()).or_default().clone()
    }
}

pub struct Receiver {
    config: ReceiverConfig,
    store: RecordStore,
    locks: Arc<UnitLocks>,
}

impl Receiver {
    pub fn new(config: ReceiverConfig) -> Result<Self> {
        config.validate()?;
        let store = RecordStore::new(&config.data_root);
        Ok(Self {
            config,
            store,
            locks: Arc::new(UnitLocks::default()),
        })
    }

    /// Bind the listening socket. Split from [`Receiver::serve`] so callers
    /// (and tests) can learn the bound address before serving.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = (self.config.listen_addr.as_str(), self.config.listen_port);
        TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {}:{}", self.config.listen_addr, self.config.listen_port))
    }

    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        info!(addr = %listener.local_addr()?, "transfer receiver listening");
        self.serve(listener).await
    }

    /// Accept loop: one task per connection, bounded by `max_connections`.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.config.max_connections));
        loop {
            let (stream, peer) = listener.accept().await.context("accepting connection")?;
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .expect("connection semaphore is never closed");
            let store = self.store.clone();
            let locks = self.locks.clone();
            let idle = self.config.idle_timeout();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, store, locks, idle).await {
                    debug!(%peer, "connection ended with error: {e:#}");
                }
                drop(permit);
            });
        }
    }
}

/// Per-connection state machine: header, then records, then one terminal
/// reply. Validation failure at any point discards the whole batch.
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    store: RecordStore,
    locks: Arc<UnitLocks>,
    idle: Duration,
) -> Result<()> {
    let (read_half, mut write_half) = stream.split();
    let mut reader = BufReader::new(read_half);

    let batch = match receive_batch(&mut reader, idle).await {
        Ok(batch) => batch,
        Err(e) => {
            warn!(%peer, "rejecting batch: {e:#}");
            write_reply(&mut write_half, Reply::Nack).await?;
            return Ok(());
        }
    };

    let lock = locks.for_unit(&batch.serial).await;
    let _guard = lock.lock().await;
    let reply = match store
        .commit(&batch.serial, batch.header.last, &batch.records)
        .await
    {
        Ok(outcome) => {
            debug!(
                %peer,
                serial = %batch.serial,
                first = batch.header.first,
                last = batch.header.last,
                ?outcome,
                "batch committed"
            );
            Reply::Ack
        }
        Err(e) => {
            warn!(%peer, serial = %batch.serial, "commit failed: {e}");
            Reply::Nack
        }
    };
    write_reply(&mut write_half, reply).await
}

/// Read and validate one batch off the wire. Any violation aborts the
/// whole connection; partial batches are never surfaced.
async fn receive_batch<R: AsyncBufRead + Unpin>(reader: &mut R, idle: Duration) -> Result<Batch> {
    let header_line = read_line_idle(reader, idle)
        .await?
        .context("connection closed before header")?;
    let header = BatchHeader::parse(&header_line)?;

    let mut serial: Option<String> = None;
    let mut records: Vec<(Record, String)> = Vec::with_capacity(header.count);
    while records.len() < header.count {
        let line = read_line_idle(reader, idle)
            .await?
            .with_context(|| format!("connection closed after {} of {} records", records.len(), header.count))?;
        let record = Record::parse(&line)?;
        if record.index < header.first || record.index > header.last {
            anyhow::bail!(
                "record index {} outside batch range {}..={}",
                record.index,
                header.first,
                header.last
            );
        }
        match &serial {
            None => {
                if record.index != header.first {
                    anyhow::bail!(
                        "first record index {} does not match header first {}",
                        record.index,
                        header.first
                    );
                }
                serial = Some(record.serial_number.clone());
            }
            Some(expected) => {
                if record.serial_number != *expected {
                    anyhow::bail!(
                        "serial number {} differs from batch serial {}",
                        record.serial_number,
                        expected
                    );
                }
            }
        }
        records.push((record, line));
    }

    Ok(Batch {
        header,
        serial: serial.expect("count is at least 1"),
        records,
    })
}

async fn read_line_idle<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    idle: Duration,
) -> Result<Option<String>> {
    timeout(idle, read_line_limited(reader, MAX_LINE_LEN))
        .await
        .context("idle timeout while awaiting peer")?
}
