//! Batch sender: the unit-side control loop.
//!
//! Tails the unit's growing data files and forwards not-yet-delivered
//! records to the central receiver, one bounded batch per TCP connection,
//! committing the reader and the durable cursor only on acknowledgement.
//! Every failure is absorbed within the cycle; the loop never exits on bad
//! data or a bad peer.

use crate::config::SenderConfig;
use crate::control::ControlSignal;
use crate::cursor::Checkpoint;
use crate::datafile::{find_data_file, next_deployment_start};
use crate::protocol::{read_line_limited, BatchHeader, Reply, MAX_LINE_LEN};
use crate::record::Record;
use crate::tail::{OpenStatus, TailReader};
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

/// Sender cursor file name under the transfer root.
const SENDER_CURSOR_FILE: &str = "nextRecord";

/// What a batch attempt concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    /// Nothing to do; wait out the pacing delay.
    Idle,
    /// A batch went out (acked or not); wait out the pacing delay.
    Sent,
    /// Progress was made without transmitting; retry without pacing.
    Retry,
}

pub struct Sender {
    config: SenderConfig,
    serial: String,
    reader: TailReader,
    control: ControlSignal,
    cursor: Checkpoint,
    enabled: bool,
    pause_until: Option<Instant>,
}

impl Sender {
    pub fn new(config: SenderConfig, serial: String) -> Result<Self> {
        config.validate()?;
        let control = ControlSignal::new(&config.xfer_root);
        control.init().context("initializing control files")?;
        let cursor = Checkpoint::at(config.xfer_root.join(SENDER_CURSOR_FILE));
        Ok(Self {
            config,
            serial,
            reader: TailReader::new(),
            control,
            cursor,
            enabled: false,
            pause_until: None,
        })
    }

    /// Drive the transfer loop until the task is cancelled.
    ///
    /// This is the single logical control flow of the sender: at most one
    /// batch is ever in flight for this unit, which is what lets the
    /// receiver commit without coordinating across connections.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            serial = %self.serial,
            remote = %self.config.remote_host,
            port = self.config.remote_port,
            "sender started"
        );
        loop {
            self.cycle().await;
            sleep(self.config.poll_interval()).await;
        }
    }

    /// One polling cycle: mirror the control flag, then attempt at most one
    /// batch if enabled and not pacing.
    async fn cycle(&mut self) {
        let requested = self.control.requested();
        if requested != self.enabled {
            self.enabled = requested;
            if let Err(e) = self.control.acknowledge(requested) {
                warn!("failed to acknowledge control change: {e}");
            }
            if requested {
                self.pause_until = None;
                self.reader.reset();
                info!("transfer enabled");
            } else {
                info!("transfer disabled");
            }
        }
        if !self.enabled {
            return;
        }
        if let Some(until) = self.pause_until {
            if Instant::now() < until {
                return;
            }
        }
        self.pause_until = Some(Instant::now() + Duration::from_secs(self.config.pacing_secs));

        match self.attempt_batch().await {
            Ok(Attempt::Retry) => self.pause_until = None,
            Ok(_) => {}
            Err(e) => warn!("batch attempt abandoned: {e:#}"),
        }
    }

    /// Locate the next undelivered records, form one batch, transmit it,
    /// and commit on acknowledgement.
    async fn attempt_batch(&mut self) -> Result<Attempt> {
        let cursor = self.cursor.load().context("loading sender cursor")?;

        let Some(path) = find_data_file(&self.config.data_root, &self.serial, cursor)? else {
            return Ok(Attempt::Idle);
        };
        match self.reader.open(&path).await {
            Ok(OpenStatus::Opened) => {}
            Ok(OpenStatus::Unchanged) => return Ok(Attempt::Idle),
            Err(e) => {
                return Err(e).with_context(|| format!("opening {}", path.display()));
            }
        }
        let lines = self.reader.read_lines(self.config.batch_size).await?;
        self.reader.close();

        if lines.is_empty() {
            // the selected file is exhausted; cross into the next
            // deployment's file when one exists
            if let Some(start) = next_deployment_start(&self.config.data_root, &self.serial, cursor)?
            {
                self.cursor.store(start).context("advancing sender cursor")?;
                info!(from = cursor, to = start, "crossed deployment boundary");
                return Ok(Attempt::Retry);
            }
            return Ok(Attempt::Idle);
        }

        let mut records: Vec<(Record, String)> = Vec::new();
        for line in lines {
            if line.len() > MAX_LINE_LEN {
                debug!(len = line.len(), "dropping oversized line");
                continue;
            }
            match Record::parse(&line) {
                Ok(rec) if rec.index >= cursor => records.push((rec, line)),
                Ok(rec) => debug!(index = rec.index, "dropping already-delivered record"),
                Err(e) => debug!("dropping line: {e}"),
            }
        }
        if records.is_empty() {
            // everything read was stale or malformed: commit past it so
            // acknowledged-but-filtered content never stalls progress
            self.reader.advance();
            return Ok(Attempt::Retry);
        }

        let header = BatchHeader {
            first: records[0].0.index,
            last: records[records.len() - 1].0.index,
            count: records.len(),
        };
        match self.transmit(&header, &records).await {
            Ok(Reply::Ack) => {
                self.reader.advance();
                self.cursor
                    .store(header.last + 1)
                    .context("persisting sender cursor")?;
                info!(
                    first = header.first,
                    last = header.last,
                    count = header.count,
                    "batch acknowledged"
                );
            }
            Ok(Reply::Nack) => {
                warn!(first = header.first, last = header.last, "batch rejected, will retry");
            }
            Err(e) => {
                warn!("no acknowledgement, will retry: {e:#}");
            }
        }
        Ok(Attempt::Sent)
    }

    /// One connection per batch: header and record lines out, write side
    /// half-closed, then a single bounded wait for the reply line.
    async fn transmit(&self, header: &BatchHeader, records: &[(Record, String)]) -> Result<Reply> {
        let addr = (self.config.remote_host.as_str(), self.config.remote_port);
        let mut stream = TcpStream::connect(addr)
            .await
            .context("connecting to receiver")?;

        let mut payload = header.encode();
        for (_, line) in records {
            payload.push_str(line);
            payload.push('\n');
        }

        let (read_half, mut write_half) = stream.split();
        write_half
            .write_all(payload.as_bytes())
            .await
            .context("writing batch")?;
        write_half.shutdown().await.context("half-closing connection")?;

        let mut reader = BufReader::new(read_half);
        let line = timeout(
            self.config.reply_timeout(),
            read_line_limited(&mut reader, MAX_LINE_LEN),
        )
        .await
        .context("timed out waiting for reply")??
        .context("connection closed without reply")?;

        Reply::parse(&line).with_context(|| format!("unexpected reply {line:?}"))
    }
}
