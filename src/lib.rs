//! Resumable record transfer between field sensor units and a central
//! receiver.
//!
//! Each unit runs a [`Sender`] that tails its growing data files and
//! forwards not-yet-delivered records over an unreliable network; the
//! central [`Receiver`] durably and idempotently persists them. Both sides
//! keep their own filesystem-resident [`Checkpoint`] and agree only through
//! the ack/nack wire protocol, so crashes, dropped connections and
//! duplicate delivery lose nothing and duplicate nothing.
//!
//! ```text
//! data files -> TailReader -> Sender --TCP--> Receiver -> RecordStore
//!                  |             |                            |
//!                  +-- advance --+-- cursor          cursor --+
//! ```

pub mod config;
pub mod control;
pub mod cursor;
pub mod datafile;
pub mod error;
pub mod protocol;
pub mod receiver;
pub mod record;
pub mod sender;
pub mod tail;

pub use config::{Config, ReceiverConfig, SenderConfig};
pub use control::ControlSignal;
pub use cursor::Checkpoint;
pub use datafile::{CommitOutcome, RecordStore};
pub use error::{Result, XferError};
pub use protocol::{
    BatchHeader, Reply, DEFAULT_PORT, MAX_BATCH_ACCEPT, MAX_BATCH_SEND, MAX_LINE_LEN,
};
pub use receiver::Receiver;
pub use record::Record;
pub use sender::Sender;
pub use tail::{OpenStatus, TailReader};
