//! Filesystem control signal between the operator console and the sender.
//!
//! Two sentinel pairs live in the transfer root. The console owns the
//! request pair (`ON`/`OFF`) and toggles it by renaming one member to the
//! other's name. The sender owns the ack pair (`on`/`off`) and mirrors the
//! request into it once it has acted, one polling cycle later, so the
//! console can see the handshake complete.

use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

const REQUEST_ON: &str = "ON";
const ACK_ON: &str = "on";
const ACK_OFF: &str = "off";

#[derive(Debug, Clone)]
pub struct ControlSignal {
    dir: PathBuf,
}

impl ControlSignal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Normalize the ack pair at startup: whatever state was left behind,
    /// the sender restarts disabled, so the ack file becomes `off`.
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let on = self.dir.join(ACK_ON);
        let off = self.dir.join(ACK_OFF);
        if on.is_file() {
            fs::rename(&on, &off)?;
        } else if !off.is_file() {
            fs::write(&off, "xfer control file\n")?;
        }
        Ok(())
    }

    /// Whether the console currently requests transfer to run.
    pub fn requested(&self) -> bool {
        self.dir.join(REQUEST_ON).is_file()
    }

    /// Record in the ack pair that the sender has acted on a request.
    pub fn acknowledge(&self, enabled: bool) -> Result<()> {
        let (from, to) = if enabled {
            (ACK_OFF, ACK_ON)
        } else {
            (ACK_ON, ACK_OFF)
        };
        let from = self.dir.join(from);
        if from.is_file() {
            fs::rename(from, self.dir.join(to))?;
        } else {
            // ack file went missing out of band; recreate in the new state
            fs::write(self.dir.join(to), "xfer control file\n")?;
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
