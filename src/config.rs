//! Process configuration for the sender and receiver.
//!
//! Values resolve in two layers: a TOML config file (optional, sy-style
//! `[sender]` / `[receiver]` tables) over built-in defaults, with individual
//! CLI flags applied on top by `main`. Defaults mirror the paths and ports
//! the deployed units are provisioned with.

use crate::error::{Result, XferError};
use crate::protocol::{DEFAULT_PORT, MAX_BATCH_SEND};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_data_root() -> PathBuf {
    PathBuf::from("/usr/local/physsData")
}

fn default_xfer_root() -> PathBuf {
    PathBuf::from("/usr/local/physs/xfer")
}

fn default_serial_file() -> Option<PathBuf> {
    Some(PathBuf::from("/usr/local/physs/serialNumber"))
}

fn default_batch_size() -> usize {
    MAX_BATCH_SEND
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_pacing_secs() -> u64 {
    10
}

fn default_reply_timeout_ms() -> u64 {
    1000
}

fn default_max_connections() -> usize {
    100
}

fn default_idle_timeout_secs() -> u64 {
    30
}

/// Sender process configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SenderConfig {
    /// Receiver host to connect to.
    #[serde(default = "default_host")]
    pub remote_host: String,

    #[serde(default = "default_port")]
    pub remote_port: u16,

    /// Root of the local data files (`<data_root>/sn<serial>/raw/...`).
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Home of the sender cursor and the control sentinel pairs.
    #[serde(default = "default_xfer_root")]
    pub xfer_root: PathBuf,

    /// Unit serial number; when absent it is read from `serial_file`.
    #[serde(default)]
    pub serial_number: Option<String>,

    #[serde(default = "default_serial_file")]
    pub serial_file: Option<PathBuf>,

    /// Records per batch, at most 20.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Control-flag polling and idle-cycle interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Delay between batch attempts while enabled.
    #[serde(default = "default_pacing_secs")]
    pub pacing_secs: u64,

    /// How long to wait for the single reply line.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            remote_host: default_host(),
            remote_port: default_port(),
            data_root: default_data_root(),
            xfer_root: default_xfer_root(),
            serial_number: None,
            serial_file: default_serial_file(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            pacing_secs: default_pacing_secs(),
            reply_timeout_ms: default_reply_timeout_ms(),
        }
    }
}

impl SenderConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SEND {
            return Err(XferError::Config(format!(
                "batch_size must be in 1..={MAX_BATCH_SEND}, got {}",
                self.batch_size
            )));
        }
        Ok(())
    }

    /// The unit's serial number: inline value first, serial file second.
    pub fn resolve_serial(&self) -> Result<String> {
        if let Some(serial) = &self.serial_number {
            if serial.is_empty() {
                return Err(XferError::Config("serial number is empty".into()));
            }
            return Ok(serial.clone());
        }
        match &self.serial_file {
            Some(path) => crate::datafile::read_serial_file(path),
            None => Err(XferError::Config(
                "no serial number or serial file configured".into(),
            )),
        }
    }
}

/// Receiver process configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiverConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_port")]
    pub listen_port: u16,

    /// Root of the destination data files.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,

    /// Cap on concurrently handled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Per-read idle timeout for a connected peer.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_port(),
            data_root: default_data_root(),
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl ReceiverConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(XferError::Config("max_connections must be positive".into()));
        }
        Ok(())
    }
}

/// Top-level config file with one table per process.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| XferError::Config(format!("{}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_match_deployed_units() {
        let cfg = SenderConfig::default();
        assert_eq!(cfg.remote_port, 28109);
        assert_eq!(cfg.batch_size, 20);
        assert_eq!(cfg.pacing_secs, 10);
        assert_eq!(cfg.poll_interval_ms, 1000);
        assert_eq!(cfg.reply_timeout_ms, 1000);

        let cfg = ReceiverConfig::default();
        assert_eq!(cfg.listen_port, 28109);
        assert_eq!(cfg.max_connections, 100);
        assert_eq!(cfg.idle_timeout_secs, 30);
    }

    #[test]
    fn test_load_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[sender]
remote_host = "coolcloud.example.org"
serial_number = "17"

[receiver]
listen_port = 28209
"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.sender.remote_host, "coolcloud.example.org");
        assert_eq!(cfg.sender.remote_port, 28109);
        assert_eq!(cfg.receiver.listen_port, 28209);
        assert_eq!(cfg.sender.resolve_serial().unwrap(), "17");
    }

    #[test]
    fn test_load_rejects_unknown_keys() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[sender]\nremote_hots = \"typo\"").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_validate_batch_size_bound() {
        let cfg = SenderConfig {
            batch_size: 21,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = SenderConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_resolve_serial_prefers_inline_value() {
        let cfg = SenderConfig {
            serial_number: Some("42".into()),
            ..Default::default()
        };
        assert_eq!(cfg.resolve_serial().unwrap(), "42");
    }
}
