use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use xfer::{Config, Receiver, Sender};

#[derive(Parser)]
#[command(name = "xfer", version, about = "Resumable record transfer between sensor units and a central receiver")]
struct Cli {
    /// TOML config file with [sender] and [receiver] tables.
    #[arg(long, global = true, env = "XFER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the unit-side sender.
    Send {
        /// Receiver host.
        #[arg(long, env = "XFER_REMOTE_HOST")]
        remote_host: Option<String>,

        /// Receiver port.
        #[arg(long, env = "XFER_REMOTE_PORT")]
        remote_port: Option<u16>,

        /// Root of the local data files.
        #[arg(long)]
        data_root: Option<PathBuf>,

        /// Home of the sender cursor and control files.
        #[arg(long)]
        xfer_root: Option<PathBuf>,

        /// Unit serial number (overrides the serial file).
        #[arg(long)]
        serial: Option<String>,

        /// File holding the unit serial number.
        #[arg(long)]
        serial_file: Option<PathBuf>,
    },
    /// Run the central receiver.
    Recv {
        /// Address to listen on.
        #[arg(long, env = "XFER_LISTEN_ADDR")]
        listen_addr: Option<String>,

        /// Port to listen on.
        #[arg(long, env = "XFER_LISTEN_PORT")]
        listen_port: Option<u16>,

        /// Root of the destination data files.
        #[arg(long)]
        data_root: Option<PathBuf>,

        /// Cap on concurrently handled connections.
        #[arg(long)]
        max_connections: Option<usize>,

        /// Per-read idle timeout for a connected peer.
        #[arg(long)]
        idle_timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Command::Send {
            remote_host,
            remote_port,
            data_root,
            xfer_root,
            serial,
            serial_file,
        } => {
            let cfg = &mut config.sender;
            if let Some(v) = remote_host {
                cfg.remote_host = v;
            }
            if let Some(v) = remote_port {
                cfg.remote_port = v;
            }
            if let Some(v) = data_root {
                cfg.data_root = v;
            }
            if let Some(v) = xfer_root {
                cfg.xfer_root = v;
            }
            if let Some(v) = serial {
                cfg.serial_number = Some(v);
            }
            if let Some(v) = serial_file {
                cfg.serial_file = Some(v);
            }

            let serial = cfg.resolve_serial()?;
            let mut sender = Sender::new(config.sender, serial)?;
            tokio::select! {
                res = sender.run() => res,
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, shutting down");
                    Ok(())
                }
            }
        }
        Command::Recv {
            listen_addr,
            listen_port,
            data_root,
            max_connections,
            idle_timeout_secs,
        } => {
            let cfg = &mut config.receiver;
            if let Some(v) = listen_addr {
                cfg.listen_addr = v;
            }
            if let Some(v) = listen_port {
                cfg.listen_port = v;
            }
            if let Some(v) = data_root {
                cfg.data_root = v;
            }
            if let Some(v) = max_connections {
                cfg.max_connections = v;
            }
            if let Some(v) = idle_timeout_secs {
                cfg.idle_timeout_secs = v;
            }

            let receiver = Receiver::new(config.receiver)?;
            tokio::select! {
                res = receiver.run() => res,
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted, shutting down");
                    Ok(())
                }
            }
        }
    }
}
