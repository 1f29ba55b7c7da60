use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Args;

use crate::session::SessionConfig;

/// Server options, each overridable through the environment.
#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "SIGNAL_RELAY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Directory of static UI assets served on every path other than the API.
    #[arg(long, env = "SIGNAL_RELAY_STATIC_DIR")]
    pub static_dir: Option<PathBuf>,

    /// Maximum time a forward may wait on a peer's outbound queue or socket.
    #[arg(long, env = "SIGNAL_RELAY_WRITE_TIMEOUT_MS", default_value_t = 5000)]
    pub write_timeout_ms: u64,

    /// Outbound frames buffered per connection.
    #[arg(long, env = "SIGNAL_RELAY_SEND_BUFFER", default_value_t = 64)]
    pub send_buffer: usize,

    /// Largest inbound WebSocket message accepted.
    #[arg(long, env = "SIGNAL_RELAY_MAX_MESSAGE_BYTES", default_value_t = 64 * 1024)]
    pub max_message_bytes: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "SIGNAL_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub static_dir: Option<PathBuf>,
    pub session: SessionConfig,
    pub max_message_size: usize,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            static_dir: None,
            session: SessionConfig::default(),
            max_message_size: 64 * 1024,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl TryFrom<ServerArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        ensure!(args.write_timeout_ms > 0, "write timeout must be greater than zero");
        ensure!(args.send_buffer > 0, "send buffer must hold at least one frame");
        ensure!(args.max_message_bytes > 0, "max message size must be greater than zero");
        if let Some(dir) = &args.static_dir {
            ensure!(dir.is_dir(), "static dir {} is not a directory", dir.display());
        }

        Ok(Self {
            listen_addr,
            static_dir: args.static_dir,
            session: SessionConfig {
                send_buffer: args.send_buffer,
                write_timeout: Duration::from_millis(args.write_timeout_ms),
            },
            max_message_size: args.max_message_bytes,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
