use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use signal_relay::config::ServerArgs;
use signal_relay::protocol::{self, Envelope, SignalKind};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "signal-relay", version)]
#[command(about = "WebRTC signaling relay and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub server: ServerArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay (default when no command is given)
    Serve,

    /// Register as a peer and print every envelope routed to it
    Watch {
        /// Signaling socket URL
        #[arg(short, long, default_value = "ws://localhost:8080/ws")]
        url: String,

        /// Identifier to register as
        #[arg(long)]
        id: String,
    },

    /// Register as a peer, send one envelope and disconnect
    Send {
        /// Signaling socket URL
        #[arg(short, long, default_value = "ws://localhost:8080/ws")]
        url: String,

        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        /// offer, answer or ice
        #[arg(long)]
        kind: SignalKind,

        /// Session description or candidate, passed through untouched
        #[arg(long, default_value = "")]
        payload: String,
    },
}

async fn connect(url: &str) -> Result<ClientSocket> {
    debug!("connecting to {}", url);
    match timeout(CONNECT_TIMEOUT, connect_async(url)).await {
        Ok(Ok((socket, _))) => Ok(socket),
        Ok(Err(e)) => Err(anyhow!("connection to {} failed: {}", url, e)),
        Err(_) => Err(anyhow!("timed out connecting to {}", url)),
    }
}

async fn send_envelope(socket: &mut ClientSocket, envelope: &Envelope) -> Result<()> {
    socket
        .send(Message::Text(protocol::encode(envelope).into()))
        .await
        .with_context(|| format!("failed to send {} envelope", envelope.kind))
}

pub async fn run_watch(url: String, id: String) -> Result<()> {
    let mut socket = connect(&url).await?;
    send_envelope(&mut socket, &Envelope::register(id.as_str())).await?;
    println!("registered as {id}; waiting for signals (Ctrl+C to stop)");

    while let Some(frame) = socket.next().await {
        match frame.context("websocket error")? {
            Message::Text(text) => match protocol::decode_text(text.as_str()) {
                Ok(envelope) => println!(
                    "{:<8} {} -> {}: {}",
                    envelope.kind,
                    envelope.from,
                    envelope.target(),
                    envelope.payload.as_deref().unwrap_or_default()
                ),
                Err(e) => warn!("undecodable frame: {}", e),
            },
            Message::Close(frame) => {
                println!("relay closed the connection: {:?}", frame);
                break;
            }
            _ => {}
        }
    }

    Ok(())
}

pub async fn run_send(
    url: String,
    from: String,
    to: String,
    kind: SignalKind,
    payload: String,
) -> Result<()> {
    if !kind.is_routed() {
        bail!("`send` forwards offer, answer or ice; use `watch` to register");
    }

    let mut socket = connect(&url).await?;
    send_envelope(&mut socket, &Envelope::register(from.as_str())).await?;
    let envelope = Envelope::routed(kind, from, to, payload);
    send_envelope(&mut socket, &envelope).await?;
    socket.close(None).await.context("failed to close websocket")?;

    println!("sent {} from {} to {}", envelope.kind, envelope.from, envelope.target());
    Ok(())
}
