use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::protocol::{self, DecodeError, Envelope, PeerId, SignalKind};
use crate::registry::PeerHandle;
use crate::router::{RouteOutcome, RoutingError, SignalRouter};

/// Close code sent to a connection whose identifier was claimed by another.
pub const CLOSE_SUPERSEDED: u16 = 4000;

const DEFAULT_SEND_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Depth of each connection's outbound queue.
    pub send_buffer: usize,
    /// Upper bound on a single forward into a peer's queue and on a single
    /// socket write.
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            send_buffer: DEFAULT_SEND_BUFFER,
            write_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registered(PeerId),
    Terminated,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{kind} received before register")]
    NotRegistered { kind: SignalKind },
    #[error("envelope from {claimed} on a connection registered as {bound}")]
    SenderMismatch { claimed: PeerId, bound: PeerId },
    #[error("identifier {peer} was taken over by another connection")]
    Superseded { peer: PeerId },
    #[error("session already terminated")]
    Terminated,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    Close,
}

/// Signaling state of one connection.
///
/// The registry entry claimed through this session is released exactly once:
/// by [`ConnectionSession::terminate`], or on drop if terminate never ran.
pub struct ConnectionSession {
    handle: PeerHandle,
    router: SignalRouter,
    state: SessionState,
}

impl ConnectionSession {
    pub fn new(router: SignalRouter, handle: PeerHandle) -> Self {
        Self {
            handle,
            router,
            state: SessionState::Unregistered,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn peer_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Registered(id) => Some(id),
            _ => None,
        }
    }

    /// Process one transport frame. Problems with the frame are logged and
    /// swallowed; only a close frame ends the session.
    pub async fn handle_frame(&mut self, frame: Message) -> FrameAction {
        let result = match frame {
            Message::Text(text) => self.handle_bytes(text.as_bytes()).await,
            Message::Binary(data) => self.handle_bytes(&data).await,
            Message::Close(frame) => {
                debug!(
                    connection_id = %self.handle.connection_id(),
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                return FrameAction::Close;
            }
            Message::Ping(_) | Message::Pong(_) => return FrameAction::Continue,
        };

        if let Err(err) = result {
            self.report(&err);
        }
        FrameAction::Continue
    }

    async fn handle_bytes(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        let envelope = protocol::decode(bytes)?;
        self.handle_envelope(envelope).await
    }

    pub async fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), SessionError> {
        if self.state == SessionState::Terminated {
            return Err(SessionError::Terminated);
        }
        if envelope.kind == SignalKind::Register {
            return self.register(envelope).await;
        }

        let SessionState::Registered(bound) = &self.state else {
            return Err(SessionError::NotRegistered {
                kind: envelope.kind,
            });
        };
        if *bound != envelope.from {
            return Err(SessionError::SenderMismatch {
                claimed: envelope.from,
                bound: bound.clone(),
            });
        }
        let owner = self.router.registry().lookup(bound).map(|h| h.connection_id());
        if owner != Some(self.handle.connection_id()) {
            let peer = bound.clone();
            self.state = SessionState::Unregistered;
            return Err(SessionError::Superseded { peer });
        }

        self.router.route(envelope, &self.handle).await?;
        Ok(())
    }

    async fn register(&mut self, envelope: Envelope) -> Result<(), SessionError> {
        let RouteOutcome::Registered { peer, superseded } =
            self.router.route(envelope, &self.handle).await?
        else {
            return Ok(());
        };

        let connection_id = self.handle.connection_id();
        if let SessionState::Registered(previous) = &self.state {
            if *previous != peer {
                self.router
                    .registry()
                    .remove_if_current(previous, connection_id);
                info!(%connection_id, from = %previous, to = %peer, "peer changed identity");
            }
        }

        if let Some(old) = superseded {
            counter!("signal_relay_takeovers_total", 1);
            warn!(
                peer = %peer,
                connection_id = %connection_id,
                superseded_connection = %old.connection_id(),
                "identifier taken over by a new connection"
            );
            let close = Message::Close(Some(CloseFrame {
                code: CLOSE_SUPERSEDED,
                reason: Cow::Borrowed("superseded"),
            }));
            if let Err(err) = old.sender().try_send(close) {
                warn!(
                    peer = %peer,
                    superseded_connection = %old.connection_id(),
                    error = %err,
                    "could not queue close for superseded connection"
                );
            }
        }

        info!(peer = %peer, %connection_id, "peer registered");
        self.state = SessionState::Registered(peer);
        Ok(())
    }

    /// Release this connection's registry entry and stop processing.
    /// Calling it again is a no-op.
    pub fn terminate(&mut self) {
        let state = std::mem::replace(&mut self.state, SessionState::Terminated);
        if let SessionState::Registered(peer) = state {
            let registry = self.router.registry();
            if registry.remove_if_current(&peer, self.handle.connection_id()) {
                info!(peer = %peer, connection_id = %self.handle.connection_id(), "peer disconnected");
            }
        }
    }

    fn report(&self, err: &SessionError) {
        let connection_id = self.handle.connection_id();
        let peer = self.peer_id().unwrap_or("-");
        match err {
            SessionError::Decode(decode) => {
                counter!(
                    "signal_relay_decode_failures_total",
                    1,
                    "reason" => decode.metric_label()
                );
                warn!(%connection_id, peer, error = %decode, "dropping undecodable frame");
            }
            SessionError::Routing(routing) => {
                counter!(
                    "signal_relay_routing_failures_total",
                    1,
                    "reason" => routing.metric_label()
                );
                match routing {
                    RoutingError::TargetOffline(_) => {
                        info!(%connection_id, peer, error = %routing, "message not delivered")
                    }
                    RoutingError::StaleHandle { .. } => {
                        warn!(%connection_id, peer, error = %routing, "message not delivered")
                    }
                }
            }
            other => warn!(%connection_id, peer, error = %other, "rejected envelope"),
        }
    }
}

impl Drop for ConnectionSession {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Drive one accepted WebSocket until either side goes away.
pub async fn run(
    socket: WebSocket,
    router: SignalRouter,
    config: SessionConfig,
    remote_addr: Option<SocketAddr>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (handle, mut rx) = PeerHandle::channel(config.send_buffer);
    let connection_id = handle.connection_id();

    counter!("signal_relay_connections_total", 1);
    info!(%connection_id, remote_addr = ?remote_addr, "signaling connection opened");

    let write_timeout = config.write_timeout;
    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            match timeout(write_timeout, ws_tx.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(%connection_id, error = %err, "websocket write failed");
                    break;
                }
                Err(_) => {
                    warn!(%connection_id, "websocket write timed out");
                    break;
                }
            }
            if closing {
                break;
            }
        }
        debug!(%connection_id, "writer task finished");
    });

    let mut session = ConnectionSession::new(router, handle);
    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(frame)) => {
                    if session.handle_frame(frame).await == FrameAction::Close {
                        break;
                    }
                }
                Some(Err(err)) => {
                    warn!(%connection_id, error = %err, "error receiving message");
                    break;
                }
                None => break,
            },
            _ = &mut writer => {
                debug!(%connection_id, "writer ended; closing session");
                break;
            }
        }
    }

    // Release the registry entry before the writer goes away so nobody routes
    // into a dead queue.
    session.terminate();
    drop(session);
    writer.abort();

    info!(%connection_id, "signaling connection closed");
}
