use std::time::Duration;

use axum::extract::ws::Message;
use metrics::counter;
use thiserror::Error;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};

use crate::protocol::{self, Envelope, PeerId, SignalKind};
use crate::registry::{PeerHandle, Registry};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingError {
    #[error("peer {0} is not online")]
    TargetOffline(PeerId),
    #[error("peer {peer} could not be written to ({reason})")]
    StaleHandle { peer: PeerId, reason: StaleReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// The target's writer has gone away.
    Closed,
    /// The target's queue stayed full for the whole write timeout.
    TimedOut,
}

impl std::fmt::Display for StaleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StaleReason::Closed => f.write_str("connection closed"),
            StaleReason::TimedOut => f.write_str("write timed out"),
        }
    }
}

impl RoutingError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RoutingError::TargetOffline(_) => "target_offline",
            RoutingError::StaleHandle {
                reason: StaleReason::Closed,
                ..
            } => "stale_closed",
            RoutingError::StaleHandle {
                reason: StaleReason::TimedOut,
                ..
            } => "stale_timeout",
        }
    }
}

#[derive(Debug)]
pub enum RouteOutcome {
    /// The sender now owns `peer`. `superseded` is the other connection that
    /// held the identifier before, if any.
    Registered {
        peer: PeerId,
        superseded: Option<PeerHandle>,
    },
    Forwarded { to: PeerId },
}

/// Per-kind dispatch of signaling envelopes over the registry.
#[derive(Clone)]
pub struct SignalRouter {
    registry: Registry,
    write_timeout: Duration,
}

impl SignalRouter {
    pub fn new(registry: Registry, write_timeout: Duration) -> Self {
        Self {
            registry,
            write_timeout,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn route(
        &self,
        envelope: Envelope,
        origin: &PeerHandle,
    ) -> Result<RouteOutcome, RoutingError> {
        match envelope.kind {
            SignalKind::Register => {
                let superseded = self.registry.register(&envelope.from, origin.clone());
                Ok(RouteOutcome::Registered {
                    peer: envelope.from,
                    superseded,
                })
            }
            SignalKind::Offer | SignalKind::Answer | SignalKind::Ice => {
                self.forward(envelope).await
            }
        }
    }

    async fn forward(&self, envelope: Envelope) -> Result<RouteOutcome, RoutingError> {
        let to = envelope.target().to_string();
        let Some(target) = self.registry.lookup(&to) else {
            debug!(from = %envelope.from, to = %to, kind = %envelope.kind, "target offline");
            return Err(RoutingError::TargetOffline(to));
        };

        let frame = Message::Text(protocol::encode(&envelope));
        match target.sender().send_timeout(frame, self.write_timeout).await {
            Ok(()) => {
                counter!(
                    "signal_relay_messages_forwarded_total",
                    1,
                    "kind" => envelope.kind.as_str()
                );
                debug!(from = %envelope.from, to = %to, kind = %envelope.kind, "forwarded");
                Ok(RouteOutcome::Forwarded { to })
            }
            Err(err) => {
                let reason = match err {
                    SendTimeoutError::Closed(_) => StaleReason::Closed,
                    SendTimeoutError::Timeout(_) => StaleReason::TimedOut,
                };
                if self
                    .registry
                    .remove_if_current(&to, target.connection_id())
                {
                    warn!(
                        peer = %to,
                        connection_id = %target.connection_id(),
                        %reason,
                        "dropped stale registry entry"
                    );
                }
                Err(RoutingError::StaleHandle { peer: to, reason })
            }
        }
    }
}
