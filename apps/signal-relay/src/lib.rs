//! WebRTC signaling relay: peers register an identifier over a WebSocket and
//! exchange offers, answers and ICE candidates addressed by that identifier.

pub mod config;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;

pub use protocol::{decode, encode, DecodeError, Envelope, PeerId, SignalKind};
pub use registry::{PeerHandle, Registry};
pub use router::{RouteOutcome, RoutingError, SignalRouter};
pub use session::{ConnectionSession, SessionConfig, SessionState};
