use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier a participant claims with a `register` envelope.
pub type PeerId = String;

/// Wire name older browser clients use for an offer.
const LEGACY_CALL: &str = "call";

/// The closed set of signaling envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Claim an identifier for the sending connection
    Register,
    /// Session description proposing a call
    Offer,
    /// Session description accepting a call
    Answer,
    /// Trickled ICE candidate
    Ice,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Register => "register",
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Ice => "ice",
        }
    }

    /// Kinds that are forwarded to another peer and therefore need a `to`.
    pub fn is_routed(&self) -> bool {
        !matches!(self, SignalKind::Register)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "register" => Ok(SignalKind::Register),
            // Older browser clients still send `call` for the offer.
            "offer" | LEGACY_CALL => Ok(SignalKind::Offer),
            "answer" => Ok(SignalKind::Answer),
            "ice" => Ok(SignalKind::Ice),
            other => Err(DecodeError::UnknownKind(other.to_string())),
        }
    }
}

/// A validated signaling message.
///
/// `to` is always `Some` for routed kinds and `None` for `register`. The
/// payload is opaque to the relay and is forwarded as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: SignalKind,
    pub from: PeerId,
    pub to: Option<PeerId>,
    pub payload: Option<String>,
    /// Offer that arrived spelled `call`; it is re-encoded the same way so
    /// clients that only understand `call` still receive it.
    pub legacy_call: bool,
}

impl Envelope {
    pub fn register(from: impl Into<PeerId>) -> Self {
        Self {
            kind: SignalKind::Register,
            from: from.into(),
            to: None,
            payload: None,
            legacy_call: false,
        }
    }

    pub fn offer(from: impl Into<PeerId>, to: impl Into<PeerId>, sdp: impl Into<String>) -> Self {
        Self::routed(SignalKind::Offer, from, to, sdp)
    }

    /// Offer in the older `call` spelling.
    pub fn call(from: impl Into<PeerId>, to: impl Into<PeerId>, sdp: impl Into<String>) -> Self {
        Self {
            legacy_call: true,
            ..Self::offer(from, to, sdp)
        }
    }

    pub fn answer(from: impl Into<PeerId>, to: impl Into<PeerId>, sdp: impl Into<String>) -> Self {
        Self::routed(SignalKind::Answer, from, to, sdp)
    }

    pub fn ice(
        from: impl Into<PeerId>,
        to: impl Into<PeerId>,
        candidate: impl Into<String>,
    ) -> Self {
        Self::routed(SignalKind::Ice, from, to, candidate)
    }

    /// Build a routed envelope of an arbitrary kind. A `register` kind
    /// collapses to [`Envelope::register`].
    pub fn routed(
        kind: SignalKind,
        from: impl Into<PeerId>,
        to: impl Into<PeerId>,
        payload: impl Into<String>,
    ) -> Self {
        if !kind.is_routed() {
            return Self::register(from);
        }
        Self {
            kind,
            from: from.into(),
            to: Some(to.into()),
            payload: Some(payload.into()),
            legacy_call: false,
        }
    }

    /// Recipient of a routed envelope; empty for `register`.
    pub fn target(&self) -> &str {
        self.to.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not UTF-8: {0}")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope has no `type`")]
    MissingKind,
    #[error("unknown envelope type `{0}`")]
    UnknownKind(String),
    #[error("{kind} envelope is missing `{field}`")]
    MissingField {
        kind: SignalKind,
        field: &'static str,
    },
    #[error("{kind} envelope has an empty `{field}`")]
    EmptyField {
        kind: SignalKind,
        field: &'static str,
    },
}

impl DecodeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DecodeError::NotUtf8(_) => "not_utf8",
            DecodeError::Malformed(_) => "malformed",
            DecodeError::MissingKind => "missing_kind",
            DecodeError::UnknownKind(_) => "unknown_kind",
            DecodeError::MissingField { .. } => "missing_field",
            DecodeError::EmptyField { .. } => "empty_field",
        }
    }
}

/// Frame layout spoken by the browser client.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<String>,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = DecodeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let name = wire.kind.as_deref().ok_or(DecodeError::MissingKind)?;
        let kind: SignalKind = name.parse()?;
        let legacy_call = name == LEGACY_CALL;
        let from = required(kind, "from", wire.from)?;

        if !kind.is_routed() {
            return Ok(Envelope::register(from));
        }

        let to = required(kind, "to", wire.to)?;
        let payload = match kind {
            SignalKind::Ice => wire.candidate,
            _ => wire.sdp,
        };

        Ok(Envelope {
            kind,
            from,
            to: Some(to),
            payload,
            legacy_call,
        })
    }
}

fn required(
    kind: SignalKind,
    field: &'static str,
    value: Option<String>,
) -> Result<String, DecodeError> {
    match value {
        None => Err(DecodeError::MissingField { kind, field }),
        Some(value) if value.is_empty() => Err(DecodeError::EmptyField { kind, field }),
        Some(value) => Ok(value),
    }
}

/// Decode one frame into a validated envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let text = std::str::from_utf8(bytes)?;
    let wire: WireEnvelope = serde_json::from_str(text)?;
    Envelope::try_from(wire)
}

pub fn decode_text(text: &str) -> Result<Envelope, DecodeError> {
    decode(text.as_bytes())
}

fn wire_name(envelope: &Envelope) -> &'static str {
    if envelope.legacy_call && envelope.kind == SignalKind::Offer {
        LEGACY_CALL
    } else {
        envelope.kind.as_str()
    }
}

/// Encode an envelope into the JSON text frame sent to peers.
pub fn encode(envelope: &Envelope) -> String {
    let mut wire = WireEnvelope {
        kind: Some(wire_name(envelope).to_string()),
        from: Some(envelope.from.clone()),
        to: envelope.to.clone(),
        ..WireEnvelope::default()
    };
    match envelope.kind {
        SignalKind::Register => wire.to = None,
        SignalKind::Offer | SignalKind::Answer => wire.sdp = envelope.payload.clone(),
        SignalKind::Ice => wire.candidate = envelope.payload.clone(),
    }
    serde_json::to_string(&wire).unwrap_or_else(|_| "{}".into())
}
