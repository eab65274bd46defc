//! Wire envelopes exchanged between call clients and the signaling relay.
//! Kept in a dedicated crate so the relay and the client agree on one
//! definition without the relay pulling in any media code.
//!
//! Envelopes travel as JSON text frames. The `type` tag is kebab-case and
//! fields are camelCase. Negotiation payloads and candidates are opaque
//! `serde_json::Value`s: the relay never looks inside them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Opaque offer/answer description.
pub type SessionPayload = Value;

/// Opaque network-path candidate.
pub type CandidatePayload = Value;

/// Address of one live connection to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ChannelId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Messages sent from a call client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEnvelope {
    /// Bind this connection to an identity.
    Register { identity: String },
    /// Ring an identity. The only envelope resolved through the registry.
    CallRequest {
        callee_identity: String,
        caller_identity: String,
        offer: SessionPayload,
    },
    CallAnswer {
        caller_channel: ChannelId,
        answer: SessionPayload,
    },
    CallReject { caller_channel: ChannelId },
    Offer {
        target_channel: ChannelId,
        offer: SessionPayload,
    },
    Answer {
        target_channel: ChannelId,
        answer: SessionPayload,
    },
    IceCandidate {
        target_channel: ChannelId,
        candidate: CandidatePayload,
    },
    CallEnd { target_channel: ChannelId },
    Ping,
}

impl ClientEnvelope {
    /// Wire name of the envelope, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEnvelope::Register { .. } => "register",
            ClientEnvelope::CallRequest { .. } => "call-request",
            ClientEnvelope::CallAnswer { .. } => "call-answer",
            ClientEnvelope::CallReject { .. } => "call-reject",
            ClientEnvelope::Offer { .. } => "offer",
            ClientEnvelope::Answer { .. } => "answer",
            ClientEnvelope::IceCandidate { .. } => "ice-candidate",
            ClientEnvelope::CallEnd { .. } => "call-end",
            ClientEnvelope::Ping => "ping",
        }
    }

    /// Channel this envelope is addressed to, when it is channel-addressed.
    pub fn target_channel(&self) -> Option<ChannelId> {
        match self {
            ClientEnvelope::CallAnswer { caller_channel, .. }
            | ClientEnvelope::CallReject { caller_channel } => Some(*caller_channel),
            ClientEnvelope::Offer { target_channel, .. }
            | ClientEnvelope::Answer { target_channel, .. }
            | ClientEnvelope::IceCandidate { target_channel, .. }
            | ClientEnvelope::CallEnd { target_channel } => Some(*target_channel),
            ClientEnvelope::Register { .. }
            | ClientEnvelope::CallRequest { .. }
            | ClientEnvelope::Ping => None,
        }
    }
}

/// Why a `call-request` could not be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallErrorReason {
    /// The directory does not know the identity, or no directory is
    /// configured and the identity is not registered.
    NotFound,
    /// The directory knows the identity but it has no live channel.
    Offline,
    /// The directory could not be consulted.
    Unavailable,
}

/// Messages sent from the relay to a call client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEnvelope {
    Registered {
        identity: String,
        channel: ChannelId,
    },
    Incoming {
        caller_identity: String,
        caller_channel: ChannelId,
        offer: SessionPayload,
    },
    /// Acknowledges a routed `call-request` to the caller.
    CallRinging {
        callee_identity: String,
        callee_channel: ChannelId,
    },
    CallAnswered {
        answer: SessionPayload,
        answerer_identity: Option<String>,
        answerer_channel: ChannelId,
    },
    CallRejected { rejector_identity: Option<String> },
    ReceiveOffer {
        offer: SessionPayload,
        from_channel: ChannelId,
    },
    ReceiveAnswer {
        answer: SessionPayload,
        from_channel: ChannelId,
    },
    IceCandidate {
        candidate: CandidatePayload,
        from_channel: ChannelId,
    },
    CallEnded { from_channel: ChannelId },
    CallError {
        message: String,
        reason: CallErrorReason,
    },
    Pong,
}

impl ServerEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEnvelope::Registered { .. } => "registered",
            ServerEnvelope::Incoming { .. } => "incoming",
            ServerEnvelope::CallRinging { .. } => "call-ringing",
            ServerEnvelope::CallAnswered { .. } => "call-answered",
            ServerEnvelope::CallRejected { .. } => "call-rejected",
            ServerEnvelope::ReceiveOffer { .. } => "receive-offer",
            ServerEnvelope::ReceiveAnswer { .. } => "receive-answer",
            ServerEnvelope::IceCandidate { .. } => "ice-candidate",
            ServerEnvelope::CallEnded { .. } => "call-ended",
            ServerEnvelope::CallError { .. } => "call-error",
            ServerEnvelope::Pong => "pong",
        }
    }
}
