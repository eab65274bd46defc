use shoreline_proto::CallErrorReason;
use thiserror::Error;

/// Local capture failures. Cloneable because every caller waiting on the
/// same in-flight capture receives the same outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
    #[error("media capture failed: {0}")]
    Capture(String),
    #[error("local media was released while capture was in flight")]
    Released,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("invalid negotiation payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("transport already closed")]
    Closed,
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("relay connection failed: {0}")]
    Connect(String),
    #[error("relay did not acknowledge registration")]
    RegistrationTimeout,
    #[error("relay connection closed")]
    Closed,
}

/// The call controller task has stopped and no longer accepts actions.
#[derive(Debug, Error)]
#[error("call controller is not running")]
pub struct ControllerClosed;

/// Why a call ended up in the `error` state. The `Display` text is what the
/// presentation layer shows.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallFailure {
    /// The relay could not route the call request.
    #[error("{message}")]
    Relay {
        reason: CallErrorReason,
        message: String,
    },
    #[error("Call rejected by {}", .rejector.as_deref().unwrap_or("peer"))]
    Rejected { rejector: Option<String> },
    /// Producing or consuming an offer, answer or candidate failed.
    #[error("{0}")]
    Negotiation(String),
    #[error("Call connection failed")]
    TransportFailed,
    #[error("Call ended by {}", .peer.as_deref().unwrap_or("peer"))]
    RemoteEnded { peer: Option<String> },
    #[error("Unexpected renegotiation request")]
    RenegotiationUnsupported,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn failure_messages_name_the_peer() {
        let rejected = CallFailure::Rejected {
            rejector: Some("b@x".into()),
        };
        assert_eq!(rejected.to_string(), "Call rejected by b@x");
        assert_eq!(
            CallFailure::Rejected { rejector: None }.to_string(),
            "Call rejected by peer"
        );
        let relay = CallFailure::Relay {
            reason: CallErrorReason::NotFound,
            message: "User ghost@x not found or offline".into(),
        };
        assert_eq!(relay.to_string(), "User ghost@x not found or offline");
    }
}
