//! Peer-to-peer call client: relay signaling, one call session per
//! controller, and a WebRTC media transport.

pub mod call;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod signaling;
pub mod transport;

pub use call::{spawn, CallHandle, CallOptions, CallRole, CallSnapshot, CallState, MediaPolicy};
pub use config::ClientConfig;
pub use error::{CallFailure, ControllerClosed, MediaError, SignalingError, TransportError};
pub use signaling::SignalingClient;
