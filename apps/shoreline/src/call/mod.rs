//! The call session: one ordered event queue, one state machine, and a
//! published snapshot for the presentation layer.

use std::fmt;
use std::sync::Arc;

use shoreline_proto::{ServerEnvelope, SessionPayload};

use crate::error::{CallFailure, TransportError};
use crate::media::{MediaStreamHandle, RemoteMediaStream};
use crate::transport::{SessionTransport, TransportEvent};

pub mod controller;
mod machine;

pub use controller::{spawn, CallHandle, CallOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Calling,
    Incoming,
    InCall,
    Error,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Incoming => "incoming",
            CallState::InCall => "in-call",
            CallState::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// What happens to the shared local stream when a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum MediaPolicy {
    /// Keep devices open for the next call.
    #[default]
    KeepWarm,
    /// Stop every track and capture again next time.
    ReleaseOnTeardown,
}

/// Everything the presentation layer renders.
#[derive(Debug, Clone, Default)]
pub struct CallSnapshot {
    pub state: CallState,
    pub role: Option<CallRole>,
    pub remote_user: Option<String>,
    pub local_stream: Option<MediaStreamHandle>,
    pub remote_stream: Option<RemoteMediaStream>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub failure: Option<CallFailure>,
}

/// Input to the state machine. User actions, relayed envelopes, transport
/// events and setup completions share one queue.
#[derive(Debug)]
pub enum CallEvent {
    Initiate { target: String },
    Accept,
    Reject,
    HangUp,
    Reset,
    Signal(ServerEnvelope),
    Transport(TransportEvent),
    SetupCompleted(SetupCompletion),
}

/// Result of the media + description work spawned for one session.
pub struct SetupCompletion {
    generation: u64,
    transport: Arc<SessionTransport>,
    result: Result<SetupOutput, TransportError>,
}

struct SetupOutput {
    stream: MediaStreamHandle,
    description: SessionPayload,
}

impl fmt::Debug for SetupCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupCompletion")
            .field("generation", &self.generation)
            .field("ok", &self.result.is_ok())
            .finish()
    }
}
