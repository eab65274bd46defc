//! In-memory transport for tests and relay smoke runs. It negotiates nothing
//! but follows the same description/candidate lifecycle as a real peer
//! connection and reports `Connected` once both sides have been exchanged.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

use shoreline_proto::{CandidatePayload, SessionPayload};

use super::{ConnectivityState, PeerTransport, TransportEventKind, TransportEvents, TransportFactory};
use crate::error::TransportError;
use crate::media::{LocalMediaStream, MediaKind, RemoteMediaStream, RemoteTrackInfo};

#[derive(Debug)]
struct Shared {
    created: AtomicUsize,
    closed: AtomicUsize,
    attachments: AtomicUsize,
    candidates: AtomicUsize,
    fail_next_description: AtomicBool,
    paused: watch::Sender<bool>,
    live: Mutex<Vec<Weak<LoopbackTransport>>>,
}

/// Factory handle; clones share counters and control knobs.
#[derive(Debug, Clone)]
pub struct LoopbackFactory {
    shared: Arc<Shared>,
}

impl Default for LoopbackFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFactory {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                created: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                attachments: AtomicUsize::new(0),
                candidates: AtomicUsize::new(0),
                fail_next_description: AtomicBool::new(false),
                paused,
                live: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn created_transports(&self) -> usize {
        self.shared.created.load(Ordering::SeqCst)
    }

    pub fn closed_transports(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn track_attachments(&self) -> usize {
        self.shared.attachments.load(Ordering::SeqCst)
    }

    /// Remote candidates actually handed to a transport (not buffered).
    pub fn applied_candidates(&self) -> usize {
        self.shared.candidates.load(Ordering::SeqCst)
    }

    /// The next offer or answer creation fails.
    pub fn fail_next_description(&self) {
        self.shared.fail_next_description.store(true, Ordering::SeqCst);
    }

    /// Offer and answer creation block until `resume_negotiation`.
    pub fn pause_negotiation(&self) {
        self.shared.paused.send_replace(true);
    }

    pub fn resume_negotiation(&self) {
        self.shared.paused.send_replace(false);
    }

    /// Reports `Failed` from every open transport.
    pub fn fail_connectivity(&self) {
        let live: Vec<_> = self.shared.live.lock().iter().filter_map(Weak::upgrade).collect();
        for transport in live.iter().filter(|t| !t.closed.load(Ordering::SeqCst)) {
            transport
                .events
                .emit(TransportEventKind::Connectivity(ConnectivityState::Failed));
        }
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = Arc::new(LoopbackTransport {
            shared: Arc::clone(&self.shared),
            events,
            state: Mutex::new(LoopbackState::default()),
            closed: AtomicBool::new(false),
        });
        self.shared.created.fetch_add(1, Ordering::SeqCst);
        let mut live = self.shared.live.lock();
        live.retain(|t| t.upgrade().is_some_and(|t| !t.closed.load(Ordering::SeqCst)));
        live.push(Arc::downgrade(&transport));
        Ok(transport)
    }
}

#[derive(Debug, Default)]
struct LoopbackState {
    local: Option<SessionPayload>,
    remote: Option<SessionPayload>,
    senders: usize,
    remote_candidates: usize,
    connected: bool,
}

pub struct LoopbackTransport {
    shared: Arc<Shared>,
    events: TransportEvents,
    state: Mutex<LoopbackState>,
    closed: AtomicBool,
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("generation", &self.events.generation())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl LoopbackTransport {
    async fn description(&self, kind: &str) -> Result<SessionPayload, TransportError> {
        self.check_open()?;
        let mut paused = self.shared.paused.subscribe();
        paused
            .wait_for(|paused| !*paused)
            .await
            .map_err(|_| TransportError::Closed)?;
        self.check_open()?;
        if self.shared.fail_next_description.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Negotiation(format!("injected {kind} failure")));
        }
        Ok(json!({
            "type": kind,
            "sdp": format!("loopback-{kind}-{}", self.events.generation()),
        }))
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn maybe_connect(&self) {
        let ready = {
            let mut state = self.state.lock();
            let ready = !state.connected
                && state.local.is_some()
                && state.remote.is_some()
                && state.remote_candidates > 0;
            if ready {
                state.connected = true;
            }
            ready
        };
        if ready {
            let generation = self.events.generation();
            self.events
                .emit(TransportEventKind::RemoteStream(RemoteMediaStream {
                    id: format!("loopback-remote-{generation}"),
                    tracks: vec![
                        RemoteTrackInfo {
                            id: format!("audio-{generation}"),
                            kind: MediaKind::Audio,
                        },
                        RemoteTrackInfo {
                            id: format!("video-{generation}"),
                            kind: MediaKind::Video,
                        },
                    ],
                }));
            self.events
                .emit(TransportEventKind::Connectivity(ConnectivityState::Connected));
        }
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<SessionPayload, TransportError> {
        self.description("offer").await
    }

    async fn create_answer(&self) -> Result<SessionPayload, TransportError> {
        if self.state.lock().remote.is_none() {
            return Err(TransportError::Negotiation("answer requires a remote offer".into()));
        }
        self.description("answer").await
    }

    async fn set_local_description(&self, description: SessionPayload) -> Result<(), TransportError> {
        self.check_open()?;
        self.state.lock().local = Some(description);
        self.events.emit(TransportEventKind::LocalCandidate(json!({
            "candidate": format!("candidate:loopback {} 1 udp 1 127.0.0.1 9 typ host", self.events.generation()),
            "sdpMid": "0",
            "sdpMLineIndex": 0,
        })));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionPayload) -> Result<(), TransportError> {
        self.check_open()?;
        if !description.is_object() {
            return Err(TransportError::Negotiation("remote description is not an object".into()));
        }
        self.state.lock().remote = Some(description);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: CandidatePayload) -> Result<(), TransportError> {
        self.check_open()?;
        self.shared.candidates.fetch_add(1, Ordering::SeqCst);
        self.state.lock().remote_candidates += 1;
        self.maybe_connect();
        Ok(())
    }

    async fn has_senders(&self) -> bool {
        self.state.lock().senders > 0
    }

    async fn add_tracks(&self, stream: &LocalMediaStream) -> Result<(), TransportError> {
        self.check_open()?;
        self.state.lock().senders += stream.tracks().len();
        self.shared.attachments.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.closed.fetch_add(1, Ordering::SeqCst);
            self.events
                .emit(TransportEventKind::Connectivity(ConnectivityState::Closed));
        }
        Ok(())
    }
}
