//! Peer transport seam and the per-session manager around it.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use shoreline_proto::{CandidatePayload, SessionPayload};

use crate::error::TransportError;
use crate::media::{LocalMediaStream, MediaGuard, MediaStreamHandle, RemoteMediaStream};

pub mod config;
pub mod loopback;
pub mod webrtc;

pub use config::{IceConfig, IceServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    /// Failed or disconnected; the peer is treated as gone.
    pub fn is_lost(self) -> bool {
        matches!(self, ConnectivityState::Failed | ConnectivityState::Disconnected)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    LocalCandidate(CandidatePayload),
    RemoteStream(RemoteMediaStream),
    Connectivity(ConnectivityState),
}

/// An event raised by the transport of session `generation`.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub generation: u64,
    pub kind: TransportEventKind,
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Emitter handed to a transport at creation, stamped with its session
/// generation.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    generation: u64,
    tx: TransportEventSender,
}

impl TransportEvents {
    pub fn new(generation: u64, tx: TransportEventSender) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, kind: TransportEventKind) {
        let event = TransportEvent {
            generation: self.generation,
            kind,
        };
        if self.tx.send(event).is_err() {
            debug!(generation = self.generation, "transport event dropped; controller gone");
        }
    }
}

/// One negotiated peer connection. Descriptions and candidates are opaque
/// JSON payloads as carried by the relay.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionPayload, TransportError>;
    async fn create_answer(&self) -> Result<SessionPayload, TransportError>;
    async fn set_local_description(&self, description: SessionPayload) -> Result<(), TransportError>;
    async fn set_remote_description(&self, description: SessionPayload) -> Result<(), TransportError>;
    async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), TransportError>;
    /// Whether outbound tracks are already attached.
    async fn has_senders(&self) -> bool;
    async fn add_tracks(&self, stream: &LocalMediaStream) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

#[derive(Debug, Default)]
struct Negotiation {
    remote_applied: bool,
    pending: Vec<CandidatePayload>,
    closed: bool,
}

/// Owns one peer transport for exactly one call session.
pub struct SessionTransport {
    generation: u64,
    inner: Arc<dyn PeerTransport>,
    media: Arc<MediaGuard>,
    negotiation: Mutex<Negotiation>,
}

impl SessionTransport {
    pub async fn create(
        factory: &dyn TransportFactory,
        media: Arc<MediaGuard>,
        events: TransportEvents,
    ) -> Result<Self, TransportError> {
        let generation = events.generation();
        let inner = factory.create(events).await?;
        debug!(generation, "session transport created");
        Ok(Self {
            generation,
            inner,
            media,
            negotiation: Mutex::new(Negotiation::default()),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Acquires the shared local stream and attaches its tracks unless the
    /// transport already sends media.
    pub async fn attach_local_media(&self) -> Result<MediaStreamHandle, TransportError> {
        self.ensure_open().await?;
        let stream = self.media.acquire().await?;
        if self.inner.has_senders().await {
            debug!(generation = self.generation, "tracks already attached");
        } else {
            self.inner.add_tracks(&stream).await?;
        }
        Ok(stream)
    }

    pub async fn produce_offer(&self) -> Result<SessionPayload, TransportError> {
        self.ensure_open().await?;
        let offer = self.inner.create_offer().await?;
        self.inner.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    pub async fn produce_answer(&self) -> Result<SessionPayload, TransportError> {
        self.ensure_open().await?;
        let answer = self.inner.create_answer().await?;
        self.inner.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    /// Applies the peer's description, then flushes any candidates that
    /// arrived ahead of it.
    pub async fn apply_remote_description(&self, description: SessionPayload) -> Result<(), TransportError> {
        let mut negotiation = self.negotiation.lock().await;
        if negotiation.closed {
            return Err(TransportError::Closed);
        }
        self.inner.set_remote_description(description).await?;
        negotiation.remote_applied = true;
        let pending = std::mem::take(&mut negotiation.pending);
        if !pending.is_empty() {
            debug!(generation = self.generation, count = pending.len(), "flushing buffered candidates");
        }
        for candidate in pending {
            if let Err(err) = self.inner.add_ice_candidate(candidate).await {
                warn!(generation = self.generation, error = %err, "buffered candidate rejected");
            }
        }
        Ok(())
    }

    pub async fn add_remote_candidate(&self, candidate: CandidatePayload) -> Result<(), TransportError> {
        let mut negotiation = self.negotiation.lock().await;
        if negotiation.closed {
            return Err(TransportError::Closed);
        }
        if !negotiation.remote_applied {
            negotiation.pending.push(candidate);
            return Ok(());
        }
        self.inner.add_ice_candidate(candidate).await
    }

    pub async fn has_remote_description(&self) -> bool {
        self.negotiation.lock().await.remote_applied
    }

    pub async fn is_closed(&self) -> bool {
        self.negotiation.lock().await.closed
    }

    /// Closes the transport. Shared media is left running.
    pub async fn destroy(&self) {
        {
            let mut negotiation = self.negotiation.lock().await;
            if negotiation.closed {
                return;
            }
            negotiation.closed = true;
            negotiation.pending.clear();
        }
        if let Err(err) = self.inner.close().await {
            warn!(generation = self.generation, error = %err, "transport close failed");
        }
        debug!(generation = self.generation, "session transport destroyed");
    }

    async fn ensure_open(&self) -> Result<(), TransportError> {
        if self.negotiation.lock().await.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for SessionTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionTransport")
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::loopback::LoopbackFactory;
    use super::*;
    use crate::media::{MediaConstraints, SyntheticCapture};
    use serde_json::json;

    fn guard() -> Arc<MediaGuard> {
        Arc::new(MediaGuard::new(
            Arc::new(SyntheticCapture),
            MediaConstraints::default(),
        ))
    }

    async fn session(factory: &LoopbackFactory, generation: u64) -> (SessionTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = SessionTransport::create(factory, guard(), TransportEvents::new(generation, tx))
            .await
            .expect("create");
        (transport, rx)
    }

    #[test_timeout::timeout]
    async fn candidates_buffer_until_remote_description() {
        let factory = LoopbackFactory::new();
        let (transport, _events) = session(&factory, 1).await;

        transport
            .add_remote_candidate(json!({"candidate": "c1"}))
            .await
            .expect("buffered");
        assert_eq!(factory.applied_candidates(), 0);
        assert!(!transport.has_remote_description().await);

        transport
            .apply_remote_description(json!({"type": "offer", "sdp": "remote"}))
            .await
            .expect("apply");
        assert_eq!(factory.applied_candidates(), 1);

        transport
            .add_remote_candidate(json!({"candidate": "c2"}))
            .await
            .expect("direct");
        assert_eq!(factory.applied_candidates(), 2);
    }

    #[test_timeout::timeout]
    async fn media_attaches_once() {
        let factory = LoopbackFactory::new();
        let (transport, _events) = session(&factory, 1).await;

        let first = transport.attach_local_media().await.expect("attach");
        let second = transport.attach_local_media().await.expect("attach");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.track_attachments(), 1);
    }

    #[test_timeout::timeout]
    async fn offer_is_set_locally_and_announces_candidate() {
        let factory = LoopbackFactory::new();
        let (transport, mut events) = session(&factory, 7).await;

        let offer = transport.produce_offer().await.expect("offer");
        assert_eq!(offer["type"], "offer");
        let event = events.recv().await.expect("candidate event");
        assert_eq!(event.generation, 7);
        assert!(matches!(event.kind, TransportEventKind::LocalCandidate(_)));
    }

    #[test_timeout::timeout]
    async fn destroy_is_idempotent_and_blocks_further_work() {
        let factory = LoopbackFactory::new();
        let (transport, _events) = session(&factory, 1).await;

        transport.destroy().await;
        transport.destroy().await;
        assert_eq!(factory.closed_transports(), 1);
        assert!(transport.is_closed().await);
        assert!(matches!(
            transport.produce_offer().await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            transport.add_remote_candidate(json!({})).await,
            Err(TransportError::Closed)
        ));
    }

    #[test_timeout::timeout]
    fn lost_states() {
        assert!(ConnectivityState::Failed.is_lost());
        assert!(ConnectivityState::Disconnected.is_lost());
        assert!(!ConnectivityState::Connected.is_lost());
        assert!(!ConnectivityState::Closed.is_lost());
    }
}
