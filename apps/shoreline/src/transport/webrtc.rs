use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

use shoreline_proto::{CandidatePayload, SessionPayload};

use super::{
    ConnectivityState, IceConfig, PeerTransport, TransportEventKind, TransportEvents,
    TransportFactory,
};
use crate::error::TransportError;
use crate::media::{LocalMediaStream, MediaKind, RemoteMediaStream, RemoteTrackInfo};

/// Builds `RTCPeerConnection`s with the default codecs and interceptors.
pub struct RtcTransportFactory {
    ice: IceConfig,
    api: API,
}

impl RtcTransportFactory {
    pub fn new(ice: IceConfig) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { ice, api })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: self.ice.rtc_servers(),
            ..Default::default()
        };
        let peer = Arc::new(self.api.new_peer_connection(config).await?);
        let generation = events.generation();

        let candidate_events = events.clone();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!(generation = events.generation(), "candidate gathering complete");
                    return;
                };
                match candidate.to_json().map(|init| serde_json::to_value(init)) {
                    Ok(Ok(payload)) => events.emit(TransportEventKind::LocalCandidate(payload)),
                    Ok(Err(err)) => warn!(error = %err, "failed to encode local candidate"),
                    Err(err) => warn!(error = %err, "failed to serialize local candidate"),
                }
            })
        }));

        let state_events = events.clone();
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            Box::pin(async move {
                debug!(generation = events.generation(), ?state, "peer connection state changed");
                events.emit(TransportEventKind::Connectivity(connectivity(state)));
            })
        }));

        let track_events = events;
        peer.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    other => {
                        warn!(?other, "ignoring remote track of unknown kind");
                        return;
                    }
                };
                info!(generation = events.generation(), %kind, "remote track arrived");
                events.emit(TransportEventKind::RemoteStream(RemoteMediaStream {
                    id: track.stream_id(),
                    tracks: vec![RemoteTrackInfo { id: track.id(), kind }],
                }));
            })
        }));

        debug!(generation, "peer connection created");
        Ok(Arc::new(RtcTransport { peer }))
    }
}

fn connectivity(state: RTCPeerConnectionState) -> ConnectivityState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => ConnectivityState::New,
        RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
        RTCPeerConnectionState::Connected => ConnectivityState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectivityState::Failed,
        RTCPeerConnectionState::Closed => ConnectivityState::Closed,
    }
}

pub struct RtcTransport {
    peer: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionPayload, TransportError> {
        let offer = self.peer.create_offer(None).await?;
        Ok(serde_json::to_value(offer)?)
    }

    async fn create_answer(&self) -> Result<SessionPayload, TransportError> {
        let answer = self.peer.create_answer(None).await?;
        Ok(serde_json::to_value(answer)?)
    }

    async fn set_local_description(&self, description: SessionPayload) -> Result<(), TransportError> {
        let description: RTCSessionDescription = serde_json::from_value(description)?;
        self.peer.set_local_description(description).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionPayload) -> Result<(), TransportError> {
        let description: RTCSessionDescription = serde_json::from_value(description)?;
        self.peer.set_remote_description(description).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), TransportError> {
        let candidate: RTCIceCandidateInit = serde_json::from_value(candidate)?;
        self.peer.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn has_senders(&self) -> bool {
        for sender in self.peer.get_senders().await {
            if sender.track().await.is_some() {
                return true;
            }
        }
        false
    }

    async fn add_tracks(&self, stream: &LocalMediaStream) -> Result<(), TransportError> {
        for track in stream.tracks() {
            let local: Arc<dyn TrackLocal + Send + Sync> = track.rtp();
            let sender = self.peer.add_track(local).await?;
            // RTCP has to be read for interceptors such as NACK to work.
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.peer.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaConstraints, MediaGuard, SyntheticCapture};
    use crate::transport::SessionTransport;
    use tokio::sync::mpsc;

    #[test_timeout::timeout]
    async fn offer_carries_audio_and_video_sections() {
        let factory = RtcTransportFactory::new(IceConfig::localhost()).expect("factory");
        let media = Arc::new(MediaGuard::new(
            Arc::new(SyntheticCapture),
            MediaConstraints::default(),
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = SessionTransport::create(&factory, media, TransportEvents::new(1, tx))
            .await
            .expect("transport");

        transport.attach_local_media().await.expect("attach");
        let offer = transport.produce_offer().await.expect("offer");
        assert_eq!(offer["type"], "offer");
        let sdp = offer["sdp"].as_str().expect("sdp string");
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=video"));

        transport.destroy().await;
    }

    #[test_timeout::timeout]
    fn connectivity_mapping() {
        assert_eq!(connectivity(RTCPeerConnectionState::Connected), ConnectivityState::Connected);
        assert!(connectivity(RTCPeerConnectionState::Failed).is_lost());
        assert!(connectivity(RTCPeerConnectionState::Disconnected).is_lost());
        assert!(!connectivity(RTCPeerConnectionState::Connecting).is_lost());
    }
}
