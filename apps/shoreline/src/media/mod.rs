//! Local capture and the stream handles shared between calls.

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::MediaError;

pub mod guard;

pub use guard::MediaGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub user_facing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

/// Ideal capture settings handed to the capture backend. `None` skips that
/// kind of track entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: Option<AudioConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: Some(VideoConstraints {
                width: 1280,
                height: 720,
                frame_rate: 30,
                user_facing: true,
            }),
            audio: Some(AudioConstraints {
                echo_cancellation: true,
                noise_suppression: true,
            }),
        }
    }
}

/// One captured track. `enabled` mutes without renegotiating; `stopped` is
/// final.
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let id = format!("{kind}-{}", Uuid::new_v4());
        let mime_type = match kind {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        let rtp = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            id.clone(),
            stream_id.to_owned(),
        ));
        Self {
            id,
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            rtp,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Flips the enabled flag and returns the new value.
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sample sink that a sender writes encoded media into.
    pub fn rtp(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtp)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Debug)]
pub struct LocalMediaStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

/// Shared, never copied: every call in a process sees the same stream.
pub type MediaStreamHandle = Arc<LocalMediaStream>;

impl LocalMediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }

    /// Flips the first track of `kind`. Returns the new enabled flag, or
    /// `false` when the stream has no such track.
    pub fn toggle(&self, kind: MediaKind) -> bool {
        self.track(kind).map(LocalTrack::toggle).unwrap_or(false)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tracks.iter().all(LocalTrack::is_stopped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrackInfo {
    pub id: String,
    pub kind: MediaKind,
}

/// What the peer is sending us, as announced by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMediaStream {
    pub id: String,
    pub tracks: Vec<RemoteTrackInfo>,
}

impl RemoteMediaStream {
    /// Folds another announcement for the same stream into this one.
    pub fn merge(&mut self, other: RemoteMediaStream) {
        for track in other.tracks {
            if !self.tracks.iter().any(|known| known.id == track.id) {
                self.tracks.push(track);
            }
        }
    }
}

/// Camera/microphone backend.
#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn capture(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream, MediaError>;
}

/// Builds Opus/VP8 sample tracks without touching any device. Used by the
/// CLI and tests; encoders can push samples into `LocalTrack::rtp`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticCapture;

#[async_trait]
impl MediaCapture for SyntheticCapture {
    async fn capture(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream, MediaError> {
        let stream_id = format!("shoreline-{}", Uuid::new_v4());
        let mut tracks = Vec::new();
        if constraints.audio.is_some() {
            tracks.push(LocalTrack::new(MediaKind::Audio, &stream_id));
        }
        if constraints.video.is_some() {
            tracks.push(LocalTrack::new(MediaKind::Video, &stream_id));
        }
        if tracks.is_empty() {
            return Err(MediaError::Capture(
                "constraints request neither audio nor video".into(),
            ));
        }
        Ok(LocalMediaStream::new(stream_id, tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    async fn synthetic_capture_follows_constraints() {
        let stream = SyntheticCapture
            .capture(&MediaConstraints::default())
            .await
            .expect("capture");
        assert_eq!(stream.tracks().len(), 2);
        assert!(stream.track(MediaKind::Audio).is_some());
        assert!(stream.track(MediaKind::Video).is_some());

        let audio_only = MediaConstraints {
            video: None,
            ..MediaConstraints::default()
        };
        let stream = SyntheticCapture.capture(&audio_only).await.expect("capture");
        assert_eq!(stream.tracks().len(), 1);
        assert!(!stream.toggle(MediaKind::Video));
    }

    #[test_timeout::timeout]
    async fn empty_constraints_fail() {
        let none = MediaConstraints {
            video: None,
            audio: None,
        };
        assert!(SyntheticCapture.capture(&none).await.is_err());
    }

    #[test_timeout::timeout]
    fn toggle_flips_and_reports() {
        let stream = LocalMediaStream::new(
            "s",
            vec![
                LocalTrack::new(MediaKind::Audio, "s"),
                LocalTrack::new(MediaKind::Video, "s"),
            ],
        );
        assert!(!stream.toggle(MediaKind::Audio));
        assert!(!stream.track(MediaKind::Audio).map(LocalTrack::is_enabled).unwrap_or(true));
        assert!(stream.toggle(MediaKind::Audio));
        assert!(stream.track(MediaKind::Video).map(LocalTrack::is_enabled).unwrap_or(false));

        stream.stop_all();
        assert!(stream.is_stopped());
    }

    #[test_timeout::timeout]
    fn remote_stream_merge_dedupes_tracks() {
        let mut stream = RemoteMediaStream {
            id: "r".into(),
            tracks: vec![RemoteTrackInfo {
                id: "a".into(),
                kind: MediaKind::Audio,
            }],
        };
        stream.merge(RemoteMediaStream {
            id: "r".into(),
            tracks: vec![
                RemoteTrackInfo {
                    id: "a".into(),
                    kind: MediaKind::Audio,
                },
                RemoteTrackInfo {
                    id: "v".into(),
                    kind: MediaKind::Video,
                },
            ],
        });
        assert_eq!(stream.tracks.len(), 2);
    }
}
