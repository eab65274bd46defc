use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{MediaCapture, MediaConstraints, MediaStreamHandle};
use crate::error::MediaError;

type CaptureFuture = Shared<BoxFuture<'static, Result<MediaStreamHandle, MediaError>>>;

/// Owns the process-wide local stream. Concurrent `acquire` calls share one
/// in-flight capture so the devices are opened at most once.
pub struct MediaGuard {
    capture: Arc<dyn MediaCapture>,
    constraints: MediaConstraints,
    inflight: Mutex<Option<CaptureFuture>>,
}

impl MediaGuard {
    pub fn new(capture: Arc<dyn MediaCapture>, constraints: MediaConstraints) -> Self {
        Self {
            capture,
            constraints,
            inflight: Mutex::new(None),
        }
    }

    /// Returns the shared stream, starting a capture only when nothing is
    /// cached or in flight. A failed capture is forgotten so the next call
    /// retries. A capture that finishes after `release` is stopped on the spot
    /// and reported as [`MediaError::Released`].
    pub async fn acquire(&self) -> Result<MediaStreamHandle, MediaError> {
        let future = {
            let mut slot = self.inflight.lock();
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let capture = Arc::clone(&self.capture);
                    let constraints = self.constraints.clone();
                    let future = async move {
                        debug!("capturing local media");
                        capture.capture(&constraints).await.map(Arc::new)
                    }
                    .boxed()
                    .shared();
                    *slot = Some(future.clone());
                    future
                }
            }
        };

        let result = future.clone().await;
        let mut slot = self.inflight.lock();
        let still_current = slot.as_ref().is_some_and(|current| current.ptr_eq(&future));
        match result {
            Ok(stream) if !still_current => {
                debug!(stream = %stream.id(), "capture finished after release; stopping it");
                stream.stop_all();
                Err(MediaError::Released)
            }
            Ok(stream) => Ok(stream),
            Err(err) => {
                warn!(error = %err, "local media capture failed");
                if still_current {
                    *slot = None;
                }
                Err(err)
            }
        }
    }

    /// The stream if a capture has already completed successfully.
    pub fn current(&self) -> Option<MediaStreamHandle> {
        self.inflight
            .lock()
            .as_ref()
            .and_then(|future| future.peek().cloned())
            .and_then(Result::ok)
    }

    /// Stops every track and forgets the stream; the next `acquire` opens the
    /// devices again. A capture still in flight is stopped by whoever awaits it.
    pub fn release(&self) {
        let taken = self.inflight.lock().take();
        if let Some(stream) = taken.and_then(|future| future.peek().cloned()).and_then(Result::ok) {
            debug!(stream = %stream.id(), "releasing local media");
            stream.stop_all();
        }
    }
}

impl std::fmt::Debug for MediaGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaGuard")
            .field("constraints", &self.constraints)
            .field("current", &self.current().map(|s| s.id().to_owned()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalMediaStream, LocalTrack, MediaKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct GatedCapture {
        calls: AtomicUsize,
        fail_first: bool,
        gate: Notify,
    }

    impl GatedCapture {
        fn new(fail_first: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_first,
                gate: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl MediaCapture for GatedCapture {
        async fn capture(&self, _: &MediaConstraints) -> Result<LocalMediaStream, MediaError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            if self.fail_first && call == 0 {
                return Err(MediaError::PermissionDenied("camera".into()));
            }
            Ok(LocalMediaStream::new(
                format!("stream-{call}"),
                vec![LocalTrack::new(MediaKind::Audio, "s")],
            ))
        }
    }

    #[test_timeout::timeout]
    async fn concurrent_acquires_share_one_capture() {
        let capture = GatedCapture::new(false);
        let guard = Arc::new(MediaGuard::new(capture.clone(), MediaConstraints::default()));

        let first = tokio::spawn({
            let guard = Arc::clone(&guard);
            async move { guard.acquire().await }
        });
        let second = tokio::spawn({
            let guard = Arc::clone(&guard);
            async move { guard.acquire().await }
        });
        while capture.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        tokio::task::yield_now().await;
        capture.gate.notify_one();

        let a = first.await.expect("join").expect("acquire");
        let b = second.await.expect("join").expect("acquire");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(capture.calls.load(Ordering::SeqCst), 1);
        assert!(guard.current().is_some());
    }

    #[test_timeout::timeout]
    async fn failed_capture_allows_retry() {
        let capture = GatedCapture::new(true);
        let guard = MediaGuard::new(capture.clone(), MediaConstraints::default());

        capture.gate.notify_one();
        let err = guard.acquire().await.expect_err("first capture fails");
        assert_eq!(err, MediaError::PermissionDenied("camera".into()));
        assert!(guard.current().is_none());

        capture.gate.notify_one();
        let stream = guard.acquire().await.expect("retry succeeds");
        assert_eq!(stream.id(), "stream-1");
        assert_eq!(capture.calls.load(Ordering::SeqCst), 2);
    }

    #[test_timeout::timeout]
    async fn release_stops_tracks_and_recaptures() {
        let capture = GatedCapture::new(false);
        let guard = MediaGuard::new(capture.clone(), MediaConstraints::default());

        capture.gate.notify_one();
        let first = guard.acquire().await.expect("acquire");
        let again = guard.acquire().await.expect("cached");
        assert!(Arc::ptr_eq(&first, &again));

        guard.release();
        assert!(first.is_stopped());
        assert!(guard.current().is_none());

        capture.gate.notify_one();
        let second = guard.acquire().await.expect("acquire");
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_stopped());
    }

    #[test_timeout::timeout]
    async fn release_during_capture_stops_the_late_stream() {
        let capture = GatedCapture::new(false);
        let guard = Arc::new(MediaGuard::new(capture.clone(), MediaConstraints::default()));

        let pending = tokio::spawn({
            let guard = Arc::clone(&guard);
            async move { guard.acquire().await }
        });
        while capture.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let held = guard.inflight.lock().clone().expect("capture in flight");
        guard.release();
        capture.gate.notify_one();

        let err = pending.await.expect("join").expect_err("released capture");
        assert_eq!(err, MediaError::Released);
        let late = held.peek().cloned().expect("resolved").expect("stream");
        assert!(late.is_stopped());
        assert!(guard.current().is_none());

        capture.gate.notify_one();
        let fresh = guard.acquire().await.expect("acquire");
        assert_eq!(fresh.id(), "stream-1");
        assert!(!fresh.is_stopped());
    }
}
