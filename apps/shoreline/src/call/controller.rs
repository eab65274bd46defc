use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use shoreline_proto::{ClientEnvelope, ServerEnvelope};

use super::machine::CallMachine;
use super::{CallEvent, CallSnapshot, MediaPolicy};
use crate::error::ControllerClosed;
use crate::media::{MediaGuard, MediaKind};
use crate::transport::{TransportEvent, TransportFactory};

#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Identity placed in outgoing call requests.
    pub identity: String,
    pub media_policy: MediaPolicy,
}

impl CallOptions {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            media_policy: MediaPolicy::default(),
        }
    }

    pub fn with_media_policy(mut self, policy: MediaPolicy) -> Self {
        self.media_policy = policy;
        self
    }
}

/// Starts the controller task that owns the call state machine. Envelopes
/// the machine wants to send are written to `outbound`; relayed envelopes
/// come in through [`CallHandle::deliver`]. The task ends once every handle
/// is dropped.
pub fn spawn(
    options: CallOptions,
    factory: Arc<dyn TransportFactory>,
    media: Arc<MediaGuard>,
    outbound: mpsc::UnboundedSender<ClientEnvelope>,
) -> (CallHandle, JoinHandle<()>) {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<CallEvent>();
    let (transport_tx, mut transport_rx) = mpsc::unbounded_channel::<TransportEvent>();
    let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::default());

    let forward = events_tx.downgrade();
    tokio::spawn(async move {
        while let Some(event) = transport_rx.recv().await {
            let Some(tx) = forward.upgrade() else { break };
            if tx.send(CallEvent::Transport(event)).is_err() {
                break;
            }
        }
    });

    let mut machine = CallMachine::new(
        options,
        factory,
        Arc::clone(&media),
        outbound,
        events_tx.downgrade(),
        transport_tx,
        snapshot_tx,
    );
    let task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            machine.handle(event).await;
        }
        debug!("call controller stopping");
        machine.shutdown().await;
    });

    let handle = CallHandle {
        events: events_tx,
        snapshot: snapshot_rx,
        media,
    };
    (handle, task)
}

/// Cheap, cloneable front for the controller task.
#[derive(Clone)]
pub struct CallHandle {
    events: mpsc::UnboundedSender<CallEvent>,
    snapshot: watch::Receiver<CallSnapshot>,
    media: Arc<MediaGuard>,
}

impl CallHandle {
    fn push(&self, event: CallEvent) -> Result<(), ControllerClosed> {
        self.events.send(event).map_err(|_| ControllerClosed)
    }

    pub fn initiate(&self, target: impl Into<String>) -> Result<(), ControllerClosed> {
        self.push(CallEvent::Initiate {
            target: target.into(),
        })
    }

    pub fn accept(&self) -> Result<(), ControllerClosed> {
        self.push(CallEvent::Accept)
    }

    pub fn reject(&self) -> Result<(), ControllerClosed> {
        self.push(CallEvent::Reject)
    }

    pub fn hang_up(&self) -> Result<(), ControllerClosed> {
        self.push(CallEvent::HangUp)
    }

    /// Dismisses an error back to idle.
    pub fn reset(&self) -> Result<(), ControllerClosed> {
        self.push(CallEvent::Reset)
    }

    /// Feeds an envelope received from the relay.
    pub fn deliver(&self, envelope: ServerEnvelope) -> Result<(), ControllerClosed> {
        self.push(CallEvent::Signal(envelope))
    }

    /// Returns the new enabled flag; `false` when no stream or track exists.
    pub fn toggle_audio(&self) -> bool {
        self.toggle(MediaKind::Audio)
    }

    pub fn toggle_video(&self) -> bool {
        self.toggle(MediaKind::Video)
    }

    fn toggle(&self, kind: MediaKind) -> bool {
        self.media
            .current()
            .map(|stream| stream.toggle(kind))
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Waits for a snapshot matching `predicate`. `None` on timeout or when
    /// the controller has stopped.
    pub async fn wait_until<F>(&self, timeout: Duration, mut predicate: F) -> Option<CallSnapshot>
    where
        F: FnMut(&CallSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|snapshot| predicate(snapshot))).await;
        match waited {
            Ok(Ok(snapshot)) => Some(snapshot.clone()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("state", &self.snapshot.borrow().state)
            .finish()
    }
}
