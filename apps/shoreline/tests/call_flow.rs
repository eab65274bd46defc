use std::sync::Arc;
use std::time::Duration;

use shoreline_client::call::{self, CallHandle, CallOptions, CallSnapshot, CallState};
use shoreline_client::media::{MediaConstraints, MediaGuard, SyntheticCapture};
use shoreline_client::transport::loopback::LoopbackFactory;
use shoreline_client::SignalingClient;
use shoreline_relay::{directory::OpenDirectory, relay::RelayState, serve};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(10);

async fn start_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = RelayState::new(Arc::new(OpenDirectory));
    tokio::spawn(async move {
        let _ = serve(listener, state, std::future::pending()).await;
    });
    format!("http://{addr}")
}

struct Peer {
    handle: CallHandle,
    factory: LoopbackFactory,
    _signaling: SignalingClient,
}

impl Peer {
    async fn join(relay: &str, identity: &str) -> Self {
        let factory = LoopbackFactory::new();
        let media = Arc::new(MediaGuard::new(
            Arc::new(SyntheticCapture),
            MediaConstraints::default(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let (handle, _task) = call::spawn(
            CallOptions::new(identity),
            Arc::new(factory.clone()),
            media,
            tx,
        );
        let signaling = SignalingClient::connect(relay, identity, rx, handle.clone())
            .await
            .expect("register with relay");
        assert_eq!(signaling.identity(), identity);
        Self {
            handle,
            factory,
            _signaling: signaling,
        }
    }

    async fn wait(&self, what: &str, predicate: impl FnMut(&CallSnapshot) -> bool) -> CallSnapshot {
        self.handle
            .wait_until(WAIT, predicate)
            .await
            .unwrap_or_else(|| panic!("timed out waiting for {what}; last {:?}", self.handle.snapshot()))
    }

    async fn wait_state(&self, state: CallState) -> CallSnapshot {
        self.wait(&state.to_string(), |s| s.state == state).await
    }
}

async fn connected_pair(relay: &str) -> (Peer, Peer) {
    let a = Peer::join(relay, "a@x").await;
    let b = Peer::join(relay, "b@x").await;

    a.handle.initiate("b@x").expect("initiate");
    let incoming = b.wait_state(CallState::Incoming).await;
    assert_eq!(incoming.remote_user.as_deref(), Some("a@x"));
    assert_eq!(a.handle.snapshot().state, CallState::Calling);

    b.handle.accept().expect("accept");
    for peer in [&a, &b] {
        peer.wait("media", |s| s.state == CallState::InCall && s.remote_stream.is_some())
            .await;
    }
    (a, b)
}

#[test_timeout::timeout(60)]
async fn call_between_registered_peers_reaches_in_call() {
    let relay = start_relay().await;
    let (a, b) = connected_pair(&relay).await;

    let caller = a.handle.snapshot();
    assert_eq!(caller.remote_user.as_deref(), Some("b@x"));
    assert!(caller.local_stream.is_some());
    assert!(caller.error.is_none());
    let callee = b.handle.snapshot();
    assert_eq!(callee.remote_user.as_deref(), Some("a@x"));
    assert!(!callee.is_loading);
}

#[test_timeout::timeout(60)]
async fn calling_unknown_identity_fails_with_relay_message() {
    let relay = start_relay().await;
    let a = Peer::join(&relay, "a@x").await;

    a.handle.initiate("ghost@x").expect("initiate");
    let snapshot = a.wait_state(CallState::Error).await;
    let message = snapshot.error.expect("error text");
    assert!(message.contains("ghost@x"), "unexpected message {message}");
    assert_eq!(a.factory.closed_transports(), a.factory.created_transports());
}

#[test_timeout::timeout(60)]
async fn rejected_call_names_the_rejector() {
    let relay = start_relay().await;
    let a = Peer::join(&relay, "a@x").await;
    let b = Peer::join(&relay, "b@x").await;

    a.handle.initiate("b@x").expect("initiate");
    b.wait_state(CallState::Incoming).await;
    b.handle.reject().expect("reject");

    let snapshot = a.wait_state(CallState::Error).await;
    assert_eq!(snapshot.error.as_deref(), Some("Call rejected by b@x"));
    let callee = b.wait_state(CallState::Idle).await;
    assert!(callee.error.is_none());
    assert_eq!(b.factory.created_transports(), 0);
}

#[test_timeout::timeout(60)]
async fn hanging_up_twice_ends_both_sides_cleanly() {
    let relay = start_relay().await;
    let (a, b) = connected_pair(&relay).await;

    a.handle.hang_up().expect("hang up");
    a.handle.hang_up().expect("hang up");

    let caller = a.wait_state(CallState::Idle).await;
    assert!(caller.error.is_none());
    let callee = b.wait_state(CallState::Idle).await;
    assert!(callee.error.is_none());
    assert!(callee.remote_user.is_none());
    assert_eq!(a.factory.closed_transports(), 1);
    assert_eq!(b.factory.closed_transports(), 1);
}

#[test_timeout::timeout(60)]
async fn transport_loss_ends_call_without_error() {
    let relay = start_relay().await;
    let (a, b) = connected_pair(&relay).await;

    a.factory.fail_connectivity();
    let caller = a.wait_state(CallState::Idle).await;
    assert!(caller.error.is_none());
    let callee = b.wait_state(CallState::Idle).await;
    assert!(callee.error.is_none());
}

#[test_timeout::timeout(60)]
async fn second_caller_gets_busy_rejection() {
    let relay = start_relay().await;
    let (_a, b) = connected_pair(&relay).await;
    let c = Peer::join(&relay, "c@x").await;

    c.handle.initiate("b@x").expect("initiate");
    let snapshot = c.wait_state(CallState::Error).await;
    assert_eq!(snapshot.error.as_deref(), Some("Call rejected by b@x"));
    assert_eq!(b.handle.snapshot().state, CallState::InCall);
}
