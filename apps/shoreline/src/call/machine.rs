use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use shoreline_proto::{CandidatePayload, ChannelId, ClientEnvelope, ServerEnvelope, SessionPayload};

use super::{
    CallEvent, CallOptions, CallRole, CallSnapshot, CallState, MediaPolicy, SetupCompletion,
    SetupOutput,
};
use crate::error::{CallFailure, TransportError};
use crate::media::{MediaGuard, MediaStreamHandle, RemoteMediaStream};
use crate::transport::{
    ConnectivityState, SessionTransport, TransportEvent, TransportEventKind, TransportEventSender,
    TransportEvents, TransportFactory,
};

const START_FAILED: &str = "Failed to start call";
const ANSWER_FAILED: &str = "Failed to answer call";
const CONNECT_FAILED: &str = "Failed to connect call";

/// Single-session call state machine. Owned by the controller task; every
/// transition runs to completion before the next event is read.
pub(crate) struct CallMachine {
    identity: String,
    policy: MediaPolicy,
    factory: Arc<dyn TransportFactory>,
    media: Arc<MediaGuard>,
    outbound: mpsc::UnboundedSender<ClientEnvelope>,
    completions: mpsc::WeakUnboundedSender<CallEvent>,
    transport_events: TransportEventSender,
    snapshot: watch::Sender<CallSnapshot>,

    generation: u64,
    state: CallState,
    role: Option<CallRole>,
    remote_user: Option<String>,
    remote_channel: Option<ChannelId>,
    transport: Option<Arc<SessionTransport>>,
    pending_offer: Option<SessionPayload>,
    queued_remote: Vec<CandidatePayload>,
    queued_local: Vec<CandidatePayload>,
    local_stream: Option<MediaStreamHandle>,
    remote_stream: Option<RemoteMediaStream>,
    is_loading: bool,
    failure: Option<CallFailure>,
}

impl CallMachine {
    pub(crate) fn new(
        options: CallOptions,
        factory: Arc<dyn TransportFactory>,
        media: Arc<MediaGuard>,
        outbound: mpsc::UnboundedSender<ClientEnvelope>,
        completions: mpsc::WeakUnboundedSender<CallEvent>,
        transport_events: TransportEventSender,
        snapshot: watch::Sender<CallSnapshot>,
    ) -> Self {
        Self {
            identity: options.identity,
            policy: options.media_policy,
            factory,
            media,
            outbound,
            completions,
            transport_events,
            snapshot,
            generation: 0,
            state: CallState::Idle,
            role: None,
            remote_user: None,
            remote_channel: None,
            transport: None,
            pending_offer: None,
            queued_remote: Vec::new(),
            queued_local: Vec::new(),
            local_stream: None,
            remote_stream: None,
            is_loading: false,
            failure: None,
        }
    }

    pub(crate) async fn handle(&mut self, event: CallEvent) {
        trace!(state = %self.state, ?event, "call event");
        let before = self.state;
        match event {
            CallEvent::Initiate { target } => self.initiate(target).await,
            CallEvent::Accept => self.accept().await,
            CallEvent::Reject => self.reject().await,
            CallEvent::HangUp => self.hang_up().await,
            CallEvent::Reset => {
                if self.state == CallState::Error {
                    self.teardown().await;
                }
            }
            CallEvent::Signal(envelope) => self.on_signal(envelope).await,
            CallEvent::Transport(event) => self.on_transport(event).await,
            CallEvent::SetupCompleted(completion) => self.on_setup(completion).await,
        }
        if before != self.state {
            info!(from = %before, to = %self.state, "call state changed");
        }
        self.publish();
    }

    /// Tears down whatever is live and stops local media regardless of
    /// policy; used when the controller stops.
    pub(crate) async fn shutdown(&mut self) {
        if let (CallState::InCall | CallState::Calling, Some(channel)) = (self.state, self.remote_channel) {
            self.send(ClientEnvelope::CallEnd {
                target_channel: channel,
            });
        }
        self.teardown().await;
        self.media.release();
        self.publish();
    }

    fn publish(&self) {
        self.snapshot.send_replace(CallSnapshot {
            state: self.state,
            role: self.role,
            remote_user: self.remote_user.clone(),
            local_stream: self.local_stream.clone(),
            remote_stream: self.remote_stream.clone(),
            is_loading: self.is_loading,
            error: self.failure.as_ref().map(ToString::to_string),
            failure: self.failure.clone(),
        });
    }

    fn send(&self, envelope: ClientEnvelope) {
        debug!(kind = envelope.kind(), "outbound envelope");
        if self.outbound.send(envelope).is_err() {
            warn!("signaling channel closed; envelope dropped");
        }
    }

    async fn initiate(&mut self, target: String) {
        let target = target.trim().to_string();
        if self.state != CallState::Idle {
            warn!(state = %self.state, "cannot start a call while another is active");
            return;
        }
        if target.is_empty() {
            warn!("call target is empty");
            return;
        }

        self.generation += 1;
        self.state = CallState::Calling;
        self.role = Some(CallRole::Caller);
        self.remote_user = Some(target.clone());
        self.is_loading = true;
        self.failure = None;
        info!(%target, generation = self.generation, "placing call");

        let Some(transport) = self.open_transport().await else {
            self.fail(CallFailure::Negotiation(START_FAILED.into())).await;
            return;
        };
        let generation = self.generation;
        self.spawn_setup(transport, move |transport| async move {
            let stream = transport.attach_local_media().await?;
            let description = transport.produce_offer().await?;
            Ok::<_, TransportError>(SetupOutput {
                stream,
                description,
            })
        });
        debug!(generation, "offer setup started");
    }

    async fn accept(&mut self) {
        if self.state != CallState::Incoming {
            debug!(state = %self.state, "nothing to accept");
            return;
        }
        let Some(offer) = self.pending_offer.take() else {
            self.fail(CallFailure::Negotiation(ANSWER_FAILED.into())).await;
            return;
        };

        self.state = CallState::InCall;
        self.is_loading = true;
        let Some(transport) = self.open_transport().await else {
            self.fail(CallFailure::Negotiation(ANSWER_FAILED.into())).await;
            return;
        };
        for candidate in std::mem::take(&mut self.queued_remote) {
            if let Err(err) = transport.add_remote_candidate(candidate).await {
                warn!(error = %err, "queued candidate rejected");
            }
        }
        self.spawn_setup(transport, move |transport| async move {
            let stream = transport.attach_local_media().await?;
            transport.apply_remote_description(offer).await?;
            let description = transport.produce_answer().await?;
            Ok::<_, TransportError>(SetupOutput {
                stream,
                description,
            })
        });
    }

    async fn reject(&mut self) {
        if self.state != CallState::Incoming {
            debug!(state = %self.state, "nothing to reject");
            return;
        }
        if let Some(channel) = self.remote_channel {
            self.send(ClientEnvelope::CallReject {
                caller_channel: channel,
            });
        }
        self.teardown().await;
    }

    async fn hang_up(&mut self) {
        match self.state {
            CallState::Idle => {}
            CallState::Error => self.teardown().await,
            CallState::Incoming => self.reject().await,
            CallState::Calling | CallState::InCall => {
                if let Some(channel) = self.remote_channel {
                    self.send(ClientEnvelope::CallEnd {
                        target_channel: channel,
                    });
                }
                self.teardown().await;
            }
        }
    }

    async fn on_signal(&mut self, envelope: ServerEnvelope) {
        match envelope {
            ServerEnvelope::Registered { identity, channel } => {
                debug!(%identity, %channel, "registration acknowledged");
            }
            ServerEnvelope::Incoming {
                caller_identity,
                caller_channel,
                offer,
            } => self.on_incoming(caller_identity, caller_channel, offer),
            ServerEnvelope::CallRinging {
                callee_identity,
                callee_channel,
            } => {
                let ours = self.state == CallState::Calling
                    && self.remote_channel.is_none()
                    && self.remote_user.as_deref() == Some(callee_identity.as_str());
                if ours {
                    debug!(%callee_identity, %callee_channel, "callee is ringing");
                    self.bind_remote_channel(callee_channel);
                } else {
                    self.end_orphaned(callee_channel, "ringing");
                }
            }
            ServerEnvelope::CallAnswered {
                answer,
                answerer_identity,
                answerer_channel,
            } => {
                if self.state != CallState::Calling
                    || self.remote_channel.is_some_and(|known| known != answerer_channel)
                {
                    self.end_orphaned(answerer_channel, "call-answered");
                    return;
                }
                if let Some(identity) = answerer_identity {
                    self.remote_user = Some(identity);
                }
                self.bind_remote_channel(answerer_channel);
                self.apply_answer(answer).await;
            }
            ServerEnvelope::CallRejected { rejector_identity } => {
                if self.state != CallState::Calling {
                    debug!(state = %self.state, "stray call-rejected ignored");
                    return;
                }
                let rejector = rejector_identity.or_else(|| self.remote_user.clone());
                self.fail(CallFailure::Rejected { rejector }).await;
            }
            ServerEnvelope::ReceiveOffer { from_channel, .. } => {
                if self.state == CallState::Idle {
                    debug!(%from_channel, "offer outside a session dropped");
                    return;
                }
                warn!(%from_channel, "renegotiation is not supported");
                if let Some(channel) = self.remote_channel {
                    self.send(ClientEnvelope::CallEnd {
                        target_channel: channel,
                    });
                }
                self.fail(CallFailure::RenegotiationUnsupported).await;
            }
            ServerEnvelope::ReceiveAnswer {
                answer,
                from_channel,
            } => {
                if !matches!(self.state, CallState::Calling | CallState::InCall)
                    || !self.from_peer(from_channel)
                {
                    debug!(%from_channel, "stray answer ignored");
                    return;
                }
                let applied = match &self.transport {
                    Some(transport) => transport.has_remote_description().await,
                    None => true,
                };
                if applied {
                    debug!(%from_channel, "answer after remote description ignored");
                    return;
                }
                self.bind_remote_channel(from_channel);
                self.apply_answer(answer).await;
            }
            ServerEnvelope::IceCandidate {
                candidate,
                from_channel,
            } => self.on_remote_candidate(candidate, from_channel).await,
            ServerEnvelope::CallEnded { from_channel } => {
                if !self.from_peer(from_channel) {
                    debug!(%from_channel, "call-ended from unrelated channel ignored");
                    return;
                }
                match self.state {
                    CallState::Calling => {
                        let peer = self.remote_user.clone();
                        self.fail(CallFailure::RemoteEnded { peer }).await;
                    }
                    CallState::Incoming | CallState::InCall => {
                        info!(peer = ?self.remote_user, "peer ended the call");
                        self.teardown().await;
                    }
                    CallState::Idle | CallState::Error => {}
                }
            }
            ServerEnvelope::CallError { message, reason } => {
                if self.state == CallState::Calling {
                    self.fail(CallFailure::Relay { reason, message }).await;
                } else {
                    warn!(%message, ?reason, "relay error outside an outbound call");
                }
            }
            ServerEnvelope::Pong => trace!("pong"),
        }
    }

    fn on_incoming(&mut self, caller_identity: String, caller_channel: ChannelId, offer: SessionPayload) {
        if self.state != CallState::Idle {
            info!(%caller_identity, state = %self.state, "busy; rejecting incoming call");
            self.send(ClientEnvelope::CallReject { caller_channel });
            return;
        }
        self.generation += 1;
        self.state = CallState::Incoming;
        self.role = Some(CallRole::Callee);
        self.remote_user = Some(caller_identity.clone());
        self.remote_channel = Some(caller_channel);
        self.pending_offer = Some(offer);
        self.queued_remote.clear();
        self.failure = None;
        info!(%caller_identity, %caller_channel, "incoming call");
    }

    async fn on_remote_candidate(&mut self, candidate: CandidatePayload, from_channel: ChannelId) {
        if !self.from_peer(from_channel) {
            debug!(%from_channel, "candidate from unrelated channel dropped");
            return;
        }
        match (self.state, &self.transport) {
            (CallState::Incoming, _) => self.queued_remote.push(candidate),
            (CallState::Calling | CallState::InCall, Some(transport)) => {
                if let Err(err) = transport.add_remote_candidate(candidate).await {
                    warn!(error = %err, "remote candidate rejected");
                }
            }
            _ => debug!(state = %self.state, "candidate outside a session dropped"),
        }
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        if event.generation != self.generation || self.transport.is_none() {
            trace!(event = event.generation, current = self.generation, "stale transport event");
            return;
        }
        match event.kind {
            TransportEventKind::LocalCandidate(candidate) => match self.remote_channel {
                Some(channel) => self.send(ClientEnvelope::IceCandidate {
                    target_channel: channel,
                    candidate,
                }),
                None => self.queued_local.push(candidate),
            },
            TransportEventKind::RemoteStream(stream) => match &mut self.remote_stream {
                Some(current) if current.id == stream.id => current.merge(stream),
                slot => *slot = Some(stream),
            },
            TransportEventKind::Connectivity(state) => self.on_connectivity(state).await,
        }
    }

    async fn on_connectivity(&mut self, connectivity: ConnectivityState) {
        match (self.state, connectivity) {
            (CallState::InCall, ConnectivityState::Connected) => {
                info!(peer = ?self.remote_user, "media connected");
            }
            (CallState::InCall, state) if state.is_lost() => {
                info!(?state, "peer connection lost; ending call");
                if let Some(channel) = self.remote_channel {
                    self.send(ClientEnvelope::CallEnd {
                        target_channel: channel,
                    });
                }
                self.teardown().await;
            }
            (CallState::Calling, state) if state.is_lost() => {
                self.fail(CallFailure::TransportFailed).await;
            }
            (_, state) => debug!(?state, "connectivity update"),
        }
    }

    async fn on_setup(&mut self, completion: SetupCompletion) {
        let SetupCompletion {
            generation,
            transport,
            result,
        } = completion;
        let current = self
            .transport
            .as_ref()
            .is_some_and(|live| Arc::ptr_eq(live, &transport));
        if generation != self.generation || !current {
            debug!(generation, current = self.generation, "discarding stale setup");
            transport.destroy().await;
            return;
        }

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, "call setup failed");
                let message = match self.role {
                    Some(CallRole::Callee) => ANSWER_FAILED,
                    _ => START_FAILED,
                };
                self.fail(CallFailure::Negotiation(message.into())).await;
                return;
            }
        };

        self.local_stream = Some(output.stream);
        match (self.state, self.role) {
            (CallState::Calling, Some(CallRole::Caller)) => {
                let Some(callee) = self.remote_user.clone() else {
                    self.fail(CallFailure::Negotiation(START_FAILED.into())).await;
                    return;
                };
                self.send(ClientEnvelope::CallRequest {
                    callee_identity: callee,
                    caller_identity: self.identity.clone(),
                    offer: output.description,
                });
                self.is_loading = false;
            }
            (CallState::InCall, Some(CallRole::Callee)) => {
                let Some(channel) = self.remote_channel else {
                    self.fail(CallFailure::Negotiation(ANSWER_FAILED.into())).await;
                    return;
                };
                self.send(ClientEnvelope::CallAnswer {
                    caller_channel: channel,
                    answer: output.description,
                });
                self.flush_local_candidates(channel);
                self.is_loading = false;
            }
            (state, role) => debug!(%state, ?role, "setup finished in unexpected state"),
        }
    }

    async fn apply_answer(&mut self, answer: SessionPayload) {
        let Some(transport) = self.transport.clone() else {
            self.fail(CallFailure::Negotiation(CONNECT_FAILED.into())).await;
            return;
        };
        match transport.apply_remote_description(answer).await {
            Ok(()) => {
                self.state = CallState::InCall;
                self.is_loading = false;
            }
            Err(err) => {
                warn!(error = %err, "remote answer rejected");
                self.fail(CallFailure::Negotiation(CONNECT_FAILED.into())).await;
            }
        }
    }

    fn bind_remote_channel(&mut self, channel: ChannelId) {
        if self.remote_channel.is_none() {
            self.remote_channel = Some(channel);
        }
        if let Some(channel) = self.remote_channel {
            self.flush_local_candidates(channel);
        }
    }

    fn flush_local_candidates(&mut self, channel: ChannelId) {
        for candidate in std::mem::take(&mut self.queued_local) {
            self.send(ClientEnvelope::IceCandidate {
                target_channel: channel,
                candidate,
            });
        }
    }

    /// Only the bound peer may steer the session. The relay delivers
    /// `call-ringing` ahead of anything the callee sends, so a caller has its
    /// peer bound before any of these arrive.
    fn from_peer(&self, channel: ChannelId) -> bool {
        self.remote_channel == Some(channel)
    }

    /// A peer is still acting on a call this side has already left. Tell it
    /// to stop, unless it is the current peer repeating itself.
    fn end_orphaned(&self, channel: ChannelId, what: &'static str) {
        if self.remote_channel == Some(channel) {
            debug!(%channel, what, "duplicate envelope from current peer ignored");
            return;
        }
        info!(%channel, what, state = %self.state, "peer still acting on an abandoned call; ending it");
        self.send(ClientEnvelope::CallEnd {
            target_channel: channel,
        });
    }

    async fn open_transport(&mut self) -> Option<Arc<SessionTransport>> {
        let events = TransportEvents::new(self.generation, self.transport_events.clone());
        match SessionTransport::create(self.factory.as_ref(), Arc::clone(&self.media), events).await {
            Ok(transport) => {
                let transport = Arc::new(transport);
                self.transport = Some(Arc::clone(&transport));
                Some(transport)
            }
            Err(err) => {
                warn!(error = %err, "failed to create transport");
                None
            }
        }
    }

    fn spawn_setup<F, Fut>(&self, transport: Arc<SessionTransport>, steps: F)
    where
        F: FnOnce(Arc<SessionTransport>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<SetupOutput, TransportError>> + Send + 'static,
    {
        let completions = self.completions.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = steps(Arc::clone(&transport)).await;
            let completion = SetupCompletion {
                generation,
                transport,
                result,
            };
            match completions.upgrade() {
                Some(tx) => {
                    if let Err(mpsc::error::SendError(CallEvent::SetupCompleted(completion))) =
                        tx.send(CallEvent::SetupCompleted(completion))
                    {
                        completion.transport.destroy().await;
                    }
                }
                None => completion.transport.destroy().await,
            }
        });
    }

    /// Ends the session in `error`. The peer identity stays visible until
    /// the user dismisses it.
    async fn fail(&mut self, failure: CallFailure) {
        warn!(peer = ?self.remote_user, %failure, "call failed");
        self.release_session().await;
        self.state = CallState::Error;
        self.failure = Some(failure);
    }

    /// Returns to idle. Safe to call repeatedly.
    async fn teardown(&mut self) {
        self.release_session().await;
        self.state = CallState::Idle;
        self.role = None;
        self.remote_user = None;
        self.failure = None;
    }

    async fn release_session(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.destroy().await;
        }
        self.generation += 1;
        self.remote_channel = None;
        self.pending_offer = None;
        self.queued_remote.clear();
        self.queued_local.clear();
        self.local_stream = None;
        self.remote_stream = None;
        self.is_loading = false;
        if self.policy == MediaPolicy::ReleaseOnTeardown {
            self.media.release();
        }
    }
}
