use dashmap::DashMap;
use shoreline_proto::{CallErrorReason, ChannelId, ClientEnvelope, ServerEnvelope};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::directory::Directory;
use crate::registry::{ChannelHandle, Registry};

/// Per-connection state owned by the connection task.
#[derive(Debug)]
pub struct ChannelSession {
    channel: ChannelHandle,
    identity: Option<String>,
}

impl ChannelSession {
    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }
}

/// Shared relay state: the identity registry, the live connection table and
/// the directory seam. Holds no per-call state; every envelope is routed on
/// its own.
#[derive(Clone)]
pub struct RelayState {
    registry: Arc<Registry>,
    connections: Arc<DashMap<ChannelId, ChannelHandle>>,
    directory: Arc<dyn Directory>,
}

impl RelayState {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            connections: Arc::new(DashMap::new()),
            directory,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Allocates a channel for a new connection. Envelopes routed to it are
    /// pushed into `tx`.
    pub fn connect(&self, tx: mpsc::UnboundedSender<ServerEnvelope>) -> ChannelSession {
        let channel = ChannelHandle::new(ChannelId::new(), tx);
        self.connections.insert(channel.id(), channel.clone());
        debug!(channel = %channel.id(), "channel connected");
        ChannelSession {
            channel,
            identity: None,
        }
    }

    pub fn disconnect(&self, session: &ChannelSession) {
        self.connections.remove(&session.id());
        if let Some(identity) = session.identity() {
            self.registry.unregister(identity, session.id());
        }
        debug!(channel = %session.id(), "channel disconnected");
    }

    /// Routes one envelope from `session`. Never fails: routing problems are
    /// reported to the sender as `call-error` or dropped with a diagnostic.
    pub async fn dispatch(&self, session: &mut ChannelSession, envelope: ClientEnvelope) {
        debug!(
            channel = %session.id(),
            kind = envelope.kind(),
            target = ?envelope.target_channel(),
            "dispatching envelope"
        );
        let from = session.id();
        match envelope {
            ClientEnvelope::Register { identity } => self.register(session, identity),
            ClientEnvelope::CallRequest {
                callee_identity,
                caller_identity,
                offer,
            } => {
                let caller_identity = session
                    .identity
                    .clone()
                    .unwrap_or(caller_identity);
                self.route_call_request(session, callee_identity, caller_identity, offer)
                    .await;
            }
            ClientEnvelope::CallAnswer {
                caller_channel,
                answer,
            } => {
                info!(
                    answerer = ?session.identity(),
                    caller_channel = %caller_channel,
                    "call answered"
                );
                self.forward(
                    from,
                    caller_channel,
                    ServerEnvelope::CallAnswered {
                        answer,
                        answerer_identity: session.identity.clone(),
                        answerer_channel: from,
                    },
                );
            }
            ClientEnvelope::CallReject { caller_channel } => {
                info!(
                    rejector = ?session.identity(),
                    caller_channel = %caller_channel,
                    "call rejected"
                );
                self.forward(
                    from,
                    caller_channel,
                    ServerEnvelope::CallRejected {
                        rejector_identity: session.identity.clone(),
                    },
                );
            }
            ClientEnvelope::Offer {
                target_channel,
                offer,
            } => {
                self.forward(
                    from,
                    target_channel,
                    ServerEnvelope::ReceiveOffer {
                        offer,
                        from_channel: from,
                    },
                );
            }
            ClientEnvelope::Answer {
                target_channel,
                answer,
            } => {
                self.forward(
                    from,
                    target_channel,
                    ServerEnvelope::ReceiveAnswer {
                        answer,
                        from_channel: from,
                    },
                );
            }
            ClientEnvelope::IceCandidate {
                target_channel,
                candidate,
            } => {
                self.forward(
                    from,
                    target_channel,
                    ServerEnvelope::IceCandidate {
                        candidate,
                        from_channel: from,
                    },
                );
            }
            ClientEnvelope::CallEnd { target_channel } => {
                info!(from = %from, target = %target_channel, "call ended");
                self.forward(
                    from,
                    target_channel,
                    ServerEnvelope::CallEnded { from_channel: from },
                );
            }
            ClientEnvelope::Ping => {
                session.channel.deliver(ServerEnvelope::Pong);
            }
        }
    }

    fn register(&self, session: &mut ChannelSession, identity: String) {
        let identity = identity.trim().to_string();
        if identity.is_empty() {
            warn!(channel = %session.id(), "dropping register with empty identity");
            return;
        }
        if let Some(previous) = session.identity.take() {
            if previous != identity {
                self.registry.unregister(&previous, session.id());
            }
        }
        self.registry.register(&identity, session.channel.clone());
        session.identity = Some(identity.clone());
        session.channel.deliver(ServerEnvelope::Registered {
            identity,
            channel: session.id(),
        });
    }

    async fn route_call_request(
        &self,
        session: &ChannelSession,
        callee_identity: String,
        caller_identity: String,
        offer: serde_json::Value,
    ) {
        info!(
            caller = %caller_identity,
            callee = %callee_identity,
            "call attempt"
        );

        let target = match self.resolve_callee(&callee_identity).await {
            Ok(target) => target,
            Err((reason, message)) => {
                info!(callee = %callee_identity, ?reason, "call request not routed");
                session
                    .channel
                    .deliver(ServerEnvelope::CallError { message, reason });
                return;
            }
        };

        let delivered = target.deliver(ServerEnvelope::Incoming {
            caller_identity,
            caller_channel: session.id(),
            offer,
        });
        if delivered {
            debug!(callee = %callee_identity, channel = %target.id(), "incoming call delivered");
            session.channel.deliver(ServerEnvelope::CallRinging {
                callee_identity,
                callee_channel: target.id(),
            });
        } else {
            // The binding outlived its connection by a few moments.
            let (reason, message) = self.unreachable(&callee_identity);
            session
                .channel
                .deliver(ServerEnvelope::CallError { message, reason });
        }
    }

    async fn resolve_callee(
        &self,
        callee_identity: &str,
    ) -> Result<ChannelHandle, (CallErrorReason, String)> {
        if self.directory.is_authoritative() {
            match self.directory.exists(callee_identity).await {
                Ok(true) => {}
                Ok(false) => {
                    return Err((
                        CallErrorReason::NotFound,
                        format!("User {callee_identity} not found"),
                    ))
                }
                Err(err) => {
                    warn!(callee = %callee_identity, "directory lookup failed: {err}");
                    return Err((
                        CallErrorReason::Unavailable,
                        "Failed to initiate call".to_string(),
                    ));
                }
            }
        }

        self.registry
            .lookup(callee_identity)
            .ok_or_else(|| self.unreachable(callee_identity))
    }

    fn unreachable(&self, callee_identity: &str) -> (CallErrorReason, String) {
        if self.directory.is_authoritative() {
            (
                CallErrorReason::Offline,
                format!("User {callee_identity} is not online"),
            )
        } else {
            (
                CallErrorReason::NotFound,
                format!("User {callee_identity} not found or offline"),
            )
        }
    }

    /// Fire-and-forget delivery to a channel. A missing or closed target
    /// means the peer is already gone; the envelope is dropped.
    fn forward(&self, from: ChannelId, target: ChannelId, envelope: ServerEnvelope) -> bool {
        let kind = envelope.kind();
        let Some(channel) = self.connections.get(&target).map(|entry| entry.value().clone())
        else {
            debug!(from = %from, target = %target, kind, "dropping envelope for unknown channel");
            return false;
        };
        let delivered = channel.deliver(envelope);
        if !delivered {
            debug!(from = %from, target = %target, kind, "dropping envelope for closed channel");
        }
        delivered
    }
}
