use dashmap::DashMap;
use shoreline_proto::{ChannelId, ServerEnvelope};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Outbound side of one live relay connection.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: ChannelId,
    tx: mpsc::UnboundedSender<ServerEnvelope>,
}

impl ChannelHandle {
    pub fn new(id: ChannelId, tx: mpsc::UnboundedSender<ServerEnvelope>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Queues an envelope for the connection's writer task. Returns `false`
    /// when the connection has already gone away; the envelope is dropped.
    pub fn deliver(&self, envelope: ServerEnvelope) -> bool {
        self.tx.send(envelope).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Identity → live channel bindings.
///
/// Each identity has at most one binding; registering again replaces it.
/// Mutation is exclusive per key, so concurrent connection tasks can
/// register, unregister and look up without a global lock.
#[derive(Debug, Default)]
pub struct Registry {
    bindings: DashMap<String, ChannelHandle>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `identity` to `channel`. Returns the channel this binding
    /// superseded, if any.
    pub fn register(&self, identity: &str, channel: ChannelHandle) -> Option<ChannelId> {
        let channel_id = channel.id();
        let previous = self
            .bindings
            .insert(identity.to_string(), channel)
            .map(|old| old.id())
            .filter(|old| *old != channel_id);
        match previous {
            Some(old) => info!(
                identity,
                channel = %channel_id,
                superseded = %old,
                "identity re-registered"
            ),
            None => info!(identity, channel = %channel_id, "identity registered"),
        }
        previous
    }

    /// Removes the binding only when it still points at `channel`. An
    /// unregister from a superseded channel leaves the fresher binding alone.
    pub fn unregister(&self, identity: &str, channel: ChannelId) -> bool {
        let removed = self
            .bindings
            .remove_if(identity, |_, bound| bound.id() == channel)
            .is_some();
        if removed {
            info!(identity, channel = %channel, "identity unregistered");
        } else {
            debug!(identity, channel = %channel, "ignoring stale unregister");
        }
        removed
    }

    pub fn lookup(&self, identity: &str) -> Option<ChannelHandle> {
        self.bindings.get(identity).map(|entry| entry.value().clone())
    }

    /// Sorted snapshot of the identities that currently have a channel.
    pub fn online(&self) -> Vec<String> {
        let mut identities: Vec<String> = self
            .bindings
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        identities.sort();
        identities
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;

    fn channel() -> (ChannelHandle, mpsc::UnboundedReceiver<ServerEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelHandle::new(ChannelId::new(), tx), rx)
    }

    #[test_timeout::timeout]
    fn later_registration_supersedes_earlier() {
        let registry = Registry::new();
        let (first, _rx1) = channel();
        let (second, _rx2) = channel();

        assert_eq!(registry.register("a@x", first.clone()), None);
        assert_eq!(registry.register("a@x", second.clone()), Some(first.id()));
        assert_eq!(registry.lookup("a@x").map(|c| c.id()), Some(second.id()));
        assert_eq!(registry.len(), 1);
    }

    #[test_timeout::timeout]
    fn re_registering_same_channel_is_idempotent() {
        let registry = Registry::new();
        let (only, _rx) = channel();
        registry.register("a@x", only.clone());
        assert_eq!(registry.register("a@x", only.clone()), None);
        assert_eq!(registry.lookup("a@x").map(|c| c.id()), Some(only.id()));
    }

    #[test_timeout::timeout]
    fn stale_unregister_keeps_fresh_binding() {
        let registry = Registry::new();
        let (old, _rx1) = channel();
        let (fresh, _rx2) = channel();
        registry.register("a@x", old.clone());
        registry.register("a@x", fresh.clone());

        assert!(!registry.unregister("a@x", old.id()));
        assert_eq!(registry.lookup("a@x").map(|c| c.id()), Some(fresh.id()));

        assert!(registry.unregister("a@x", fresh.id()));
        assert!(registry.lookup("a@x").is_none());
    }

    #[test_timeout::timeout]
    fn unknown_identity_is_not_found() {
        let registry = Registry::new();
        assert!(registry.lookup("ghost@x").is_none());
        assert!(!registry.unregister("ghost@x", ChannelId::new()));
    }

    #[test_timeout::timeout]
    fn online_is_sorted() {
        let registry = Registry::new();
        let (b, _rxb) = channel();
        let (a, _rxa) = channel();
        registry.register("b@x", b);
        registry.register("a@x", a);
        assert_eq!(registry.online(), vec!["a@x".to_string(), "b@x".to_string()]);
    }

    #[test_timeout::timeout]
    fn lookup_tracks_most_recent_unmatched_register() {
        // Replays a long seeded register/unregister script against a
        // plain map that applies the same rules.
        let registry = Registry::new();
        let identities = ["a@x", "b@x", "c@x"];
        let mut channels = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (handle, rx) = channel();
            channels.push(handle);
            receivers.push(rx);
        }
        let mut model: HashMap<&str, ChannelId> = HashMap::new();

        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..500 {
            let identity = identities[rng.gen_range(0..identities.len())];
            let handle = &channels[rng.gen_range(0..channels.len())];
            if rng.gen_bool(0.5) {
                registry.register(identity, handle.clone());
                model.insert(identity, handle.id());
            } else {
                registry.unregister(identity, handle.id());
                if model.get(identity) == Some(&handle.id()) {
                    model.remove(identity);
                }
            }
            for id in identities {
                assert_eq!(registry.lookup(id).map(|c| c.id()), model.get(id).copied());
            }
        }
    }

    #[test_timeout::timeout]
    fn deliver_reports_closed_channel() {
        let (handle, rx) = channel();
        assert!(handle.deliver(ServerEnvelope::Pong));
        drop(rx);
        assert!(handle.is_closed());
        assert!(!handle.deliver(ServerEnvelope::Pong));
    }
}
