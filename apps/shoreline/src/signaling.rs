//! WebSocket link to the relay: registers the identity, then pumps
//! envelopes between the socket and the call controller.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use shoreline_proto::{ChannelId, ClientEnvelope, ServerEnvelope};

use crate::call::CallHandle;
use crate::error::SignalingError;

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Normalizes a relay address into its WebSocket endpoint. Bare `host:port`
/// becomes `ws://host:port/ws`; `http(s)` maps to `ws(s)`; an empty path
/// gets `/ws`.
pub fn relay_ws_url(relay: &str) -> Result<Url, SignalingError> {
    let invalid = |reason: &str| SignalingError::InvalidUrl {
        url: relay.to_string(),
        reason: reason.to_string(),
    };
    let raw = relay.trim();
    if raw.is_empty() {
        return Err(invalid("empty"));
    }
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("ws://{raw}")
    };
    let mut url = Url::parse(&with_scheme).map_err(|err| invalid(&err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        _ => return Err(invalid("scheme must be ws, wss, http or https")),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("cannot switch scheme"))?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }
    Ok(url)
}

/// A registered relay connection. Dropping it leaves the tasks running
/// until the socket closes.
pub struct SignalingClient {
    identity: String,
    channel: ChannelId,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl SignalingClient {
    /// Connects, registers `identity` and starts forwarding. Envelopes
    /// received on `outbound` are written to the relay; everything the
    /// relay sends is delivered to `handle`.
    pub async fn connect(
        relay: &str,
        identity: &str,
        mut outbound: mpsc::UnboundedReceiver<ClientEnvelope>,
        handle: CallHandle,
    ) -> Result<Self, SignalingError> {
        let url = relay_ws_url(relay)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(err.to_string()))?;
        info!(%url, "connected to relay");
        let (mut sink, mut stream) = ws_stream.split();

        let register = ClientEnvelope::Register {
            identity: identity.to_string(),
        };
        let text = serde_json::to_string(&register)
            .map_err(|err| SignalingError::Connect(err.to_string()))?;
        sink.send(Message::Text(text))
            .await
            .map_err(|err| SignalingError::Connect(err.to_string()))?;

        let registration = timeout(REGISTRATION_TIMEOUT, async {
            while let Some(frame) = stream.next().await {
                let frame = frame.map_err(|err| SignalingError::Connect(err.to_string()))?;
                match decode(frame) {
                    Some(ServerEnvelope::Registered { identity, channel }) => {
                        return Ok((identity, channel));
                    }
                    Some(other) => {
                        if handle.deliver(other).is_err() {
                            return Err(SignalingError::Closed);
                        }
                    }
                    None => {}
                }
            }
            Err(SignalingError::Closed)
        })
        .await
        .map_err(|_| SignalingError::RegistrationTimeout)??;
        let (identity, channel) = registration;
        info!(%identity, %channel, "registered with relay");

        let writer = tokio::spawn(async move {
            let mut keepalive = interval(KEEPALIVE_INTERVAL);
            keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
            keepalive.tick().await;
            loop {
                let envelope = tokio::select! {
                    next = outbound.recv() => match next {
                        Some(envelope) => envelope,
                        None => break,
                    },
                    _ = keepalive.tick() => ClientEnvelope::Ping,
                };
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, kind = envelope.kind(), "failed to encode envelope");
                        continue;
                    }
                };
                trace!(kind = envelope.kind(), "sending envelope");
                if let Err(err) = sink.send(Message::Text(text)).await {
                    error!(error = %err, "relay write failed");
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("relay writer stopped");
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        error!(error = %err, "relay read failed");
                        break;
                    }
                };
                if matches!(frame, Message::Close(_)) {
                    break;
                }
                if let Some(envelope) = decode(frame) {
                    trace!(kind = envelope.kind(), "received envelope");
                    if handle.deliver(envelope).is_err() {
                        debug!("call controller gone; stopping relay reader");
                        break;
                    }
                }
            }
            info!("relay connection closed");
        });

        Ok(Self {
            identity,
            channel,
            writer,
            reader,
        })
    }

    /// Identity the relay bound this connection to.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Resolves when the relay side of the connection ends.
    pub async fn closed(&mut self) {
        if !self.reader.is_finished() {
            let _ = (&mut self.reader).await;
        }
    }

    /// Stops reading from the relay. The writer keeps draining until the
    /// controller drops its outbound sender, then closes the socket.
    pub async fn close(self) {
        self.reader.abort();
        if timeout(WRITER_DRAIN_TIMEOUT, self.writer).await.is_err() {
            debug!("relay writer still busy; detaching");
        }
    }
}

fn decode(frame: Message) -> Option<ServerEnvelope> {
    let text = match frame {
        Message::Text(text) => text,
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                warn!("non-utf8 binary frame from relay dropped");
                return None;
            }
        },
        _ => return None,
    };
    match serde_json::from_str(&text) {
        Ok(envelope) => Some(envelope),
        Err(err) => {
            warn!(error = %err, "unparsable relay frame dropped");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn relay_urls_are_normalized() {
        let cases = [
            ("localhost:8080", "ws://localhost:8080/ws"),
            ("ws://relay.example", "ws://relay.example/ws"),
            ("https://relay.example/", "wss://relay.example/ws"),
            ("http://127.0.0.1:9000", "ws://127.0.0.1:9000/ws"),
            ("wss://relay.example/custom", "wss://relay.example/custom"),
        ];
        for (input, expected) in cases {
            assert_eq!(relay_ws_url(input).expect(input).as_str(), expected);
        }
    }

    #[test_timeout::timeout]
    fn bad_relay_urls_are_rejected() {
        assert!(matches!(relay_ws_url(""), Err(SignalingError::InvalidUrl { .. })));
        assert!(matches!(
            relay_ws_url("ftp://relay.example"),
            Err(SignalingError::InvalidUrl { .. })
        ));
    }

    #[test_timeout::timeout]
    fn decode_drops_garbage() {
        assert!(decode(Message::Text("nope".into())).is_none());
        assert!(decode(Message::Binary(vec![0xff, 0xfe])).is_none());
        assert_eq!(
            decode(Message::Text("{\"type\":\"pong\"}".into())),
            Some(ServerEnvelope::Pong)
        );
    }
}
