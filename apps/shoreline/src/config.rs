use crate::call::{CallOptions, MediaPolicy};
use crate::error::SignalingError;
use crate::media::MediaConstraints;
use crate::signaling::relay_ws_url;
use crate::transport::IceConfig;

pub const DEFAULT_RELAY_URL: &str = "ws://localhost:8080/ws";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error(transparent)]
    Relay(#[from] SignalingError),
}

/// Everything one client process needs to place and answer calls.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_url: String,
    pub identity: String,
    pub ice: IceConfig,
    pub media_policy: MediaPolicy,
    pub constraints: MediaConstraints,
}

impl ClientConfig {
    /// Relay and identity as given; traversal helpers from the environment.
    pub fn new(relay_url: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            identity: identity.into(),
            ice: IceConfig::from_env(),
            media_policy: MediaPolicy::default(),
            constraints: MediaConstraints::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.trim().is_empty() {
            return Err(ConfigError::EmptyIdentity);
        }
        relay_ws_url(&self.relay_url)?;
        Ok(())
    }

    pub fn call_options(&self) -> CallOptions {
        CallOptions::new(self.identity.trim()).with_media_policy(self.media_policy)
    }
}
