use webrtc::ice_transport::ice_server::RTCIceServer;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_TURN_URL: &str = "turn:openrelay.metered.ca:80";
pub const DEFAULT_TURN_USERNAME: &str = "openrelayproject";
pub const DEFAULT_TURN_CREDENTIAL: &str = "openrelayproject";

/// One traversal helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(urls: Vec<String>) -> Self {
        Self {
            urls,
            username: None,
            credential: None,
        }
    }

    pub fn turn(urls: Vec<String>, username: String, credential: String) -> Self {
        Self {
            urls,
            username: Some(username),
            credential: Some(credential),
        }
    }
}

impl From<&IceServer> for RTCIceServer {
    fn from(server: &IceServer) -> Self {
        RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Traversal helpers every session transport is configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                IceServer::stun(vec![DEFAULT_STUN_URL.to_string()]),
                IceServer::turn(
                    vec![DEFAULT_TURN_URL.to_string()],
                    DEFAULT_TURN_USERNAME.to_string(),
                    DEFAULT_TURN_CREDENTIAL.to_string(),
                ),
            ],
        }
    }
}

impl IceConfig {
    /// Host candidates only.
    pub fn localhost() -> Self {
        Self { servers: vec![] }
    }

    pub fn builder() -> IceConfigBuilder {
        IceConfigBuilder::default()
    }

    /// Defaults overridden by `SHORELINE_STUN_URLS` / `SHORELINE_TURN_URLS`
    /// (comma separated) and the TURN credentials. `SHORELINE_LOCALHOST_ONLY`
    /// wins over everything else.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        if lookup("SHORELINE_LOCALHOST_ONLY").is_some() {
            return Self::localhost();
        }

        let stun = lookup("SHORELINE_STUN_URLS").map(|raw| split_urls(&raw));
        let turn = lookup("SHORELINE_TURN_URLS").map(|raw| split_urls(&raw));
        let username = lookup("SHORELINE_TURN_USERNAME")
            .unwrap_or_else(|| DEFAULT_TURN_USERNAME.to_string());
        let credential = lookup("SHORELINE_TURN_CREDENTIAL")
            .unwrap_or_else(|| DEFAULT_TURN_CREDENTIAL.to_string());

        let mut builder = Self::builder();
        match stun {
            Some(urls) if !urls.is_empty() => builder = builder.stun(urls),
            Some(_) => {}
            None => builder = builder.stun(vec![DEFAULT_STUN_URL.to_string()]),
        }
        match turn {
            Some(urls) if !urls.is_empty() => builder = builder.turn(urls, username, credential),
            Some(_) => {}
            None => {
                builder = builder.turn(vec![DEFAULT_TURN_URL.to_string()], username, credential)
            }
        }
        builder.build()
    }

    pub fn rtc_servers(&self) -> Vec<RTCIceServer> {
        self.servers.iter().map(RTCIceServer::from).collect()
    }
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Default)]
pub struct IceConfigBuilder {
    servers: Vec<IceServer>,
}

impl IceConfigBuilder {
    pub fn stun(mut self, urls: Vec<String>) -> Self {
        self.servers.push(IceServer::stun(urls));
        self
    }

    pub fn turn(mut self, urls: Vec<String>, username: String, credential: String) -> Self {
        self.servers.push(IceServer::turn(urls, username, credential));
        self
    }

    pub fn build(self) -> IceConfig {
        IceConfig {
            servers: self.servers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test_timeout::timeout]
    fn defaults_carry_stun_and_turn() {
        let config = IceConfig::default();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].urls, vec![DEFAULT_STUN_URL]);
        assert_eq!(config.servers[1].username.as_deref(), Some("openrelayproject"));
        assert_eq!(IceConfig::from_lookup(lookup(&[])), config);

        let rtc = config.rtc_servers();
        assert_eq!(rtc[1].credential, DEFAULT_TURN_CREDENTIAL);
        assert!(rtc[0].username.is_empty());
    }

    #[test_timeout::timeout]
    fn environment_overrides_helpers() {
        let config = IceConfig::from_lookup(lookup(&[
            ("SHORELINE_STUN_URLS", "stun:a:3478, stun:b:3478"),
            ("SHORELINE_TURN_URLS", "turn:t:3478"),
            ("SHORELINE_TURN_USERNAME", "u"),
            ("SHORELINE_TURN_CREDENTIAL", "p"),
        ]));
        assert_eq!(
            config.servers,
            vec![
                IceServer::stun(vec!["stun:a:3478".into(), "stun:b:3478".into()]),
                IceServer::turn(vec!["turn:t:3478".into()], "u".into(), "p".into()),
            ]
        );
    }

    #[test_timeout::timeout]
    fn localhost_only_clears_helpers() {
        let config = IceConfig::from_lookup(lookup(&[
            ("SHORELINE_LOCALHOST_ONLY", "1"),
            ("SHORELINE_STUN_URLS", "stun:a:3478"),
        ]));
        assert!(config.servers.is_empty());
    }
}
