use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::call::MediaPolicy;
use crate::config::{ClientConfig, DEFAULT_RELAY_URL};
use crate::logging::{LogConfig, LogLevel};
use crate::transport::IceConfig;

#[derive(Parser, Debug)]
#[command(name = "shoreline")]
#[command(about = "Place and answer peer-to-peer video calls")]
pub struct Cli {
    /// Relay address (host:port, ws:// or http:// URL)
    #[arg(long, env = "SHORELINE_RELAY_URL", default_value = DEFAULT_RELAY_URL)]
    pub relay: String,

    /// Identity to register under, e.g. alice@example.com
    #[arg(long, env = "SHORELINE_IDENTITY")]
    pub identity: String,

    /// What to do with camera and microphone between calls
    #[arg(long, value_enum, default_value_t = MediaPolicy::KeepWarm)]
    pub media_policy: MediaPolicy,

    /// Skip STUN/TURN and gather host candidates only
    #[arg(long)]
    pub localhost_only: bool,

    #[arg(long, value_enum, env = "SHORELINE_LOG_LEVEL", default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "SHORELINE_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Call another identity
    Dial { target: String },
    /// Wait for incoming calls
    Listen {
        /// Answer every incoming call without prompting
        #[arg(long)]
        auto_accept: bool,
    },
}

impl Cli {
    pub fn into_parts(self) -> (ClientConfig, LogConfig, Command) {
        let mut config = ClientConfig::new(self.relay, self.identity);
        config.media_policy = self.media_policy;
        if self.localhost_only {
            config.ice = IceConfig::localhost();
        }
        let log = LogConfig {
            level: self.log_level,
            file: self.log_file,
        };
        (config, log, self.command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn dial_with_flags() {
        let cli = Cli::parse_from([
            "shoreline",
            "--relay",
            "localhost:9000",
            "--identity",
            "a@x",
            "--media-policy",
            "release-on-teardown",
            "--localhost-only",
            "dial",
            "b@x",
        ]);
        let (config, log, command) = cli.into_parts();
        assert_eq!(config.relay_url, "localhost:9000");
        assert_eq!(config.identity, "a@x");
        assert_eq!(config.media_policy, MediaPolicy::ReleaseOnTeardown);
        assert!(config.ice.servers.is_empty());
        assert_eq!(log.level, LogLevel::Warn);
        assert_eq!(command, Command::Dial { target: "b@x".into() });
    }

    #[test_timeout::timeout]
    fn listen_defaults() {
        let cli = Cli::parse_from(["shoreline", "--identity", "b@x", "listen", "--auto-accept"]);
        let (config, _, command) = cli.into_parts();
        assert_eq!(config.media_policy, MediaPolicy::KeepWarm);
        assert_eq!(command, Command::Listen { auto_accept: true });
    }
}
