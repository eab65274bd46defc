use clap::Parser;
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "shoreline-relay")]
#[command(about = "Shoreline call signaling relay")]
pub struct Cli {
    /// Interface to bind (overrides SHORELINE_RELAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on (overrides SHORELINE_RELAY_PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Identity list used to tell unknown callees from offline ones
    /// (overrides SHORELINE_DIRECTORY_FILE)
    #[arg(short, long)]
    pub directory: Option<PathBuf>,
}

impl Cli {
    /// Layers command-line overrides on top of the environment config.
    pub fn apply(self, mut config: Config) -> Config {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(directory) = self.directory {
            config.directory_file = Some(directory);
        }
        config
    }
}
