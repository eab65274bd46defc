use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Newline-separated identity list. When unset every identity is
    /// treated as known and only presence is checked.
    pub directory_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env::var("SHORELINE_RELAY_HOST").unwrap_or(defaults.host),
            port: env::var("SHORELINE_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            directory_file: env::var("SHORELINE_DIRECTORY_FILE")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            directory_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn default_binds_all_interfaces() {
        let config = Config::default();
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert!(config.directory_file.is_none());
    }
}
