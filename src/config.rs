//! Environment configuration.
//!
//! Recognized variables: `PORT`, `STORAGE_PATH`, `LOG_LEVEL`,
//! `LIVEKIT_API_KEY`, `LIVEKIT_API_SECRET`, `LIVEKIT_URL`.

use std::path::PathBuf;

use crate::server::ServerConfig;
use crate::voice::LiveKitConfig;

/// Process configuration assembled from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub log_level: String,
    pub livekit: Option<LiveKitConfig>,
}

impl Config {
    pub fn from_env() -> Self {
        let mut server = ServerConfig::default();

        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            server.port = port;
        }
        if let Ok(path) = std::env::var("STORAGE_PATH") {
            if !path.is_empty() {
                server.storage_path = PathBuf::from(path);
            }
        }

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let livekit = LiveKitConfig::from_env();

        Self {
            server,
            log_level,
            livekit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        // Environment-dependent fields are exercised only for their
        // defaults; mutating the process environment races other tests.
        let config = Config::from_env();
        assert!(config.server.port > 0);
        assert!(!config.log_level.is_empty());
    }
}
