//! Client configuration with environment overrides.

use crate::commands::CommandPolicy;
use crate::ws::connection::ReconnectConfig;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base HTTP URL of the server, e.g. `http://localhost:8080`.
    pub server_url: String,
    /// Bearer credential supplied by the authentication collaborator.
    /// Without one the push channel cannot be opened (fatal, not retried);
    /// only the public endpoints remain reachable.
    pub token: Option<String>,
    pub reconnect: ReconnectConfig,
    pub commands: CommandPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            token: None,
            reconnect: ReconnectConfig::default(),
            commands: CommandPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Build a configuration from environment variables.
    ///
    /// - `JAMROOM_SERVER_URL`: base HTTP URL (default `http://localhost:8080`)
    /// - `JAMROOM_TOKEN`: bearer credential
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(url) = std::env::var("JAMROOM_SERVER_URL") {
            if !url.is_empty() {
                cfg.server_url = url;
            }
        }
        if let Ok(token) = std::env::var("JAMROOM_TOKEN") {
            if !token.is_empty() {
                cfg.token = Some(token);
            }
        }
        cfg
    }

    /// Push-channel URL derived from the HTTP base URL, without the
    /// credential query parameter.
    pub fn ws_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{base}")
        };
        format!("{ws_base}/api/ws")
    }
}
