//! Call configuration loaded from TOML and environment.
//!
//! Precedence: env `COMPANION_CALL_CONFIG` path > `config/call.toml` > defaults, with
//! `COMPANION_CALL__*` variables layered on top. Credentials fall back to the
//! `MINIMAX_API_KEY` / `MINIMAX_GROUP_ID` variables the call backend itself reads.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Credentials sent once in the `activate` message.
///
/// Both values are optional here; the server rejects unauthenticated activation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            group_id: Some(group_id.into()),
        }
    }

    /// Fill missing values from `MINIMAX_API_KEY` / `MINIMAX_GROUP_ID`.
    pub fn with_env_fallback(mut self) -> Self {
        self.api_key = self.api_key.or_else(|| env_opt_string("MINIMAX_API_KEY"));
        self.group_id = self.group_id.or_else(|| env_opt_string("MINIMAX_GROUP_ID"));
        self
    }
}

/// Configuration for one client instance of the call subsystem.
///
/// | Key | Default | Description |
/// |-----|---------|-------------|
/// | api_base_url | http://127.0.0.1:8000 | REST base for `POST /api/call/start`. |
/// | ws_base_url | ws://127.0.0.1:8000 | WebSocket base for `/api/call/ws/{session_id}`. |
/// | language | zh-CN | Language the recognizer is pinned to. |
/// | end_grace_ms | 2000 | How long "call ended" stays visible before reset. |
/// | response_timeout_secs | 30 | Bound on a single outstanding turn. |
/// | frame_tick_ms | 16 | Mouth-shape animation tick (~60 fps). |
/// | ping_interval_secs | 15 | Keep-alive cadence while Active; 0 disables. |
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    pub api_base_url: String,
    pub ws_base_url: String,
    pub language: String,
    pub end_grace_ms: u64,
    pub response_timeout_secs: u64,
    pub frame_tick_ms: u64,
    pub ping_interval_secs: u64,
    #[serde(default)]
    pub credentials: Credentials,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8000".to_string(),
            ws_base_url: "ws://127.0.0.1:8000".to_string(),
            language: "zh-CN".to_string(),
            end_grace_ms: 2000,
            response_timeout_secs: 30,
            frame_tick_ms: 16,
            ping_interval_secs: 15,
            credentials: Credentials::default(),
        }
    }
}

impl CallConfig {
    /// Load config from file and environment.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("COMPANION_CALL_CONFIG").unwrap_or_else(|_| "config/call.toml".to_string());
        Self::load_from_path(Path::new(&config_path))
    }

    /// Load from a specific TOML path (skipped when absent), then environment.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let defaults = CallConfig::default();
        let builder = config::Config::builder()
            .set_default("api_base_url", defaults.api_base_url)?
            .set_default("ws_base_url", defaults.ws_base_url)?
            .set_default("language", defaults.language)?
            .set_default("end_grace_ms", defaults.end_grace_ms as i64)?
            .set_default("response_timeout_secs", defaults.response_timeout_secs as i64)?
            .set_default("frame_tick_ms", defaults.frame_tick_ms as i64)?
            .set_default("ping_interval_secs", defaults.ping_interval_secs as i64)?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("COMPANION_CALL").separator("__"))
            .build()?;

        let mut loaded: CallConfig = built.try_deserialize()?;
        loaded.credentials = loaded.credentials.with_env_fallback();
        Ok(loaded)
    }

    pub fn end_grace(&self) -> Duration {
        Duration::from_millis(self.end_grace_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn frame_tick(&self) -> Duration {
        Duration::from_millis(self.frame_tick_ms.max(1))
    }

    /// `None` when keep-alive pings are disabled.
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }

    /// WebSocket endpoint for one call session.
    pub fn ws_url(&self, session_id: &str) -> String {
        format!(
            "{}/api/call/ws/{}",
            self.ws_base_url.trim_end_matches('/'),
            session_id
        )
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_call_semantics() {
        let c = CallConfig::default();
        assert_eq!(c.end_grace(), Duration::from_secs(2));
        assert_eq!(c.response_timeout(), Duration::from_secs(30));
        assert_eq!(c.ping_interval(), Some(Duration::from_secs(15)));
        assert_eq!(c.language, "zh-CN");
    }

    #[test]
    fn ws_url_joins_without_double_slash() {
        let c = CallConfig {
            ws_base_url: "wss://calls.example.com/".to_string(),
            ..Default::default()
        };
        assert_eq!(c.ws_url("abc"), "wss://calls.example.com/api/call/ws/abc");
    }

    #[test]
    fn zero_ping_interval_disables_keepalive() {
        let c = CallConfig {
            ping_interval_secs: 0,
            ..Default::default()
        };
        assert!(c.ping_interval().is_none());
    }

    #[test]
    fn load_from_missing_path_uses_defaults() {
        let c = CallConfig::load_from_path(Path::new("does/not/exist.toml")).unwrap();
        assert_eq!(c.end_grace_ms, 2000);
        assert_eq!(c.frame_tick_ms, 16);
    }
}
