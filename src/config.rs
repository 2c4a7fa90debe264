//! Configuration surface consumed by the mesh core and, unmodified, by its
//! external collaborators (GUI, AI client). Mirrors the flat key set of the
//! original `config_t`, grouped into sub-structs the way this codebase's
//! other config types are grouped.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Root configuration, loaded from a single TOML file.
///
/// Only [`CoreConfig`]'s six fields are consumed by the mesh core itself
/// ([`CoreConfig::server_url`], `membership_port`, `gossip_interval_ms`,
/// `probe_timeout_ms`, `suspect_timeout_ms`, `is_main`). Everything else is
/// read by external collaborators that happen to share this file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub core: CoreConfig,
    pub ai: AiConfig,
    pub features: FeatureFlags,
    pub tts: TtsConfig,
    pub ui: UiConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            ai: AiConfig::default(),
            features: FeatureFlags::default(),
            tts: TtsConfig::default(),
            ui: UiConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. A missing or malformed file is
    /// a configuration-fatal error, per the error taxonomy.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("cannot read {}: {e}", path.display()),
            field: None,
        })?;
        toml::from_str(&text).map_err(|e| Error::Config {
            message: format!("malformed config at {}: {e}", path.display()),
            field: None,
        })
    }

    /// Serialize configuration back to TOML, for collaborators that persist
    /// edits (e.g. a settings dialog). The core never calls this itself.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config {
            message: format!("cannot serialize config: {e}"),
            field: None,
        })?;
        std::fs::write(path.as_ref(), text).map_err(|e| Error::Config {
            message: format!("cannot write {}: {e}", path.as_ref().display()),
            field: None,
        })
    }
}

/// The six fields the mesh core actually reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// URL of the remote aggregator the [`crate::transport`] façade connects to.
    pub server_url: String,
    /// Bearer token sent during the transport handshake; opaque to the core.
    pub auth_token: String,
    /// Client identifier reported to the remote aggregator.
    pub client_id: String,
    /// UDP port the local Membership Engine binds.
    pub membership_port: u16,
    /// Gossip round interval, milliseconds.
    pub gossip_interval_ms: u32,
    /// Direct probe timeout, milliseconds.
    pub probe_timeout_ms: u32,
    /// Suspect-to-dead timeout, milliseconds.
    pub suspect_timeout_ms: u32,
    /// Whether this instance starts as the coordinator's main node.
    pub is_main: bool,
    /// Whether the transport façade should connect automatically at start.
    pub auto_connect: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9001".to_string(),
            auth_token: String::new(),
            client_id: "lsdamm-node".to_string(),
            membership_port: 7946,
            gossip_interval_ms: 1000,
            probe_timeout_ms: 500,
            suspect_timeout_ms: 5000,
            is_main: false,
            auto_connect: true,
        }
    }
}

/// AI provider settings. Not read by the core; carried for collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub default_provider: String,
    pub default_model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            default_provider: "anthropic".to_string(),
            default_model: "claude".to_string(),
            max_tokens: 4096,
            temperature: 0.7,
        }
    }
}

/// Feature toggles. Not read by the core; carried for collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub enable_extended_thinking: bool,
    pub enable_vision: bool,
    pub enable_tts: bool,
    pub enable_attachments: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_extended_thinking: false,
            enable_vision: false,
            enable_tts: false,
            enable_attachments: true,
        }
    }
}

/// Text-to-speech settings. Not read by the core; carried for collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub voice: String,
    pub speed: f32,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            voice: "default".to_string(),
            speed: 1.0,
        }
    }
}

/// Desktop UI settings. Not read by the core; carried for collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiConfig {
    pub dark_mode: bool,
    pub window_width: u16,
    pub window_height: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            dark_mode: true,
            window_width: 1024,
            window_height: 768,
        }
    }
}

/// Logging settings, read by [`crate::init_logging`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Path to a log file; empty means log to stdout.
    pub log_file: String,
    /// `tracing` level filter, e.g. "info", "debug".
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_file: String::new(),
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = Config::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.core.membership_port, cfg.core.membership_port);
        assert_eq!(parsed.core.gossip_interval_ms, cfg.core.gossip_interval_ms);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = Config::load("/nonexistent/path/does-not-exist.toml").unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let text = r#"
            [core]
            membership_port = 8000
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.core.membership_port, 8000);
        assert_eq!(cfg.core.gossip_interval_ms, 1000);
    }
}
