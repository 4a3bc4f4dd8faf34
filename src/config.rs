//! Konfiguration
//!
//! Wird aus einer TOML-Datei geladen und von Kommandozeilen-Flags
//! überschrieben. Standardpfad:
//! - Linux: `~/.config/voxcall/config.toml`
//! - macOS: `~/Library/Application Support/org.voxcall.voxcall/config.toml`
//! - Windows: `%APPDATA%/voxcall/voxcall/config/config.toml`
//!
//! ```toml
//! [xmpp]
//! user = "alice@example.org"
//! password = "secret"
//!
//! [call]
//! setup_timeout_secs = 25
//! ```

use crate::call_engine::{EngineConfig, PLAYBACK_WAIT};
use crate::signaling::RelayOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Wrong JID: {0}")]
    InvalidJid(String),

    #[error("Invalid relay URL '{url}': {reason}")]
    InvalidRelayUrl { url: String, reason: String },
}

// ============================================================================
// CONFIG STRUCTS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub xmpp: XmppConfig,
    pub call: CallConfig,
}

/// Zugangsdaten und Relay
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XmppConfig {
    /// Relay-Host; leer = Domain der JID
    pub host: String,
    /// Eigene JID (`user@domain`)
    pub user: String,
    pub password: String,
    pub no_tls: bool,
    pub debug: bool,
    /// Vollständige WebSocket-URL, überschreibt `host`
    pub relay_url: Option<String>,
}

/// Zeitparameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub setup_timeout_secs: u64,
    pub playback_wait_ms: u64,
    pub reconnect_delay_secs: u64,
    pub keepalive_interval_secs: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            setup_timeout_secs: 25,
            playback_wait_ms: PLAYBACK_WAIT.as_millis() as u64,
            reconnect_delay_secs: 60,
            keepalive_interval_secs: 15 * 60,
        }
    }
}

impl Config {
    /// Standardpfad der Konfigurationsdatei
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let proj_dirs = directories::ProjectDirs::from("org", "voxcall", "voxcall")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Lädt eine Konfigurationsdatei
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Lädt `path` oder, falls nicht angegeben, den Standardpfad
    ///
    /// Fehlt die Datei am Standardpfad, wird die Default-Konfiguration benutzt.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }

        let default_path = Self::default_path()?;
        if default_path.exists() {
            tracing::info!("Loading config from {:?}", default_path);
            Self::load(&default_path)
        } else {
            tracing::debug!("No config at {:?}, using defaults", default_path);
            Ok(Self::default())
        }
    }

    /// Prüft JID und Relay-URL
    pub fn validate(&self) -> Result<(), ConfigError> {
        let (local, domain) = self
            .xmpp
            .user
            .split_once('@')
            .ok_or_else(|| ConfigError::InvalidJid(self.xmpp.user.clone()))?;
        if local.is_empty() || domain.is_empty() || domain.contains('@') {
            return Err(ConfigError::InvalidJid(self.xmpp.user.clone()));
        }

        let relay_url = self.relay_url();
        let parsed = Url::parse(&relay_url).map_err(|e| ConfigError::InvalidRelayUrl {
            url: relay_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidRelayUrl {
                url: relay_url,
                reason: "scheme must be ws or wss".to_string(),
            });
        }
        Ok(())
    }

    /// Relay-URL aus `relay_url` oder Host bzw. JID-Domain
    pub fn relay_url(&self) -> String {
        if let Some(url) = &self.xmpp.relay_url {
            return url.clone();
        }

        let host = if self.xmpp.host.is_empty() {
            self.xmpp
                .user
                .split_once('@')
                .map(|(_, domain)| crate::signaling::bare_jid(domain))
                .unwrap_or_default()
        } else {
            self.xmpp.host.as_str()
        };
        let scheme = if self.xmpp.no_tls { "ws" } else { "wss" };
        format!("{}://{}/ws", scheme, host)
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            url: self.relay_url(),
            jid: self.xmpp.user.clone(),
            password: self.xmpp.password.clone(),
            reconnect_delay: Duration::from_secs(self.call.reconnect_delay_secs),
            keepalive_interval: Duration::from_secs(self.call.keepalive_interval_secs.max(1)),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            local_jid: self.xmpp.user.clone(),
            setup_timeout: Duration::from_secs(self.call.setup_timeout_secs),
        }
    }

    pub fn playback_wait(&self) -> Duration {
        Duration::from_millis(self.call.playback_wait_ms)
    }
}
