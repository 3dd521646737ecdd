//! Konfiguration
//!
//! Lädt die Einstellungen für Identität, Relay, ICE-Server, Kamera-Capture
//! und den Signaling-Coordinator. Quelle ist eine optionale TOML-Datei
//! (`SKYCALL_CONFIG`), einzelne Werte können per Umgebungsvariable
//! überschrieben werden.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Pfad zur TOML-Konfigurationsdatei
pub const CONFIG_ENV: &str = "SKYCALL_CONFIG";

/// Überschreibt `relay.url`
pub const RELAY_URL_ENV: &str = "SKYCALL_RELAY_URL";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unsupported relay URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("ICE server entry without URLs")]
    EmptyIceServer,

    #[error("Invalid capture format: {0}")]
    InvalidCapture(String),
}

// ============================================================================
// CONFIG STRUCTS
// ============================================================================

/// Gesamte Konfiguration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkycallConfig {
    pub identity: IdentityConfig,
    pub relay: RelayConfig,
    pub ice_servers: Vec<IceServerConfig>,
    pub capture: CaptureConfig,
    pub coordinator: CoordinatorConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Ohne Angabe: `<data_dir>/keys/private.key`
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket-URL des Mailbox-Relays (Client-Seite)
    pub url: String,
    pub heartbeat_secs: u64,
    pub connect_timeout_secs: u64,
    /// Listen-Adresse des Relay-Servers
    pub listen_addr: String,
    /// Ohne Angabe: `<data_dir>/mailbox.db`
    pub database_path: Option<PathBuf>,
}

/// Ein STUN- oder TURN-Server
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// Kamera-Capture Format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Maximale Anzahl gepufferter Events solange die UI nicht bereit ist
    pub pending_limit: usize,
    /// Ohne Angabe wartet ein Anruf unbegrenzt auf die Gegenseite
    pub await_peer_timeout_secs: Option<u64>,
    /// Kapazität des Channels für eingehende Mailbox-Events
    pub inbound_buffer: usize,
    /// Kapazität des Broadcast-Channels für Beobachter
    pub event_buffer: usize,
}

// ============================================================================
// DEFAULTS
// ============================================================================

impl Default for SkycallConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            relay: RelayConfig::default(),
            ice_servers: default_ice_servers(),
            capture: CaptureConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8787".to_string(),
            heartbeat_secs: 25,
            connect_timeout_secs: 10,
            listen_addr: "127.0.0.1:8787".to_string(),
            database_path: None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 480,
            height: 640,
            fps: 30,
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            pending_limit: 256,
            await_peer_timeout_secs: None,
            inbound_buffer: 64,
            event_buffer: 100,
        }
    }
}

/// Öffentliche STUN-Server. TURN-Relays kommen ausschließlich aus der
/// Konfiguration, da sie Zugangsdaten brauchen.
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
            "stun:stun2.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

// ============================================================================
// LOADING
// ============================================================================

impl SkycallConfig {
    /// Lädt die Konfiguration aus `SKYCALL_CONFIG` (falls gesetzt) und
    /// wendet Umgebungs-Overrides an.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => {
                tracing::info!("Loading config from {:?}", path);
                Self::from_file(Path::new(&path))?
            }
            None => Self::default(),
        };

        config.apply_overrides(std::env::var(RELAY_URL_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    /// Liest eine TOML-Datei
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Überschreibt Werte aus der Umgebung
    pub fn apply_overrides(&mut self, relay_url: Option<String>) {
        if let Some(url) = relay_url.filter(|u| !u.trim().is_empty()) {
            tracing::debug!("Relay URL overridden: {}", url);
            self.relay.url = url;
        }
    }

    /// Prüft die Konfiguration auf offensichtliche Fehler
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.relay_url()?;

        if self.ice_servers.iter().any(|s| s.urls.is_empty()) {
            return Err(ConfigError::EmptyIceServer);
        }

        let c = &self.capture;
        if c.width == 0 || c.height == 0 || c.fps == 0 {
            return Err(ConfigError::InvalidCapture(format!(
                "{}x{}@{}",
                c.width, c.height, c.fps
            )));
        }

        Ok(())
    }

    /// Geparste Relay-URL (nur ws/wss)
    pub fn relay_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.relay.url)?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn key_path(&self) -> Option<PathBuf> {
        self.identity
            .key_path
            .clone()
            .or_else(|| data_dir().map(|d| d.join("keys").join("private.key")))
    }

    pub fn database_path(&self) -> Option<PathBuf> {
        self.relay
            .database_path
            .clone()
            .or_else(|| data_dir().map(|d| d.join("mailbox.db")))
    }
}

impl RelayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

impl CoordinatorConfig {
    pub fn await_peer_timeout(&self) -> Option<Duration> {
        self.await_peer_timeout_secs.map(Duration::from_secs)
    }
}

/// App-Datenverzeichnis
/// - Linux: `~/.local/share/skycall`
/// - macOS: `~/Library/Application Support/com.weathermapapp.skycall`
pub fn data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "weathermapapp", "skycall")
        .map(|dirs| dirs.data_dir().to_path_buf())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SkycallConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capture, CaptureConfig { width: 480, height: 640, fps: 30 });
        assert_eq!(config.coordinator.pending_limit, 256);
        assert!(config.coordinator.await_peer_timeout().is_none());
        // Keine TURN-Zugangsdaten im Default
        assert!(config.ice_servers.iter().all(|s| s.credential.is_empty()));
    }

    #[test]
    fn test_parse_toml_with_turn_server() {
        let config = SkycallConfig::from_toml_str(
            r#"
            [relay]
            url = "wss://relay.example.com/ws"

            [[ice_servers]]
            urls = ["stun:stun.example.com:3478"]

            [[ice_servers]]
            urls = ["turn:turn.example.com:443?transport=tcp"]
            username = "demo"
            credential = "secret"

            [coordinator]
            await_peer_timeout_secs = 45
            "#,
        )
        .unwrap();

        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].username, "demo");
        assert_eq!(config.relay.heartbeat_secs, 25);
        assert_eq!(
            config.coordinator.await_peer_timeout(),
            Some(Duration::from_secs(45))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_relay_override() {
        let mut config = SkycallConfig::default();
        config.apply_overrides(Some("wss://other.example.com".to_string()));
        assert_eq!(config.relay.url, "wss://other.example.com");

        config.apply_overrides(Some("  ".to_string()));
        assert_eq!(config.relay.url, "wss://other.example.com");
    }

    #[test]
    fn test_rejects_http_relay() {
        let mut config = SkycallConfig::default();
        config.relay.url = "https://relay.example.com".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedScheme(s)) if s == "https"
        ));
    }

    #[test]
    fn test_rejects_empty_ice_entry() {
        let mut config = SkycallConfig::default();
        config.ice_servers.push(IceServerConfig::default());
        assert!(matches!(config.validate(), Err(ConfigError::EmptyIceServer)));
    }
}
