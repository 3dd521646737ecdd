//! Skycall - Anrufe für die Wetterkarten-App
//!
//! Video- und Audioanrufe zwischen zwei Geräten mit:
//! - Mailbox-Dokumenten als Signaling-Kanal (Relay über WebSocket)
//! - WebRTC für die Medien (VP8 + PCMU)
//! - Ed25519 Identität pro Gerät
//!
//! Die Host-App liefert Kameras und Render-Flächen, alles andere steckt
//! hinter [`CallRuntime`].

pub mod call;
pub mod config;
pub mod identity;
pub mod media;
pub mod signaling;

use call::{CallCoordinator, CallError};
use config::{ConfigError, SkycallConfig};
use identity::{KeyPair, KeyPairError};
use media::{CameraEnumerator, CpalAudio, WebRtcMediaFactory};
use once_cell::sync::OnceCell;
use signaling::{RelayMailboxStore, SignalingError, SignalingTransport};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

// ============================================================================
// LOGGING
// ============================================================================

static LOGGING: OnceCell<()> = OnceCell::new();

/// Installiert den `tracing` Subscriber. `RUST_LOG` überschreibt den
/// Default, mehrfache Aufrufe sind erlaubt.
pub fn init_logging() {
    LOGGING.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("skycall=debug,webrtc=warn"));

        // Schlägt fehl, wenn der Host schon einen Subscriber gesetzt hat
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

// ============================================================================
// RUNTIME
// ============================================================================

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Identity error: {0}")]
    Identity(#[from] KeyPairError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// Alles, was ein Gerät für Anrufe braucht: Identität, Relay-Verbindung
/// und der laufende Coordinator.
pub struct CallRuntime {
    keypair: Arc<KeyPair>,
    relay: Arc<RelayMailboxStore>,
    coordinator: CallCoordinator,
    heartbeat: JoinHandle<()>,
}

impl CallRuntime {
    /// Lädt die Identität, verbindet das Relay und startet den Coordinator
    pub async fn start(
        config: SkycallConfig,
        cameras: Arc<dyn CameraEnumerator>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        tracing::info!("Starting call runtime...");

        let keypair = Arc::new(match config.key_path() {
            Some(path) => KeyPair::load_or_create_at(&path)?,
            None => {
                tracing::warn!("No data directory, using an ephemeral identity");
                KeyPair::generate()
            }
        });
        tracing::info!("Local user id: {}", keypair.user_id());

        let relay = Arc::new(
            RelayMailboxStore::connect(
                &config.relay_url()?,
                Arc::clone(&keypair),
                config.relay.connect_timeout(),
            )
            .await?,
        );
        let heartbeat = relay.start_heartbeat(config.relay.heartbeat_interval());

        let transport = SignalingTransport::new(relay.clone(), keypair.clone());
        let factory = Arc::new(WebRtcMediaFactory::new(
            cameras,
            config.capture,
            Arc::new(CpalAudio),
        ));
        let coordinator = CallCoordinator::start(
            transport,
            factory,
            config.ice_servers.clone(),
            config.coordinator.clone(),
        )
        .await?;

        Ok(Self {
            keypair,
            relay,
            coordinator,
            heartbeat,
        })
    }

    pub fn user_id(&self) -> String {
        self.keypair.user_id()
    }

    pub fn coordinator(&self) -> &CallCoordinator {
        &self.coordinator
    }

    pub fn is_connected(&self) -> bool {
        self.relay.is_connected()
    }

    /// Beendet einen laufenden Anruf und stoppt Coordinator und Heartbeat
    pub async fn shutdown(self) {
        self.coordinator.shutdown().await;
        self.heartbeat.abort();
        tracing::info!("Call runtime stopped");
    }
}

impl std::fmt::Debug for CallRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRuntime")
            .field("user_id", &self.keypair.user_id())
            .field("connected", &self.relay.is_connected())
            .finish()
    }
}
