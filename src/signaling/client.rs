//! WebSocket Client für das Mailbox-Relay
//!
//! [`MailboxStore`] über eine Relay-Verbindung:
//! - Registrierung mit dem Public Key (User-ID)
//! - Signierte Put/Delete/Watch Requests
//! - Heartbeat gegen Idle-Timeouts
//!
//! Bei Verbindungsverlust werden alle Watch-Channels geschlossen; ein
//! neuer Store muss verbunden werden.

use super::protocol::{ClientRequest, ServerMessage};
use super::store::{DocumentChange, MailboxStore, WatcherSet, WATCH_BUFFER};
use super::SignalingError;
use crate::identity::KeyPair;
use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    user_id: Option<String>,
}

pub struct RelayMailboxStore {
    url: Url,
    keypair: Arc<KeyPair>,
    state: Arc<RwLock<ClientState>>,
    tx: mpsc::Sender<String>,
    watchers: Arc<Mutex<WatcherSet>>,
}

impl RelayMailboxStore {
    /// Verbindet mit dem Relay und registriert den Public Key
    pub async fn connect(
        url: &Url,
        keypair: Arc<KeyPair>,
        timeout: Duration,
    ) -> Result<Self, SignalingError> {
        tracing::info!("Connecting to mailbox relay: {}", url);

        let (ws_stream, _) = tokio::time::timeout(timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| SignalingError::ConnectionFailed("Timeout".to_string()))?
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(100);

        let state = Arc::new(RwLock::new(ClientState {
            is_connected: true,
            user_id: None,
        }));
        let watchers = Arc::new(Mutex::new(WatcherSet::default()));

        let (reg_tx, mut reg_rx) = mpsc::channel::<Result<String, SignalingError>>(1);

        // Read-Task
        let state_clone = Arc::clone(&state);
        let watchers_clone = Arc::clone(&watchers);
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            Self::handle_server_message(msg, &state_clone, &watchers_clone, &reg_tx)
                                .await
                        }
                        Err(e) => tracing::warn!("Unreadable relay message: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("Relay closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Relay WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
            watchers_clone.lock().clear();
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to write to relay: {}", e);
                    break;
                }
            }
        });

        let store = Self {
            url: url.clone(),
            keypair,
            state,
            tx,
            watchers,
        };

        store.send_signed(ClientRequest::Register {
            public_key: store.keypair.public_key_base64(),
        })?;

        let registered = tokio::time::timeout(timeout, reg_rx.recv())
            .await
            .map_err(|_| SignalingError::ConnectionFailed("Registration timeout".to_string()))?;

        match registered {
            Some(Ok(user_id)) => {
                tracing::info!("Registered at relay as {}", user_id);
                Ok(store)
            }
            Some(Err(e)) => Err(e),
            None => Err(SignalingError::ConnectionFailed(
                "Connection closed during registration".to_string(),
            )),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Vom Relay bestätigte User-ID
    pub fn user_id(&self) -> Option<String> {
        self.state.read().user_id.clone()
    }

    /// Sendet regelmäßig Heartbeats bis die Verbindung weg ist
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !store.is_connected() {
                    tracing::info!("Heartbeat: relay disconnected, stopping");
                    break;
                }
                if let Err(e) = store.send_signed(ClientRequest::Heartbeat) {
                    tracing::warn!("Failed to send heartbeat: {}", e);
                }
            }
        })
    }

    /// Signiert und verschickt eine Anfrage (non-blocking)
    fn send_signed(&self, request: ClientRequest) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let mut msg = serde_json::to_value(&request)?;
        let obj = msg
            .as_object_mut()
            .ok_or_else(|| SignalingError::SendFailed("request is not an object".to_string()))?;
        obj.insert(
            "timestamp".to_string(),
            serde_json::Value::Number(Utc::now().timestamp_millis().into()),
        );

        let signature = self.keypair.sign_message(&msg);
        if let Some(obj) = msg.as_object_mut() {
            obj.insert("signature".to_string(), serde_json::Value::String(signature));
        }

        self.tx
            .try_send(msg.to_string())
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    async fn handle_server_message(
        msg: ServerMessage,
        state: &Arc<RwLock<ClientState>>,
        watchers: &Arc<Mutex<WatcherSet>>,
        reg_tx: &mpsc::Sender<Result<String, SignalingError>>,
    ) {
        match msg {
            ServerMessage::Registered { user_id, .. } => {
                state.write().user_id = Some(user_id.clone());
                let _ = reg_tx.send(Ok(user_id)).await;
            }

            ServerMessage::Changed { doc_id, fields } => {
                watchers
                    .lock()
                    .notify(&doc_id, &DocumentChange::Written(fields));
            }

            ServerMessage::Removed { doc_id } => {
                watchers.lock().notify(&doc_id, &DocumentChange::Removed);
            }

            ServerMessage::Error { code, message, .. } => {
                tracing::error!("Relay error {}: {}", code, message);
                // Während der Registrierung wartet connect() auf die Antwort
                if state.read().user_id.is_none() {
                    let _ = reg_tx.try_send(Err(SignalingError::Rejected { code, message }));
                }
            }

            ServerMessage::Pong { .. } => {}
        }
    }
}

#[async_trait]
impl MailboxStore for RelayMailboxStore {
    async fn put(&self, doc_id: &str, fields: serde_json::Value) -> Result<(), SignalingError> {
        self.send_signed(ClientRequest::Put {
            doc_id: doc_id.to_string(),
            fields,
        })
    }

    async fn delete(&self, doc_id: &str) -> Result<(), SignalingError> {
        self.send_signed(ClientRequest::Delete {
            doc_id: doc_id.to_string(),
        })
    }

    async fn watch(&self, doc_id: &str) -> Result<mpsc::Receiver<DocumentChange>, SignalingError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        // Vor dem Request registrieren, sonst geht der Snapshot verloren
        self.watchers.lock().register(doc_id, tx);
        self.send_signed(ClientRequest::Watch {
            doc_id: doc_id.to_string(),
        })?;
        Ok(rx)
    }
}

impl std::fmt::Debug for RelayMailboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayMailboxStore")
            .field("url", &self.url.as_str())
            .field("state", &*self.state.read())
            .finish()
    }
}
