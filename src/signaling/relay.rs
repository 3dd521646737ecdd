//! Mailbox-Relay Server
//!
//! Stellt einen [`SqliteMailboxStore`] über WebSocket bereit. Regeln:
//! - Jede Anfrage muss mit dem registrierten Schlüssel signiert sein
//! - `put` nur mit `sender` = eigene User-ID (kein Absender-Spoofing)
//! - `delete` und `watch` nur auf die eigene Mailbox

use super::protocol::{error_codes, ClientRequest, ServerMessage, MAX_CLOCK_SKEW_MS};
use super::store::{DocumentChange, MailboxStore};
use super::SqliteMailboxStore;
use crate::identity::verify_message;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};

type Outbound = mpsc::UnboundedSender<Message>;

/// Abgelehnte Anfrage: (Code, Meldung)
type Rejection = (i32, String);

/// Zustand einer Client-Verbindung
#[derive(Default)]
struct Connection {
    public_key: Option<String>,
    user_id: Option<String>,
    watch_tasks: Vec<JoinHandle<()>>,
}

/// Nimmt Verbindungen an, bis der Listener fehlschlägt
pub async fn serve(listener: TcpListener, store: Arc<SqliteMailboxStore>) -> std::io::Result<()> {
    tracing::info!("Mailbox relay listening on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = listener.accept().await?;
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            handle_connection(stream, addr, store).await;
        });
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, store: Arc<SqliteMailboxStore>) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    tracing::info!("Relay connection from {}", addr);

    let (mut ws_sender, mut ws_receiver) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection::default();

    loop {
        tokio::select! {
            msg_result = ws_receiver.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        if let Err((code, message)) =
                            handle_request(&text, &mut conn, &store, &tx).await
                        {
                            tracing::warn!("Rejected request from {}: {} {}", addr, code, message);
                            send(&tx, &ServerMessage::Error {
                                code,
                                message,
                                timestamp: Utc::now().timestamp_millis(),
                            });
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error from {}: {}", addr, e);
                        break;
                    }
                }
            }
            _ = &mut send_task => break,
        }
    }

    for task in conn.watch_tasks.drain(..) {
        task.abort();
    }
    send_task.abort();
    tracing::info!("Relay connection from {} closed ({:?})", addr, conn.user_id);
}

async fn handle_request(
    text: &str,
    conn: &mut Connection,
    store: &Arc<SqliteMailboxStore>,
    tx: &Outbound,
) -> Result<(), Rejection> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| (error_codes::BAD_REQUEST, format!("Invalid JSON: {}", e)))?;
    let request: ClientRequest = serde_json::from_value(value.clone())
        .map_err(|e| (error_codes::BAD_REQUEST, format!("Invalid request: {}", e)))?;

    let timestamp = value
        .get("timestamp")
        .and_then(|t| t.as_i64())
        .ok_or((error_codes::BAD_REQUEST, "Missing timestamp".to_string()))?;
    if (Utc::now().timestamp_millis() - timestamp).abs() > MAX_CLOCK_SKEW_MS {
        return Err((error_codes::UNAUTHORIZED, "Timestamp out of range".to_string()));
    }

    let signature = value
        .get("signature")
        .and_then(|s| s.as_str())
        .ok_or((error_codes::UNAUTHORIZED, "Missing signature".to_string()))?;

    // Register bringt den Schlüssel selbst mit, alles andere nutzt den gebundenen
    let public_key = match &request {
        ClientRequest::Register { public_key } => public_key.clone(),
        _ => conn
            .public_key
            .clone()
            .ok_or((error_codes::UNAUTHORIZED, "Not registered".to_string()))?,
    };
    let signer = verify_message(&public_key, &value, signature)
        .map_err(|e| (error_codes::UNAUTHORIZED, e.to_string()))?;

    match request {
        ClientRequest::Register { public_key } => {
            tracing::info!("Registered {}", signer);
            conn.public_key = Some(public_key);
            conn.user_id = Some(signer.clone());
            send(
                tx,
                &ServerMessage::Registered {
                    user_id: signer,
                    timestamp: Utc::now().timestamp_millis(),
                },
            );
        }

        ClientRequest::Put { doc_id, fields } => {
            let sender = fields.get("sender").and_then(|s| s.as_str());
            if sender != Some(signer.as_str()) {
                return Err((
                    error_codes::FORBIDDEN,
                    "Sender does not match signing key".to_string(),
                ));
            }
            store
                .put(&doc_id, fields)
                .await
                .map_err(|e| (error_codes::STORE_FAILURE, e.to_string()))?;
        }

        ClientRequest::Delete { doc_id } => {
            require_own(&doc_id, &signer)?;
            store
                .delete(&doc_id)
                .await
                .map_err(|e| (error_codes::STORE_FAILURE, e.to_string()))?;
        }

        ClientRequest::Watch { doc_id } => {
            require_own(&doc_id, &signer)?;
            let changes = store
                .watch(&doc_id)
                .await
                .map_err(|e| (error_codes::STORE_FAILURE, e.to_string()))?;
            conn.watch_tasks
                .push(spawn_forwarder(doc_id, changes, tx.clone()));
        }

        ClientRequest::Heartbeat => {
            send(
                tx,
                &ServerMessage::Pong {
                    timestamp: Utc::now().timestamp_millis(),
                },
            );
        }
    }

    Ok(())
}

fn require_own(doc_id: &str, user_id: &str) -> Result<(), Rejection> {
    if doc_id == user_id {
        Ok(())
    } else {
        Err((
            error_codes::FORBIDDEN,
            format!("Mailbox {} belongs to another user", doc_id),
        ))
    }
}

fn spawn_forwarder(
    doc_id: String,
    mut changes: mpsc::Receiver<DocumentChange>,
    tx: Outbound,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(change) = changes.recv().await {
            let msg = match change {
                DocumentChange::Written(fields) => ServerMessage::Changed {
                    doc_id: doc_id.clone(),
                    fields,
                },
                DocumentChange::Removed => ServerMessage::Removed {
                    doc_id: doc_id.clone(),
                },
            };
            if !send(&tx, &msg) {
                break;
            }
        }
    })
}

fn send(tx: &Outbound, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => tx.send(Message::Text(json)).is_ok(),
        Err(e) => {
            tracing::error!("Failed to encode relay message: {}", e);
            false
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;
    use crate::signaling::{RelayMailboxStore, SignalEvent};
    use std::time::Duration;
    use tokio::time::timeout;
    use url::Url;

    async fn start_relay() -> (Url, Arc<SqliteMailboxStore>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        tokio::spawn(serve(listener, Arc::clone(&store)));

        let url = Url::parse(&format!("ws://{}", addr)).unwrap();
        (url, store)
    }

    async fn connect(url: &Url, keypair: &Arc<KeyPair>) -> RelayMailboxStore {
        RelayMailboxStore::connect(url, Arc::clone(keypair), Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_binds_user_id() {
        let (url, _store) = start_relay().await;
        let keypair = Arc::new(KeyPair::generate());

        let client = connect(&url, &keypair).await;
        assert!(client.is_connected());
        assert_eq!(client.user_id(), Some(keypair.user_id()));
    }

    #[tokio::test]
    async fn test_put_reaches_watcher_and_spoofed_sender_is_rejected() {
        let (url, store) = start_relay().await;
        let alice_key = Arc::new(KeyPair::generate());
        let bob_key = Arc::new(KeyPair::generate());
        let alice = connect(&url, &alice_key).await;
        let bob = connect(&url, &bob_key).await;

        let bob_id = bob_key.user_id();
        let mut changes = bob.watch(&bob_id).await.unwrap();

        // Alice gibt sich als Bob aus
        let spoofed = SignalEvent::end_call(&bob_id, &bob_id).to_document().unwrap();
        alice.put(&bob_id, spoofed).await.unwrap();

        let genuine = SignalEvent::end_call(&alice_key.user_id(), &bob_id)
            .to_document()
            .unwrap();
        alice.put(&bob_id, genuine.clone()).await.unwrap();

        let change = timeout(Duration::from_secs(5), changes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change, DocumentChange::Written(genuine.clone()));
        assert_eq!(store.get(&bob_id).unwrap(), Some(genuine));
    }

    #[tokio::test]
    async fn test_foreign_mailbox_cannot_be_watched() {
        let (url, store) = start_relay().await;
        let alice_key = Arc::new(KeyPair::generate());
        let alice = connect(&url, &alice_key).await;

        let mut changes = alice.watch("someone-else").await.unwrap();
        store
            .put("someone-else", serde_json::json!({ "type": "EndCall" }))
            .await
            .unwrap();

        assert!(timeout(Duration::from_millis(300), changes.recv())
            .await
            .is_err());
    }

    #[test]
    fn test_require_own() {
        assert!(require_own("alice", "alice").is_ok());
        assert_eq!(require_own("bob", "alice").unwrap_err().0, error_codes::FORBIDDEN);
    }
}
