//! Signaling Transport
//!
//! Verschickt Events über die Mailbox-Dokumente: `send` überschreibt die
//! Mailbox des Empfängers, `subscribe` beobachtet die eigene Mailbox.
//! Keine Bestätigung, keine Reihenfolge, kein Retry.

use super::event::SignalEvent;
use super::store::{DocumentChange, MailboxStore};
use super::SignalingError;
use crate::identity::IdentityProvider;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Default-Kapazität des Inbound-Channels
const INBOUND_BUFFER: usize = 64;

#[derive(Clone)]
pub struct SignalingTransport {
    store: Arc<dyn MailboxStore>,
    identity: Arc<dyn IdentityProvider>,
    inbound_buffer: usize,
    /// Mailbox des letzten `subscribe()`, gilt auch nach Logout
    subscribed: Arc<Mutex<Option<String>>>,
}

impl SignalingTransport {
    pub fn new(store: Arc<dyn MailboxStore>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            store,
            identity,
            inbound_buffer: INBOUND_BUFFER,
            subscribed: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_inbound_buffer(mut self, capacity: usize) -> Self {
        self.inbound_buffer = capacity.max(1);
        self
    }

    /// Eigene Mailbox: die abonnierte, sonst die des angemeldeten Benutzers
    pub fn local_id(&self) -> Result<String, SignalingError> {
        if let Some(user_id) = self.subscribed.lock().clone() {
            return Ok(user_id);
        }
        self.identity
            .current_user_id()
            .ok_or(SignalingError::NoIdentity)
    }

    /// Schreibt das Event in die Mailbox von `event.target`
    pub async fn send(&self, event: &SignalEvent) -> Result<(), SignalingError> {
        if event.target.is_empty() {
            return Err(SignalingError::SendFailed("event without target".to_string()));
        }

        let doc = event.to_document()?;
        self.store.put(&event.target, doc).await.map_err(|e| {
            tracing::warn!("Failed to send {}: {}", event, e);
            e
        })?;

        tracing::debug!("Sent {}", event);
        Ok(())
    }

    /// Beobachtet die eigene Mailbox.
    ///
    /// Nicht lesbare Dokumente werden geloggt und übersprungen. Die
    /// Subscription endet, wenn der Receiver gedroppt wird.
    pub async fn subscribe(&self) -> Result<mpsc::Receiver<SignalEvent>, SignalingError> {
        let user_id = self
            .identity
            .current_user_id()
            .ok_or(SignalingError::NoIdentity)?;
        let mut changes = self.store.watch(&user_id).await?;
        let (tx, rx) = mpsc::channel(self.inbound_buffer);
        *self.subscribed.lock() = Some(user_id.clone());

        tracing::info!("Subscribed to mailbox {}", user_id);

        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                match change {
                    DocumentChange::Written(fields) => match SignalEvent::from_document(fields) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Ignoring malformed mailbox document: {}", e);
                        }
                    },
                    DocumentChange::Removed => {
                        tracing::trace!("Mailbox {} cleared", user_id);
                    }
                }
            }
            tracing::debug!("Mailbox subscription for {} ended", user_id);
        });

        Ok(rx)
    }

    /// Löscht die eigene Mailbox, damit ein altes EndCall beim nächsten
    /// Subscribe nicht erneut zugestellt wird.
    pub async fn clear(&self) -> Result<(), SignalingError> {
        let user_id = self.local_id()?;
        self.store.delete(&user_id).await
    }
}

impl std::fmt::Debug for SignalingTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingTransport")
            .field("local_id", &self.local_id().ok())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SessionIdentity;
    use crate::signaling::{CallMedia, SignalKind, SqliteMailboxStore};
    use std::time::Duration;
    use tokio::time::timeout;

    fn transport(store: &Arc<SqliteMailboxStore>, user: &str) -> SignalingTransport {
        SignalingTransport::new(store.clone(), Arc::new(SessionIdentity::new(user)))
    }

    #[tokio::test]
    async fn test_send_overwrites_target_mailbox() {
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        let alice = transport(&store, "alice");

        alice
            .send(&SignalEvent::call_start("alice", "bob", CallMedia::Video))
            .await
            .unwrap();
        alice
            .send(&SignalEvent::offer("alice", "bob", "v=0".to_string()))
            .await
            .unwrap();

        let doc = store.get("bob").unwrap().unwrap();
        assert_eq!(doc["type"], "Offer");
        assert_eq!(store.get("alice").unwrap(), None);
    }

    #[tokio::test]
    async fn test_subscribe_skips_malformed_documents() {
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        let bob = transport(&store, "bob");
        let mut inbound = bob.subscribe().await.unwrap();

        store
            .put("bob", serde_json::json!({ "type": "Bogus" }))
            .await
            .unwrap();
        store
            .put(
                "bob",
                SignalEvent::end_call("alice", "bob").to_document().unwrap(),
            )
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(1), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, SignalKind::EndCall);
        assert_eq!(event.sender, "alice");
    }

    #[tokio::test]
    async fn test_stale_end_call_is_redelivered_until_cleared() {
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        let alice = transport(&store, "alice");
        let bob = transport(&store, "bob");

        alice
            .send(&SignalEvent::end_call("alice", "bob"))
            .await
            .unwrap();

        let mut first = bob.subscribe().await.unwrap();
        let stale = timeout(Duration::from_secs(1), first.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale.kind, SignalKind::EndCall);
        drop(first);

        bob.clear().await.unwrap();

        let mut second = bob.subscribe().await.unwrap();
        assert!(timeout(Duration::from_millis(100), second.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_send_without_target_fails() {
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        let alice = transport(&store, "alice");

        let result = alice.send(&SignalEvent::end_call("alice", "")).await;
        assert!(matches!(result, Err(SignalingError::SendFailed(_))));
    }

    #[tokio::test]
    async fn test_no_identity() {
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        let identity = Arc::new(SessionIdentity::default());
        let transport = SignalingTransport::new(store, identity.clone());

        assert!(matches!(
            transport.subscribe().await,
            Err(SignalingError::NoIdentity)
        ));

        identity.login("carol");
        assert_eq!(transport.local_id().unwrap(), "carol");
    }

    #[tokio::test]
    async fn test_clear_targets_subscribed_mailbox_after_identity_change() {
        let store = Arc::new(SqliteMailboxStore::open_in_memory().unwrap());
        let identity = Arc::new(SessionIdentity::new("alice"));
        let alice = SignalingTransport::new(store.clone(), identity.clone());
        let _inbound = alice.subscribe().await.unwrap();

        let end = SignalEvent::end_call("bob", "alice").to_document().unwrap();
        store.put("alice", end.clone()).await.unwrap();
        store.put("carol", end).await.unwrap();

        identity.login("carol");
        assert_eq!(alice.local_id().unwrap(), "alice");

        identity.logout();
        alice.clear().await.unwrap();

        assert_eq!(store.get("alice").unwrap(), None);
        assert!(store.get("carol").unwrap().is_some());
    }
}
