//! Mailbox Store
//!
//! Dokument-Speicher mit einem Dokument pro Empfänger. Jeder Schreibvorgang
//! überschreibt das vorherige Event (last writer wins), Listener bekommen
//! den aktuellen Stand beim Anmelden und danach jede Änderung.

use super::SignalingError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Kapazität eines Watch-Channels
pub const WATCH_BUFFER: usize = 64;

/// Änderung an einem beobachteten Dokument
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentChange {
    Written(serde_json::Value),
    Removed,
}

#[async_trait]
pub trait MailboxStore: Send + Sync {
    /// Überschreibt das Dokument `doc_id`
    async fn put(&self, doc_id: &str, fields: serde_json::Value) -> Result<(), SignalingError>;

    /// Löscht das Dokument (kein Fehler wenn es nicht existiert)
    async fn delete(&self, doc_id: &str) -> Result<(), SignalingError>;

    /// Beobachtet das Dokument bis der Receiver gedroppt wird.
    ///
    /// Existiert das Dokument bereits, ist der aktuelle Stand die erste
    /// Änderung im Channel.
    async fn watch(&self, doc_id: &str) -> Result<mpsc::Receiver<DocumentChange>, SignalingError>;
}

/// Registrierte Listener pro Dokument
#[derive(Debug, Default)]
pub(crate) struct WatcherSet {
    watchers: HashMap<String, Vec<mpsc::Sender<DocumentChange>>>,
}

impl WatcherSet {
    pub(crate) fn register(&mut self, doc_id: &str, tx: mpsc::Sender<DocumentChange>) {
        self.watchers.entry(doc_id.to_string()).or_default().push(tx);
    }

    /// Verteilt eine Änderung. Kein Backpressure: ist ein Channel voll,
    /// geht die Änderung für diesen Listener verloren.
    pub(crate) fn notify(&mut self, doc_id: &str, change: &DocumentChange) {
        let Some(list) = self.watchers.get_mut(doc_id) else {
            return;
        };

        list.retain(|tx| match tx.try_send(change.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Watcher for {} is full, dropping change", doc_id);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if list.is_empty() {
            self.watchers.remove(doc_id);
        }
    }

    /// Schließt alle Channels (Verbindung verloren)
    pub(crate) fn clear(&mut self) {
        self.watchers.clear();
    }

    pub(crate) fn watched_ids(&self) -> Vec<String> {
        self.watchers.keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn count(&self, doc_id: &str) -> usize {
        self.watchers.get(doc_id).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_watchers_are_pruned() {
        let mut set = WatcherSet::default();
        let (tx1, rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        set.register("bob", tx1);
        set.register("bob", tx2);

        drop(rx1);
        set.notify("bob", &DocumentChange::Removed);

        assert_eq!(set.count("bob"), 1);
        assert_eq!(rx2.try_recv().unwrap(), DocumentChange::Removed);
    }

    #[test]
    fn test_full_watcher_drops_change() {
        let mut set = WatcherSet::default();
        let (tx, mut rx) = mpsc::channel(1);
        set.register("bob", tx);

        set.notify("bob", &DocumentChange::Written(serde_json::json!({ "n": 1 })));
        set.notify("bob", &DocumentChange::Written(serde_json::json!({ "n": 2 })));

        assert_eq!(
            rx.try_recv().unwrap(),
            DocumentChange::Written(serde_json::json!({ "n": 1 }))
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(set.count("bob"), 1);
    }
}
