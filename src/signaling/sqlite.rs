//! SQLite Mailbox Store
//!
//! Lokale Implementierung von [`MailboxStore`]: ein Dokument pro Zeile,
//! Listener im selben Prozess. Dient als Backend für das Relay und als
//! Signaling-Bus für mehrere Geräte in einem Prozess (Tests, Demos).

use super::store::{DocumentChange, MailboxStore, WatcherSet, WATCH_BUFFER};
use super::SignalingError;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tokio::sync::mpsc;

/// Thread-safe durch Mutex; Connection-Lock wird vor dem Watcher-Lock
/// genommen, damit Snapshot und Änderungen in Reihenfolge bleiben.
pub struct SqliteMailboxStore {
    conn: Mutex<Connection>,
    watchers: Mutex<WatcherSet>,
}

impl SqliteMailboxStore {
    /// Öffnet oder erstellt die Datenbank
    pub fn open(path: &Path) -> Result<Self, SignalingError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SignalingError::Store(e.to_string()))?;
        }

        tracing::info!("Opening mailbox database at {:?}", path);
        Self::with_connection(Connection::open(path)?)
    }

    /// In-Memory Datenbank (Tests, Single-Process Betrieb)
    pub fn open_in_memory() -> Result<Self, SignalingError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, SignalingError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS mailbox (
                doc_id TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            watchers: Mutex::new(WatcherSet::default()),
        })
    }

    /// Aktueller Inhalt eines Dokuments
    pub fn get(&self, doc_id: &str) -> Result<Option<serde_json::Value>, SignalingError> {
        let conn = self.conn.lock();
        Self::get_inner(&conn, doc_id)
    }

    fn get_inner(
        conn: &Connection,
        doc_id: &str,
    ) -> Result<Option<serde_json::Value>, SignalingError> {
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM mailbox WHERE doc_id = ?1",
                params![doc_id],
                |row| row.get(0),
            )
            .optional()?;

        body.map(|b| serde_json::from_str(&b).map_err(SignalingError::from))
            .transpose()
    }

    fn put_sync(&self, doc_id: &str, fields: serde_json::Value) -> Result<(), SignalingError> {
        let body = serde_json::to_string(&fields)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO mailbox (doc_id, body) VALUES (?1, ?2)
            ON CONFLICT(doc_id) DO UPDATE SET
                body = excluded.body,
                updated_at = datetime('now')
            "#,
            params![doc_id, body],
        )?;

        self.watchers
            .lock()
            .notify(doc_id, &DocumentChange::Written(fields));
        Ok(())
    }

    fn delete_sync(&self, doc_id: &str) -> Result<(), SignalingError> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM mailbox WHERE doc_id = ?1", params![doc_id])?;

        if removed > 0 {
            self.watchers.lock().notify(doc_id, &DocumentChange::Removed);
        }
        Ok(())
    }

    fn watch_sync(&self, doc_id: &str) -> Result<mpsc::Receiver<DocumentChange>, SignalingError> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);

        let conn = self.conn.lock();
        if let Some(current) = Self::get_inner(&conn, doc_id)? {
            // Frischer Channel, kann nicht voll sein
            let _ = tx.try_send(DocumentChange::Written(current));
        }
        self.watchers.lock().register(doc_id, tx);

        Ok(rx)
    }
}

#[async_trait]
impl MailboxStore for SqliteMailboxStore {
    async fn put(&self, doc_id: &str, fields: serde_json::Value) -> Result<(), SignalingError> {
        self.put_sync(doc_id, fields)
    }

    async fn delete(&self, doc_id: &str) -> Result<(), SignalingError> {
        self.delete_sync(doc_id)
    }

    async fn watch(&self, doc_id: &str) -> Result<mpsc::Receiver<DocumentChange>, SignalingError> {
        self.watch_sync(doc_id)
    }
}

impl std::fmt::Debug for SqliteMailboxStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMailboxStore")
            .field("watched", &self.watchers.lock().watched_ids())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_overwrites_document() {
        let store = SqliteMailboxStore::open_in_memory().unwrap();

        store.put("bob", json!({ "type": "Offer" })).await.unwrap();
        store.put("bob", json!({ "type": "Answer" })).await.unwrap();

        assert_eq!(store.get("bob").unwrap(), Some(json!({ "type": "Answer" })));
    }

    #[tokio::test]
    async fn test_watch_delivers_snapshot_then_changes() {
        let store = SqliteMailboxStore::open_in_memory().unwrap();
        store.put("bob", json!({ "n": 1 })).await.unwrap();

        let mut rx = store.watch("bob").await.unwrap();
        store.put("bob", json!({ "n": 2 })).await.unwrap();
        store.put("alice", json!({ "n": 99 })).await.unwrap();
        store.delete("bob").await.unwrap();

        assert_eq!(rx.recv().await, Some(DocumentChange::Written(json!({ "n": 1 }))));
        assert_eq!(rx.recv().await, Some(DocumentChange::Written(json!({ "n": 2 }))));
        assert_eq!(rx.recv().await, Some(DocumentChange::Removed));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_delete_missing_document_is_silent() {
        let store = SqliteMailboxStore::open_in_memory().unwrap();
        let mut rx = store.watch("bob").await.unwrap();

        store.delete("bob").await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(store.get("bob").unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropped_watcher_is_released() {
        let store = SqliteMailboxStore::open_in_memory().unwrap();
        let rx = store.watch("bob").await.unwrap();
        drop(rx);

        store.put("bob", json!({})).await.unwrap();
        assert_eq!(store.watchers.lock().count("bob"), 0);
    }
}
