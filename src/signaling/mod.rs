//! Signaling Module - Mailbox-basierter Austausch von Call-Events
//!
//! Jeder Benutzer hat genau ein Mailbox-Dokument. Ein Sender überschreibt
//! die Mailbox des Empfängers, der Empfänger beobachtet seine eigene:
//! - `SignalEvent` und Dokument-Format
//! - `MailboxStore` mit SQLite- und Relay-Backend
//! - `SignalingTransport` für send/subscribe/clear
//! - `relay::serve` als WebSocket-Server vor dem SQLite-Store
//!

mod client;
mod error;
mod event;
mod protocol;
pub mod relay;
mod sqlite;
mod store;
mod transport;

pub use client::RelayMailboxStore;
pub use error::SignalingError;
pub use event::{CallMedia, SignalEvent, SignalKind};
pub use protocol::{error_codes, ClientRequest, ServerMessage, MAX_CLOCK_SKEW_MS};
pub use sqlite::SqliteMailboxStore;
pub use store::{DocumentChange, MailboxStore, WATCH_BUFFER};
pub use transport::SignalingTransport;
