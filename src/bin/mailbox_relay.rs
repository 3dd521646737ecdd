//! Mailbox Relay
//!
//! WebSocket-Server für die Mailbox-Dokumente. Liest dieselbe
//! Konfiguration wie die App (`[relay]`: `listen_addr`, `database_path`).

use anyhow::Context;
use skycall::config::SkycallConfig;
use skycall::signaling::{relay, SqliteMailboxStore};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    skycall::init_logging();

    let config = SkycallConfig::load().context("failed to load configuration")?;

    let store = match config.database_path() {
        Some(path) => SqliteMailboxStore::open(&path)
            .with_context(|| format!("failed to open mailbox database {:?}", path))?,
        None => {
            tracing::warn!("No data directory, mailboxes are kept in memory");
            SqliteMailboxStore::open_in_memory()?
        }
    };

    let listener = TcpListener::bind(&config.relay.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.relay.listen_addr))?;

    tokio::select! {
        result = relay::serve(listener, Arc::new(store)) => {
            result.context("relay stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down mailbox relay");
        }
    }

    Ok(())
}
