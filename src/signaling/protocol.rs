//! Relay-Protokoll
//!
//! JSON über WebSocket zwischen [`RelayMailboxStore`](super::RelayMailboxStore)
//! und dem Relay-Server. Jede Client-Nachricht trägt `timestamp` (ms) und
//! eine Ed25519-Signatur über die sortierten Felder.

use serde::{Deserialize, Serialize};

/// Maximale Abweichung des Zeitstempels einer Anfrage
pub const MAX_CLOCK_SKEW_MS: i64 = 5 * 60 * 1000;

pub mod error_codes {
    pub const BAD_REQUEST: i32 = 400;
    pub const UNAUTHORIZED: i32 = 401;
    pub const FORBIDDEN: i32 = 403;
    pub const STORE_FAILURE: i32 = 500;
}

// ============================================================================
// CLIENT → RELAY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Bindet die Verbindung an einen Public Key
    Register {
        #[serde(rename = "publicKey")]
        public_key: String,
    },

    /// Überschreibt ein Mailbox-Dokument
    Put {
        #[serde(rename = "docId")]
        doc_id: String,
        fields: serde_json::Value,
    },

    /// Löscht die eigene Mailbox
    Delete {
        #[serde(rename = "docId")]
        doc_id: String,
    },

    /// Beobachtet die eigene Mailbox
    Watch {
        #[serde(rename = "docId")]
        doc_id: String,
    },

    Heartbeat,
}

// ============================================================================
// RELAY → CLIENT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered {
        #[serde(rename = "userId")]
        user_id: String,
        timestamp: i64,
    },

    /// Dokument wurde geschrieben (oder Snapshot beim Watch)
    Changed {
        #[serde(rename = "docId")]
        doc_id: String,
        fields: serde_json::Value,
    },

    Removed {
        #[serde(rename = "docId")]
        doc_id: String,
    },

    Error {
        code: i32,
        message: String,
        timestamp: i64,
    },

    Pong {
        timestamp: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let put = ClientRequest::Put {
            doc_id: "bob".to_string(),
            fields: json!({ "type": "EndCall" }),
        };
        assert_eq!(
            serde_json::to_value(&put).unwrap(),
            json!({ "type": "put", "docId": "bob", "fields": { "type": "EndCall" } })
        );

        assert_eq!(
            serde_json::to_value(ClientRequest::Heartbeat).unwrap(),
            json!({ "type": "heartbeat" })
        );
    }

    #[test]
    fn test_signed_request_parses_with_extra_fields() {
        let value = json!({
            "type": "watch",
            "docId": "bob",
            "timestamp": 1,
            "signature": "xyz"
        });
        let request: ClientRequest = serde_json::from_value(value).unwrap();
        assert_eq!(request, ClientRequest::Watch { doc_id: "bob".to_string() });
    }
}
