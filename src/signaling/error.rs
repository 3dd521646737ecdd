use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Relay connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to mailbox store")]
    NotConnected,

    #[error("No signed-in user")]
    NoIdentity,

    #[error("Failed to send: {0}")]
    SendFailed(String),

    #[error("Mailbox store error: {0}")]
    Store(String),

    #[error("Malformed mailbox document: {0}")]
    Decode(String),

    #[error("Relay rejected request: {code} - {message}")]
    Rejected { code: i32, message: String },
}

impl From<rusqlite::Error> for SignalingError {
    fn from(e: rusqlite::Error) -> Self {
        SignalingError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(e: serde_json::Error) -> Self {
        SignalingError::Decode(e.to_string())
    }
}
