//! Typen und Traits der Media-Schicht
//!
//! Der Coordinator kennt nur [`MediaSession`] und [`MediaFactory`]; die
//! WebRTC-Implementierung steckt in [`WebRtcPeer`](super::WebRtcPeer).

use super::audio::AudioError;
use crate::config::IceServerConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("No camera available")]
    NoCamera,

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Peer connection is closed")]
    Closed,
}

// ============================================================================
// ICE / SDP
// ============================================================================

/// ICE Candidate wie er im `data`-Feld eines `IceCandidates` Events steht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "CandidateDocument", try_from = "CandidateDocument")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub username_fragment: Option<String>,
}

/// JSON-Form des Candidates. Android-Clients (Gson auf
/// `org.webrtc.IceCandidate`) lesen und schreiben die Zeile als `sdp`,
/// Browser als `candidate`; geschrieben werden beide.
#[derive(Serialize, Deserialize)]
struct CandidateDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<String>,
    #[serde(rename = "sdpMid", default)]
    sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    username_fragment: Option<String>,
}

impl From<IceCandidate> for CandidateDocument {
    fn from(c: IceCandidate) -> Self {
        Self {
            sdp: Some(c.candidate.clone()),
            candidate: Some(c.candidate),
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

impl TryFrom<CandidateDocument> for IceCandidate {
    type Error = String;

    fn try_from(doc: CandidateDocument) -> Result<Self, Self::Error> {
        let candidate = doc
            .candidate
            .filter(|c| !c.is_empty())
            .or(doc.sdp)
            .ok_or_else(|| "missing field `sdp`".to_string())?;
        Ok(Self {
            candidate,
            sdp_mid: doc.sdp_mid,
            sdp_mline_index: doc.sdp_mline_index,
            username_fragment: doc.username_fragment,
        })
    }
}

impl IceCandidate {
    pub fn to_json(&self) -> Result<String, MediaError> {
        serde_json::to_string(self).map_err(|e| MediaError::InvalidCandidate(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, MediaError> {
        let candidate: Self =
            serde_json::from_str(json).map_err(|e| MediaError::InvalidCandidate(e.to_string()))?;
        if candidate.candidate.is_empty() {
            return Err(MediaError::InvalidCandidate("empty candidate".to_string()));
        }
        Ok(candidate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

// ============================================================================
// PEER EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Verbindungsstatus der Peer Connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks der Peer Connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    RemoteTrack(MediaKind),
    NegotiationNeeded,
    ConnectionState(LinkState),
}

/// Kanal für [`PeerEvent`]s, markiert mit der Epoch des Anrufs.
///
/// Events einer alten Peer Connection kommen nach einem Teardown noch an
/// und werden vom Coordinator anhand der Epoch verworfen.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<(u64, PeerEvent)>,
}

impl PeerEventSink {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<(u64, PeerEvent)>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Non-blocking, kann aus WebRTC-Callbacks aufgerufen werden
    pub fn emit(&self, event: PeerEvent) {
        if self.tx.send((self.epoch, event)).is_err() {
            tracing::trace!("Peer event dropped, coordinator gone");
        }
    }
}

// ============================================================================
// SURFACES
// ============================================================================

/// Ein Video-Frame (VP8-kodiert)
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub duration: Duration,
}

/// Vom Host bereitgestellte Render-Fläche
pub trait RenderSurface: Send + Sync {
    fn init(&self, mirror: bool);
    fn render(&self, frame: &VideoFrame);
    fn release(&self);
}

// ============================================================================
// MEDIA SESSION
// ============================================================================

/// Eine Peer Connection inklusive lokaler Capture.
///
/// Fehler werden immer zurückgegeben; der Coordinator macht daraus ein
/// `MediaNegotiationFailed`.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Kamera + Mikrofon starten, Preview auf `surface`
    async fn attach_local_media(&self, surface: Arc<dyn RenderSurface>) -> Result<(), MediaError>;

    async fn attach_remote_surface(&self, surface: Arc<dyn RenderSurface>)
        -> Result<(), MediaError>;

    /// Erzeugt ein Offer, setzt es als Local Description und gibt das SDP zurück
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Wie `create_offer`, nachdem ein Remote-Offer gesetzt wurde
    async fn create_answer(&self) -> Result<String, MediaError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), MediaError>;

    /// Candidates vor der Remote Description werden gepuffert
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Stoppt Capture und schließt die Verbindung. Idempotent.
    async fn close(&self) -> Result<(), MediaError>;

    async fn switch_camera(&self) -> Result<(), MediaError>;

    fn set_audio_enabled(&self, enabled: bool);
}

/// Erzeugt pro Anruf eine frische [`MediaSession`]
#[async_trait]
pub trait MediaFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: PeerEventSink,
    ) -> Result<Arc<dyn MediaSession>, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_accepts_android_field_name() {
        let json = r#"{"sdp":"candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let candidate = IceCandidate::from_json(json).unwrap();

        assert!(candidate.candidate.starts_with("candidate:1"));
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
    }

    #[test]
    fn test_candidate_written_for_android_and_browser_peers() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };

        let doc: serde_json::Value = serde_json::from_str(&candidate.to_json().unwrap()).unwrap();
        assert_eq!(doc["sdp"], candidate.candidate.as_str());
        assert_eq!(doc["candidate"], candidate.candidate.as_str());
        assert_eq!(doc["sdpMid"], "0");
        assert_eq!(doc["sdpMLineIndex"], 0);
        assert!(doc.get("usernameFragment").is_none());

        // Eigene Payload muss wieder lesbar sein
        assert_eq!(IceCandidate::from_json(&doc.to_string()).unwrap(), candidate);
    }

    #[test]
    fn test_malformed_candidate_is_rejected() {
        assert!(IceCandidate::from_json("not json").is_err());
        assert!(IceCandidate::from_json(r#"{"candidate":""}"#).is_err());
    }

    #[test]
    fn test_sink_tags_events_with_epoch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = PeerEventSink::new(7, tx);

        sink.emit(PeerEvent::NegotiationNeeded);
        assert_eq!(rx.try_recv().unwrap(), (7, PeerEvent::NegotiationNeeded));
    }
}
