//! Signaling Events und Mailbox-Dokument
//!
//! Ein Event wird als JSON-Objekt `{type, sender, target, data}` in das
//! Mailbox-Dokument des Empfängers geschrieben. `type` ist ein String-Tag,
//! kompatibel mit den Android-Clients.

use super::SignalingError;
use serde::{Deserialize, Serialize};

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMedia {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    CallStart(CallMedia),
    Offer,
    Answer,
    IceCandidate,
    EndCall,
}

impl SignalKind {
    /// Offer, Answer und ICE werden gepuffert solange die UI nicht bereit ist
    pub fn is_negotiation(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::IceCandidate)
    }

    pub fn tag(self) -> &'static str {
        EventType::from(self).tag()
    }
}

/// Wire-Tag im Dokument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum EventType {
    StartVideoCall,
    StartAudioCall,
    Offer,
    Answer,
    IceCandidates,
    EndCall,
}

impl EventType {
    fn tag(self) -> &'static str {
        match self {
            Self::StartVideoCall => "StartVideoCall",
            Self::StartAudioCall => "StartAudioCall",
            Self::Offer => "Offer",
            Self::Answer => "Answer",
            Self::IceCandidates => "IceCandidates",
            Self::EndCall => "EndCall",
        }
    }
}

impl From<SignalKind> for EventType {
    fn from(kind: SignalKind) -> Self {
        match kind {
            SignalKind::CallStart(CallMedia::Video) => Self::StartVideoCall,
            SignalKind::CallStart(CallMedia::Audio) => Self::StartAudioCall,
            SignalKind::Offer => Self::Offer,
            SignalKind::Answer => Self::Answer,
            SignalKind::IceCandidate => Self::IceCandidates,
            SignalKind::EndCall => Self::EndCall,
        }
    }
}

impl From<EventType> for SignalKind {
    fn from(t: EventType) -> Self {
        match t {
            EventType::StartVideoCall => Self::CallStart(CallMedia::Video),
            EventType::StartAudioCall => Self::CallStart(CallMedia::Audio),
            EventType::Offer => Self::Offer,
            EventType::Answer => Self::Answer,
            EventType::IceCandidates => Self::IceCandidate,
            EventType::EndCall => Self::EndCall,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MailboxDocument {
    #[serde(rename = "type")]
    kind: EventType,
    #[serde(default)]
    sender: String,
    #[serde(default)]
    target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

// ============================================================================
// SIGNAL EVENT
// ============================================================================

/// Eine Signaling-Nachricht zwischen zwei Geräten
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEvent {
    pub kind: SignalKind,
    pub sender: String,
    pub target: String,
    /// SDP bei Offer/Answer, serialisierter ICE Candidate bei IceCandidate
    pub payload: Option<String>,
}

impl SignalEvent {
    pub fn new(kind: SignalKind, sender: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind,
            sender: sender.into(),
            target: target.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn call_start(sender: &str, target: &str, media: CallMedia) -> Self {
        Self::new(SignalKind::CallStart(media), sender, target)
    }

    pub fn offer(sender: &str, target: &str, sdp: String) -> Self {
        Self::new(SignalKind::Offer, sender, target).with_payload(sdp)
    }

    pub fn answer(sender: &str, target: &str, sdp: String) -> Self {
        Self::new(SignalKind::Answer, sender, target).with_payload(sdp)
    }

    pub fn ice_candidate(sender: &str, target: &str, candidate_json: String) -> Self {
        Self::new(SignalKind::IceCandidate, sender, target).with_payload(candidate_json)
    }

    pub fn end_call(sender: &str, target: &str) -> Self {
        Self::new(SignalKind::EndCall, sender, target)
    }

    /// Sender und Target müssen gesetzt sein
    pub fn is_valid(&self) -> bool {
        !self.sender.is_empty() && !self.target.is_empty()
    }

    /// Serialisiert das Event als Mailbox-Dokument
    pub fn to_document(&self) -> Result<serde_json::Value, SignalingError> {
        let doc = MailboxDocument {
            kind: self.kind.into(),
            sender: self.sender.clone(),
            target: self.target.clone(),
            data: self.payload.clone().map(serde_json::Value::String),
        };
        Ok(serde_json::to_value(doc)?)
    }

    /// Liest ein Mailbox-Dokument.
    ///
    /// Fehlende Sender/Target-Felder sind kein Parse-Fehler, das Event ist
    /// dann nur nicht [`valid`](Self::is_valid).
    pub fn from_document(value: serde_json::Value) -> Result<Self, SignalingError> {
        let doc: MailboxDocument = serde_json::from_value(value)?;

        let payload = match doc.data {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s),
            // Ältere Clients schreiben den Candidate als Objekt
            Some(other) => Some(other.to_string()),
        };

        Ok(Self {
            kind: doc.kind.into(),
            sender: doc.sender,
            target: doc.target,
            payload,
        })
    }
}

impl std::fmt::Display for SignalEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} -> {}", self.kind.tag(), self.sender, self.target)
    }
}

// ============================================================================
// TESTS
// ============================================================================
