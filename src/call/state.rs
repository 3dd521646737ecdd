//! Zustand eines Anrufs
//!
//! `CallPhase` gehört exklusiv dem Coordinator-Task. Nach außen gehen nur
//! [`CallStatus`] (watch) und [`CallSnapshot`].

use crate::signaling::{CallMedia, SignalEvent};
use std::collections::VecDeque;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Daten eines laufenden Anrufs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub id: Uuid,
    pub target: String,
    pub direction: CallDirection,
    pub media: CallMedia,
    /// Zählt pro Anruf hoch; Callbacks mit alter Epoch werden verworfen
    pub epoch: u64,
}

impl CallInfo {
    pub fn new(target: &str, direction: CallDirection, media: CallMedia, epoch: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: target.to_string(),
            direction,
            media,
            epoch,
        }
    }
}

/// Zustandsmaschine des Coordinators
#[derive(Debug, Default)]
pub(crate) enum CallPhase {
    #[default]
    Idle,
    /// Target gesetzt, UI noch nicht bereit
    AwaitingPeer {
        call: CallInfo,
        pending: VecDeque<SignalEvent>,
    },
    /// UI bereit, SDP/ICE werden sofort verarbeitet
    Active { call: CallInfo },
}

impl CallPhase {
    pub(crate) fn call(&self) -> Option<&CallInfo> {
        match self {
            Self::Idle => None,
            Self::AwaitingPeer { call, .. } | Self::Active { call } => Some(call),
        }
    }

    pub(crate) fn target(&self) -> Option<&str> {
        self.call().map(|c| c.target.as_str())
    }

    pub(crate) fn kind(&self) -> PhaseKind {
        match self {
            Self::Idle => PhaseKind::Idle,
            Self::AwaitingPeer { .. } => PhaseKind::AwaitingPeer,
            Self::Active { .. } => PhaseKind::Active,
        }
    }

    pub(crate) fn pending_len(&self) -> usize {
        match self {
            Self::AwaitingPeer { pending, .. } => pending.len(),
            _ => 0,
        }
    }

    /// Status für Beobachter
    pub(crate) fn status(&self) -> CallStatus {
        match self {
            Self::Idle => CallStatus::Idle,
            Self::AwaitingPeer { call, .. } => match call.direction {
                CallDirection::Outgoing => CallStatus::Outgoing {
                    to: call.target.clone(),
                },
                CallDirection::Incoming => CallStatus::Incoming {
                    from: call.target.clone(),
                    media: call.media,
                },
            },
            Self::Active { call } => CallStatus::InProgress {
                with: call.target.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Idle,
    AwaitingPeer,
    Active,
}

/// Prozessweiter Anrufstatus
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CallStatus {
    #[default]
    Idle,
    Outgoing {
        to: String,
    },
    Incoming {
        from: String,
        media: CallMedia,
    },
    InProgress {
        with: String,
    },
}

impl CallStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

/// Momentaufnahme des Coordinators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub phase: PhaseKind,
    pub target: Option<String>,
    pub call_id: Option<Uuid>,
    pub pending: usize,
    pub media_prepared: bool,
}
