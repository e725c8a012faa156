use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::signal::{MatchScope, ParticipantId};

/// Lifecycle of the call owned by one participant's session.
#[derive(Default, Debug, Display, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    #[default]
    #[display(fmt = "idle")]
    Idle,
    /// an offer was received and awaits a local accept or decline
    #[display(fmt = "incoming")]
    Incoming,
    /// a local start or answer was issued and negotiation is in flight
    #[display(fmt = "connecting")]
    Connecting,
    #[display(fmt = "connected")]
    Connected,
    /// terminal. all media stopped and the peer connection closed
    #[display(fmt = "ended")]
    Ended,
    /// terminal. like `Ended` but `last_error` is populated
    #[display(fmt = "error")]
    Error,
}

impl CallPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallPhase::Ended | CallPhase::Error)
    }
}

/// Why a call reached `Ended`.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    #[display(fmt = "declined")]
    Declined,
    #[display(fmt = "timeout")]
    Timeout,
    #[display(fmt = "hung-up")]
    HungUp,
}

/// Per-track enable flags of the local stream.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct MediaFlags {
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

/// Read-only view of the call owned by the state machine. Handed to the
/// call screen on request; never persisted.
#[derive(Default, Debug, Clone)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub scope: Option<MatchScope>,
    pub remote: Option<ParticipantId>,
    /// present only while a local stream exists
    pub media: Option<MediaFlags>,
    /// number of media tracks delivered by the remote peer
    pub remote_tracks: usize,
    pub last_error: Option<String>,
}
