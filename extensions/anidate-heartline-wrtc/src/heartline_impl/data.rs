use std::sync::Arc;

use anidate::{
    heartline::{CallPhase, CallSnapshot, MediaFlags},
    signal::{MatchScope, ParticipantId},
};
use webrtc::track::track_remote::TrackRemote;

use crate::host_media::LocalStream;

/// Everything the controller task knows about the call it owns. Strictly
/// local to one session; dies with the task.
pub struct CallData {
    pub phase: CallPhase,
    pub scope: Option<MatchScope>,
    pub remote: Option<ParticipantId>,
    /// exclusively owned. released exactly once by taking it out
    pub local_stream: Option<LocalStream>,
    /// non-owning references to what the peer connection delivered
    pub remote_tracks: Vec<Arc<TrackRemote>>,
    pub last_error: Option<String>,
    /// true on the side that sent the offer
    pub is_offerer: bool,
}

impl CallData {
    pub fn new() -> Self {
        Self {
            phase: CallPhase::Idle,
            scope: None,
            remote: None,
            local_stream: None,
            remote_tracks: Vec::new(),
            last_error: None,
            is_offerer: false,
        }
    }

    /// Back to a fresh idle state for a brand-new call attempt.
    pub fn reset(&mut self) {
        self.release_media();
        *self = CallData::new();
    }

    /// Stops the local tracks. Taking the stream out of the option makes a
    /// second release a no-op.
    pub fn release_media(&mut self) {
        if let Some(stream) = self.local_stream.take() {
            stream.stop();
        }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            phase: self.phase,
            scope: self.scope.clone(),
            remote: self.remote.clone(),
            media: self.local_stream.as_ref().map(|s| MediaFlags {
                audio_enabled: s.audio().is_enabled(),
                video_enabled: s.video().is_enabled(),
            }),
            remote_tracks: self.remote_tracks.len(),
            last_error: self.last_error.clone(),
        }
    }
}
