//! Local capture surface for a call. The call controller exclusively owns
//! the stream it acquires here and stops every track on each exit path;
//! clones of the handles only share the flags, never the ownership.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use anidate::error::Error;

pub mod loopback;

pub const AUDIO_SOURCE_ID: &str = "audio-input";
pub const VIDEO_SOURCE_ID: &str = "video-input";

pub fn opus_codec() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".into(),
        clock_rate: 48000,
        channels: 1,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

pub fn vp8_codec() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/VP8".into(),
        clock_rate: 90000,
        ..Default::default()
    }
}

/// Handle to one locally produced track. Capture pipelines consult the
/// `enabled` flag before writing and stop for good once `live` clears.
#[derive(Clone, Debug)]
pub struct LocalTrack {
    source_id: String,
    rtp: Arc<TrackLocalStaticRTP>,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    pub fn new(source_id: &str, codec: RTCRtpCodecCapability) -> Self {
        let rtp = Arc::new(TrackLocalStaticRTP::new(
            codec,
            source_id.to_string(),
            Uuid::new_v4().to_string(),
        ));
        Self {
            source_id: source_id.to_string(),
            rtp,
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.source_id
    }

    pub fn rtp(&self) -> Arc<TrackLocalStaticRTP> {
        self.rtp.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn toggle(&self) {
        self.enabled.fetch_xor(true, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Stops production permanently. Safe to call repeatedly.
    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// The combined audio+video stream one call attempt owns.
#[derive(Clone, Debug)]
pub struct LocalStream {
    audio: LocalTrack,
    video: LocalTrack,
}

impl LocalStream {
    pub fn new(audio: LocalTrack, video: LocalTrack) -> Self {
        Self { audio, video }
    }

    pub fn audio(&self) -> &LocalTrack {
        &self.audio
    }

    pub fn video(&self) -> &LocalTrack {
        &self.video
    }

    pub fn tracks(&self) -> [&LocalTrack; 2] {
        [&self.audio, &self.video]
    }

    pub fn is_live(&self) -> bool {
        self.tracks().iter().any(|t| t.is_live())
    }

    /// Stops every track. Idempotent.
    pub fn stop(&self) {
        for track in self.tracks() {
            track.stop();
        }
    }
}

/// Where local media comes from. The application wires the platform's
/// capture devices; tests and demos use the loopback source. Acquisition
/// may be rejected by the user or the OS, which is fatal for the current
/// call attempt.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request a combined audio+video stream.
    async fn acquire_stream(&self) -> Result<LocalStream, Error>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stop_is_idempotent_and_final() {
        let track = LocalTrack::new(AUDIO_SOURCE_ID, opus_codec());
        assert!(track.is_live());
        track.stop();
        track.stop();
        assert!(!track.is_live());
    }

    #[test]
    fn toggle_flips_only_the_enabled_flag() {
        let stream = LocalStream::new(
            LocalTrack::new(AUDIO_SOURCE_ID, opus_codec()),
            LocalTrack::new(VIDEO_SOURCE_ID, vp8_codec()),
        );
        stream.video().toggle();
        assert!(!stream.video().is_enabled());
        assert!(stream.audio().is_enabled());
        assert!(stream.is_live());
        stream.video().toggle();
        assert!(stream.video().is_enabled());
    }
}
