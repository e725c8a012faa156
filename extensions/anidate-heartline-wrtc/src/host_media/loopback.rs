//! Capture device that produces inert tracks: opus silence and an empty
//! VP8 payload, paced at a fixed interval. Used by the test suites and by
//! local demos where no camera or microphone is available.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::track::track_local::TrackLocalWriter;

use anidate::error::Error;

use super::{opus_codec, vp8_codec, LocalStream, LocalTrack, MediaDevices};
use super::{AUDIO_SOURCE_ID, VIDEO_SOURCE_ID};

const FRAME_INTERVAL: Duration = Duration::from_millis(20);
// opus DTX frame
const SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];

pub struct LoopbackMediaDevices {
    deny: bool,
    acquired: AtomicUsize,
}

impl LoopbackMediaDevices {
    pub fn new() -> Self {
        Self {
            deny: false,
            acquired: AtomicUsize::new(0),
        }
    }

    /// A device that rejects every acquisition, for exercising the
    /// permission-denied path.
    pub fn denied() -> Self {
        Self {
            deny: true,
            acquired: AtomicUsize::new(0),
        }
    }

    /// How many streams were handed out.
    pub fn acquire_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

impl Default for LoopbackMediaDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for LoopbackMediaDevices {
    async fn acquire_stream(&self) -> Result<LocalStream, Error> {
        if self.deny {
            return Err(Error::MediaAccessFailure("permission denied".into()));
        }

        let audio = LocalTrack::new(AUDIO_SOURCE_ID, opus_codec());
        let video = LocalTrack::new(VIDEO_SOURCE_ID, vp8_codec());
        spawn_writer(audio.clone(), 111, 960);
        spawn_writer(video.clone(), 96, 3000);

        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(LocalStream::new(audio, video))
    }
}

/// Paces inert packets onto the track until it is stopped. Writes while the
/// track is unbound are dropped by webrtc-rs, which is fine here.
fn spawn_writer(track: LocalTrack, payload_type: u8, clock_step: u32) {
    tokio::spawn(async move {
        let mut sequence_number: u16 = 0;
        let mut timestamp: u32 = 0;
        let mut interval = tokio::time::interval(FRAME_INTERVAL);
        loop {
            interval.tick().await;
            if !track.is_live() {
                break;
            }
            if !track.is_enabled() {
                continue;
            }
            let packet = Packet {
                header: Header {
                    version: 2,
                    payload_type,
                    sequence_number,
                    timestamp,
                    ..Default::default()
                },
                payload: Bytes::from_static(SILENCE),
            };
            if let Err(e) = track.rtp().write_rtp(&packet).await {
                log::trace!("loopback write for {} failed: {e}", track.id());
            }
            sequence_number = sequence_number.wrapping_add(1);
            timestamp = timestamp.wrapping_add(clock_step);
        }
        log::debug!("loopback writer for {} finished", track.id());
    });
}
