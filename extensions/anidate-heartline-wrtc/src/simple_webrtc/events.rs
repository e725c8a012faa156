use std::sync::Arc;

use futures::stream::BoxStream;
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidate, track::track_remote::TrackRemote,
};

pub struct WebRtcEventStream(pub BoxStream<'static, EmittedEvents>);

impl core::ops::Deref for WebRtcEventStream {
    type Target = BoxStream<'static, EmittedEvents>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for WebRtcEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[derive(Clone, derive_more::Display)]
pub enum EmittedEvents {
    /// a local candidate was discovered. the caller forwards it to the
    /// remote participant as an `ice-candidate` signal
    #[display(fmt = "Ice")]
    Ice { candidate: Box<RTCIceCandidate> },
    #[display(fmt = "Connected")]
    Connected,
    #[display(fmt = "Disconnected")]
    Disconnected,
    #[display(fmt = "ConnectionFailed")]
    ConnectionFailed,
    #[display(fmt = "ConnectionClosed")]
    ConnectionClosed,

    /// the remote peer delivered a media track. The calling application is
    /// responsible for reading from the track and rendering the output
    #[display(fmt = "TrackAdded")]
    TrackAdded { track: Arc<TrackRemote> },
}

// needed because TrackRemote doesn't implement Debug
impl std::fmt::Debug for EmittedEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}
