//! Heartline provides one-to-one video calling between matched profiles.
//! It should handle the following:
//! - negotiating a peer media connection via WebRTC
//! - exchanging offer/answer/ICE signals over the match's signal feed
//! - surfacing incoming call offers anywhere in the app
//! - releasing the camera and microphone on every exit path
//!
use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{
    error::Error,
    profile::Profile,
    signal::{MatchScope, ParticipantId, SignalRow},
};

mod call_config;
mod call_state;

pub use call_config::CallConfig;
pub use call_state::{CallPhase, CallSnapshot, EndReason, MediaFlags};

/// Provides one-to-one video calling
#[async_trait]
pub trait Heartline: Sync + Send {
    // ------ Misc ------
    /// The event stream notifies the UI of call related events
    async fn get_event_stream(&mut self) -> Result<HeartlineEventStream, Error>;

    // ------ Start/answer a call ------

    /// attempt to call the given profile within the given match.
    /// cannot start a call if another call is in progress.
    async fn start_call(
        &mut self,
        scope: MatchScope,
        remote: ParticipantId,
    ) -> Result<(), Error>;
    /// accept a received offer row and complete the negotiation
    async fn answer_call(&mut self, offer: SignalRow) -> Result<(), Error>;
    /// notify the caller that the offer will not be answered
    async fn decline_call(&mut self) -> Result<(), Error>;
    /// end/leave the current call
    async fn end_call(&mut self) -> Result<(), Error>;

    // ------ Media controls ------

    async fn toggle_audio(&mut self) -> Result<(), Error>;
    async fn toggle_video(&mut self) -> Result<(), Error>;

    // ------ Utility Functions ------

    /// snapshot of the current call, if any
    async fn call_state(&self) -> Result<CallSnapshot, Error>;
    fn own_id(&self) -> ParticipantId;
}

/// Drives the UI
#[derive(Clone, Debug)]
pub enum HeartlineEventKind {
    /// A call has been offered. `offer` is handed back to `answer_call`
    IncomingCall { from: Profile, offer: SignalRow },
    /// The callee accepted the prompt. Negotiation is still in flight
    OutgoingCallAccepted { from: ParticipantId },
    /// Media is flowing in both directions
    CallConnected { remote: ParticipantId },
    /// The remote peer delivered a media track
    RemoteMediaArrived { remote: ParticipantId },
    /// The call ended. A normal outcome, including declines and timeouts
    CallTerminated { reason: Option<EndReason> },
    /// The call ended abnormally
    CallFailed { reason: String },
}

pub struct HeartlineEventStream(pub BoxStream<'static, HeartlineEventKind>);

impl core::ops::Deref for HeartlineEventStream {
    type Target = BoxStream<'static, HeartlineEventKind>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for HeartlineEventStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
