mod call_controller;
mod data;
mod notifier;
mod signal_listener;
mod signal_sender;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use anidate::{
    error::Error,
    heartline::{
        CallConfig, CallSnapshot, Heartline, HeartlineEventKind, HeartlineEventStream,
    },
    profile::ProfileDirectory,
    signal::{MatchScope, ParticipantId, SignalRow, SignalStore},
};
use webrtc::track::track_remote::TrackRemote;

use crate::{
    host_media::{LocalStream, MediaDevices},
    simple_webrtc,
};

use self::{
    call_controller::{Args, CallController},
    notifier::IncomingCallNotifier,
    signal_listener::SignalListener,
    signal_sender::SignalSender,
};

// implements Heartline
#[derive(Clone)]
pub struct HeartlineImpl {
    own_id: ParticipantId,
    controller: CallController,
    notifier: IncomingCallNotifier,
    ui_event_ch: broadcast::Sender<HeartlineEventKind>,
}

impl HeartlineImpl {
    pub fn new(
        own_id: ParticipantId,
        store: Arc<dyn SignalStore>,
        media: Arc<dyn MediaDevices>,
        profiles: Arc<dyn ProfileDirectory>,
        config: CallConfig,
    ) -> Result<Self, Error> {
        let (ui_event_ch, _rx) = broadcast::channel(1024);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let webrtc_controller =
            simple_webrtc::Controller::new().map_err(|e| Error::OtherWithContext(e.to_string()))?;
        let webrtc_event_stream = webrtc_controller.get_event_stream();

        let signal_sender = SignalSender::new(store.clone());
        let signal_listener =
            SignalListener::new(own_id.clone(), store.clone(), signal_tx.clone());
        let notifier = IncomingCallNotifier::new(
            own_id.clone(),
            store,
            profiles,
            signal_sender.clone(),
            signal_tx,
            ui_event_ch.clone(),
        );

        let controller = CallController::new(Args {
            webrtc_controller,
            webrtc_event_stream,
            signal_sender,
            signal_listener,
            signal_rx,
            ui_event_ch: ui_event_ch.clone(),
            own_id: own_id.clone(),
            media,
            config,
        });

        Ok(Self {
            own_id,
            controller,
            notifier,
            ui_event_ch,
        })
    }

    /// Suppresses the process-wide incoming-call prompt while a call screen
    /// owns the negotiation path.
    pub fn set_call_screen_active(&self, active: bool) {
        self.notifier.set_call_screen_active(active);
    }

    /// Resolves the pending prompt positively: the courtesy `call-accepted`
    /// signal goes out and the stored offer row comes back, ready for
    /// `answer_call` once the call screen is up.
    pub async fn accept_incoming(&self) -> Result<SignalRow, Error> {
        self.notifier.accept().await
    }

    /// The offer currently awaiting accept/decline, if any.
    pub async fn pending_incoming(&self) -> Option<SignalRow> {
        self.notifier.pending_offer().await
    }

    /// Handle to the stream the call screen renders as the self view.
    pub async fn local_stream(&self) -> Option<LocalStream> {
        self.controller.local_stream().await
    }

    /// Tracks delivered by the remote peer, for the remote view.
    pub async fn remote_tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.controller.remote_tracks().await
    }
}

#[async_trait]
impl Heartline for HeartlineImpl {
    async fn get_event_stream(&mut self) -> Result<HeartlineEventStream, Error> {
        let mut rx = self.ui_event_ch.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                };
            }
        };
        Ok(HeartlineEventStream(Box::pin(stream)))
    }

    async fn start_call(
        &mut self,
        scope: MatchScope,
        remote: ParticipantId,
    ) -> Result<(), Error> {
        self.controller.start_call(scope, remote).await
    }

    async fn answer_call(&mut self, offer: SignalRow) -> Result<(), Error> {
        self.controller.answer_call(offer).await
    }

    async fn decline_call(&mut self) -> Result<(), Error> {
        // the prompt goes away; the end-call signal is the state machine's
        self.notifier.dismiss();
        self.controller.decline_call().await
    }

    async fn end_call(&mut self) -> Result<(), Error> {
        self.controller.end_call().await
    }

    async fn toggle_audio(&mut self) -> Result<(), Error> {
        self.controller.toggle_audio()
    }

    async fn toggle_video(&mut self) -> Result<(), Error> {
        self.controller.toggle_video()
    }

    async fn call_state(&self) -> Result<CallSnapshot, Error> {
        self.controller.call_state().await
    }

    fn own_id(&self) -> ParticipantId {
        self.own_id.clone()
    }
}
