use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{
    broadcast,
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot, Notify,
};
use std::time::Duration;

use tokio::time::Instant;

/// Equivalent of tokio's private `Instant::far_future`: an instant roughly
/// 30 years out, used to park a timer until it is armed with a real deadline.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

use anidate::{
    error::Error,
    heartline::{CallConfig, CallPhase, CallSnapshot, EndReason, HeartlineEventKind},
    signal::{MatchScope, ParticipantId, SignalRow},
};
use webrtc::track::track_remote::TrackRemote;

use super::{
    data::CallData,
    signal_listener::{ObservedSignal, SignalListener},
    signal_sender::SignalSender,
};
use crate::{
    host_media::{LocalStream, MediaDevices},
    notify_wrapper::NotifyWrapper,
    signaling::{decode_row, SignalData},
    simple_webrtc::{self, events::EmittedEvents, events::WebRtcEventStream},
};

#[derive(Debug)]
enum Cmd {
    StartCall {
        scope: MatchScope,
        remote: ParticipantId,
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    AnswerCall {
        offer: SignalRow,
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    DeclineCall {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    EndCall {
        rsp: oneshot::Sender<Result<(), Error>>,
    },
    ToggleAudio,
    ToggleVideo,
    GetState {
        rsp: oneshot::Sender<CallSnapshot>,
    },
    GetRemoteTracks {
        rsp: oneshot::Sender<Vec<Arc<TrackRemote>>>,
    },
    GetLocalStream {
        rsp: oneshot::Sender<Option<LocalStream>>,
    },
}

/// Cloneable handle to the state-machine task. Dropping the last clone
/// notifies the task, which performs a forced cleanup regardless of the
/// current phase.
#[derive(Clone)]
pub struct CallController {
    ch: UnboundedSender<Cmd>,
    notify: Arc<NotifyWrapper>,
}

pub struct Args {
    pub webrtc_controller: simple_webrtc::Controller,
    pub webrtc_event_stream: WebRtcEventStream,
    pub signal_sender: SignalSender,
    pub signal_listener: SignalListener,
    pub signal_rx: UnboundedReceiver<ObservedSignal>,
    pub ui_event_ch: broadcast::Sender<HeartlineEventKind>,
    pub own_id: ParticipantId,
    pub media: Arc<dyn MediaDevices>,
    pub config: CallConfig,
}

impl CallController {
    pub fn new(args: Args) -> Self {
        let (tx, cmd_rx) = mpsc::unbounded_channel();
        let notify = Arc::new(Notify::new());
        let notify2 = notify.clone();
        tokio::spawn(async move {
            run(args, cmd_rx, notify2).await;
        });
        Self {
            ch: tx,
            notify: Arc::new(NotifyWrapper { notify }),
        }
    }

    pub async fn start_call(&self, scope: MatchScope, remote: ParticipantId) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::StartCall {
                scope,
                remote,
                rsp: tx,
            })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await.map_err(|_| Error::ReceiverChannelUnavailable)?
    }

    pub async fn answer_call(&self, offer: SignalRow) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::AnswerCall { offer, rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await.map_err(|_| Error::ReceiverChannelUnavailable)?
    }

    pub async fn decline_call(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::DeclineCall { rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await.map_err(|_| Error::ReceiverChannelUnavailable)?
    }

    pub async fn end_call(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::EndCall { rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await.map_err(|_| Error::ReceiverChannelUnavailable)?
    }

    pub fn toggle_audio(&self) -> Result<(), Error> {
        self.ch
            .send(Cmd::ToggleAudio)
            .map_err(|x| Error::OtherWithContext(x.to_string()))
    }

    pub fn toggle_video(&self) -> Result<(), Error> {
        self.ch
            .send(Cmd::ToggleVideo)
            .map_err(|x| Error::OtherWithContext(x.to_string()))
    }

    pub async fn call_state(&self) -> Result<CallSnapshot, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(Cmd::GetState { rsp: tx })
            .map_err(|x| Error::OtherWithContext(x.to_string()))?;
        rx.await.map_err(|_| Error::ReceiverChannelUnavailable)
    }

    pub async fn remote_tracks(&self) -> Vec<Arc<TrackRemote>> {
        let (tx, rx) = oneshot::channel();
        if self.ch.send(Cmd::GetRemoteTracks { rsp: tx }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn local_stream(&self) -> Option<LocalStream> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(Cmd::GetLocalStream { rsp: tx }).ok()?;
        rx.await.ok()?
    }
}

async fn run(args: Args, mut cmd_rx: UnboundedReceiver<Cmd>, notify: Arc<Notify>) {
    let Args {
        mut webrtc_controller,
        mut webrtc_event_stream,
        signal_sender,
        signal_listener,
        mut signal_rx,
        ui_event_ch,
        own_id,
        media,
        config,
    } = args;

    // prevent accidental moves
    let own_id = &own_id;

    let mut call_data = CallData::new();
    // parked far in the future until an outgoing call is in flight
    let mut dial_deadline = Box::pin(tokio::time::sleep_until(far_future()));

    loop {
        tokio::select! {
            _ = notify.notified() => {
                log::debug!("quitting call controller");
                break;
            },
            _ = &mut dial_deadline => {
                dial_deadline.as_mut().reset(far_future());
                if call_data.phase == CallPhase::Connecting && call_data.is_offerer {
                    log::debug!("outgoing call timed out with no answer");
                    if let (Some(scope), Some(remote)) = (call_data.scope.clone(), call_data.remote.clone()) {
                        if let Err(e) = signal_sender.send(&scope, own_id, &remote, &SignalData::EndCall { reason: None }) {
                            log::error!("failed to send end-call signal: {e}");
                        }
                    }
                    release_resources(&mut call_data, &mut webrtc_controller, &signal_listener).await;
                    call_data.phase = CallPhase::Ended;
                    let _ = ui_event_ch.send(HeartlineEventKind::CallTerminated { reason: Some(EndReason::Timeout) });
                }
            }
            opt = cmd_rx.recv() => {
                let cmd = match opt {
                    Some(r) => r,
                    None => {
                        log::debug!("call controller cmd_rx channel is closed. quitting");
                        break;
                    }
                };
                match cmd {
                    Cmd::StartCall { scope, remote, rsp } => {
                        if matches!(call_data.phase, CallPhase::Incoming | CallPhase::Connecting | CallPhase::Connected) {
                            log::debug!("tried to start a call while one is in progress");
                            let _ = rsp.send(Err(Error::CallAlreadyInProgress));
                            continue;
                        }
                        // a new attempt never reuses a prior stream or session
                        call_data.reset();
                        match begin_outgoing(&mut call_data, &mut webrtc_controller, &signal_listener, &signal_sender, media.as_ref(), &config, own_id, scope, remote).await {
                            Ok(()) => {
                                call_data.phase = CallPhase::Connecting;
                                call_data.is_offerer = true;
                                dial_deadline.as_mut().reset(Instant::now() + config.dial_timeout);
                                let _ = rsp.send(Ok(()));
                            }
                            Err(e) => {
                                let reason = e.to_string();
                                release_resources(&mut call_data, &mut webrtc_controller, &signal_listener).await;
                                call_data.phase = CallPhase::Error;
                                call_data.last_error = Some(reason.clone());
                                let _ = ui_event_ch.send(HeartlineEventKind::CallFailed { reason });
                                let _ = rsp.send(Err(e));
                            }
                        }
                    },
                    Cmd::AnswerCall { offer, rsp } => {
                        if matches!(call_data.phase, CallPhase::Connecting | CallPhase::Connected) {
                            log::debug!("tried to answer a call while one is in progress");
                            let _ = rsp.send(Err(Error::CallAlreadyInProgress));
                            continue;
                        }
                        call_data.reset();
                        match begin_answer(&mut call_data, &mut webrtc_controller, &signal_listener, &signal_sender, media.as_ref(), &config, own_id, offer).await {
                            Ok(()) => {
                                call_data.phase = CallPhase::Connecting;
                                let _ = rsp.send(Ok(()));
                            }
                            Err(e) => {
                                let reason = e.to_string();
                                release_resources(&mut call_data, &mut webrtc_controller, &signal_listener).await;
                                call_data.phase = CallPhase::Error;
                                call_data.last_error = Some(reason.clone());
                                let _ = ui_event_ch.send(HeartlineEventKind::CallFailed { reason });
                                let _ = rsp.send(Err(e));
                            }
                        }
                    }
                    Cmd::DeclineCall { rsp } => {
                        if call_data.phase != CallPhase::Incoming {
                            let _ = rsp.send(Err(Error::CallNotInProgress));
                            continue;
                        }
                        if let (Some(scope), Some(remote)) = (call_data.scope.clone(), call_data.remote.clone()) {
                            if let Err(e) = signal_sender.send(&scope, own_id, &remote, &SignalData::EndCall { reason: Some(EndReason::Declined) }) {
                                log::error!("failed to send end-call signal: {e}");
                            }
                        }
                        // no media was ever acquired on this path
                        release_resources(&mut call_data, &mut webrtc_controller, &signal_listener).await;
                        call_data.phase = CallPhase::Ended;
                        let _ = ui_event_ch.send(HeartlineEventKind::CallTerminated { reason: Some(EndReason::Declined) });
                        let _ = rsp.send(Ok(()));
                    }
                    Cmd::EndCall { rsp } => {
                        if matches!(call_data.phase, CallPhase::Idle | CallPhase::Ended | CallPhase::Error) {
                            // already released. a second end is a no-op
                            let _ = rsp.send(Ok(()));
                            continue;
                        }
                        if let (Some(scope), Some(remote)) = (call_data.scope.clone(), call_data.remote.clone()) {
                            if let Err(e) = signal_sender.send(&scope, own_id, &remote, &SignalData::EndCall { reason: None }) {
                                log::error!("failed to send end-call signal: {e}");
                            }
                        }
                        release_resources(&mut call_data, &mut webrtc_controller, &signal_listener).await;
                        call_data.phase = CallPhase::Ended;
                        dial_deadline.as_mut().reset(far_future());
                        let _ = ui_event_ch.send(HeartlineEventKind::CallTerminated { reason: Some(EndReason::HungUp) });
                        let _ = rsp.send(Ok(()));
                    }
                    Cmd::ToggleAudio => {
                        // valid only while a local stream exists, otherwise a silent no-op
                        if let Some(stream) = call_data.local_stream.as_ref() {
                            stream.audio().toggle();
                        }
                    }
                    Cmd::ToggleVideo => {
                        if let Some(stream) = call_data.local_stream.as_ref() {
                            stream.video().toggle();
                        }
                    }
                    Cmd::GetState { rsp } => {
                        let _ = rsp.send(call_data.snapshot());
                    }
                    Cmd::GetRemoteTracks { rsp } => {
                        let _ = rsp.send(call_data.remote_tracks.clone());
                    }
                    Cmd::GetLocalStream { rsp } => {
                        let _ = rsp.send(call_data.local_stream.clone());
                    }
                }
            },
            opt = signal_rx.recv() => {
                let observed = match opt {
                    Some(r) => r,
                    None => {
                        log::debug!("call controller signal_rx channel is closed. quitting");
                        break;
                    }
                };
                // the listener already filters self-echo; keep the guarantee
                // even if another producer feeds this channel
                if observed.row.from_participant == *own_id {
                    continue;
                }
                match observed.data {
                    SignalData::Offer { .. } => {
                        if call_data.phase == CallPhase::Idle {
                            call_data.scope = Some(observed.row.match_scope.clone());
                            call_data.remote = Some(observed.row.from_participant.clone());
                            call_data.phase = CallPhase::Incoming;
                        } else {
                            log::debug!("ignoring offer signal in phase {}", call_data.phase);
                        }
                    }
                    SignalData::Answer { description } => {
                        if call_data.phase == CallPhase::Connecting && call_data.is_offerer {
                            // a duplicate answer is ignored inside the controller
                            if let Err(e) = webrtc_controller.apply_remote_answer(description).await {
                                log::error!("failed to apply remote answer: {e}");
                            } else {
                                // the bounded wait covers unanswered dials only
                                dial_deadline.as_mut().reset(far_future());
                            }
                        } else {
                            log::debug!("ignoring answer signal in phase {}", call_data.phase);
                        }
                    }
                    SignalData::IceCandidate { candidate } => {
                        if matches!(call_data.phase, CallPhase::Connecting | CallPhase::Connected) {
                            if let Err(e) = webrtc_controller.add_remote_ice_candidate(candidate).await {
                                log::error!("failed to add remote ice candidate: {e}");
                            }
                        } else {
                            log::debug!("dropping ice candidate in phase {}", call_data.phase);
                        }
                    }
                    SignalData::EndCall { reason } => {
                        match call_data.phase {
                            CallPhase::Incoming | CallPhase::Connecting | CallPhase::Connected => {
                                release_resources(&mut call_data, &mut webrtc_controller, &signal_listener).await;
                                call_data.phase = CallPhase::Ended;
                                dial_deadline.as_mut().reset(far_future());
                                let _ = ui_event_ch.send(HeartlineEventKind::CallTerminated { reason });
                            }
                            _ => log::debug!("ignoring end-call signal in phase {}", call_data.phase),
                        }
                    }
                    SignalData::CallAccepted => {
                        if call_data.phase == CallPhase::Connecting && call_data.is_offerer {
                            let _ = ui_event_ch.send(HeartlineEventKind::OutgoingCallAccepted {
                                from: observed.row.from_participant.clone(),
                            });
                        }
                    }
                }
            }
            opt = webrtc_event_stream.next() => {
                let event = match opt {
                    Some(r) => r,
                    None => {
                        log::debug!("webrtc_event_stream closed!");
                        continue;
                    }
                };
                match event {
                    EmittedEvents::Ice { candidate } => {
                        if let (Some(scope), Some(remote)) = (call_data.scope.as_ref(), call_data.remote.as_ref()) {
                            match candidate.to_json() {
                                Ok(init) => {
                                    if let Err(e) = signal_sender.send(scope, own_id, remote, &SignalData::IceCandidate { candidate: init }) {
                                        log::error!("failed to send signal: {e}");
                                    }
                                }
                                Err(e) => log::error!("failed to serialize ice candidate: {e}"),
                            }
                        } else {
                            log::warn!("discovered a local candidate without an active call");
                        }
                    },
                    EmittedEvents::Connected => {
                        if call_data.phase == CallPhase::Connecting {
                            call_data.phase = CallPhase::Connected;
                            dial_deadline.as_mut().reset(far_future());
                            if let Some(remote) = call_data.remote.clone() {
                                let _ = ui_event_ch.send(HeartlineEventKind::CallConnected { remote });
                            }
                        }
                    },
                    EmittedEvents::Disconnected => {
                        fail_connection(&mut call_data, &mut webrtc_controller, &signal_listener, &ui_event_ch, "peer connection disconnected").await;
                    },
                    EmittedEvents::ConnectionFailed => {
                        fail_connection(&mut call_data, &mut webrtc_controller, &signal_listener, &ui_event_ch, "ice negotiation failed").await;
                    },
                    EmittedEvents::ConnectionClosed => {
                        // follows our own teardown. nothing left to release
                        log::debug!("webrtc: connection closed");
                    },
                    EmittedEvents::TrackAdded { track } => {
                        call_data.remote_tracks.push(track);
                        if let Some(remote) = call_data.remote.clone() {
                            let _ = ui_event_ch.send(HeartlineEventKind::RemoteMediaArrived { remote });
                        }
                    },
                }
            }
        }
    }

    // forced cleanup once the owning screen goes away, whatever the phase
    release_resources(&mut call_data, &mut webrtc_controller, &signal_listener).await;
}

/// Shared tail of every transition into a terminal phase: stop the local
/// tracks, close the peer connection, drop the scope watch. Running it a
/// second time is a no-op.
async fn release_resources(
    call_data: &mut CallData,
    webrtc: &mut simple_webrtc::Controller,
    listener: &SignalListener,
) {
    call_data.release_media();
    webrtc.teardown().await;
    listener.unwatch_scope();
}

#[allow(clippy::too_many_arguments)]
async fn begin_outgoing(
    call_data: &mut CallData,
    webrtc: &mut simple_webrtc::Controller,
    listener: &SignalListener,
    sender: &SignalSender,
    media: &dyn MediaDevices,
    config: &CallConfig,
    own_id: &ParticipantId,
    scope: MatchScope,
    remote: ParticipantId,
) -> Result<(), Error> {
    // media first. a rejection is fatal for this attempt, with no retry
    let stream = media.acquire_stream().await?;
    call_data.scope = Some(scope.clone());
    call_data.remote = Some(remote.clone());
    call_data.local_stream = Some(stream.clone());

    webrtc
        .init(remote.clone(), config)
        .await
        .map_err(|e| Error::OtherWithContext(e.to_string()))?;
    webrtc
        .attach_local_tracks(&stream)
        .await
        .map_err(|e| Error::OtherWithContext(e.to_string()))?;
    let offer = webrtc
        .dial()
        .await
        .map_err(|e| Error::NegotiationError(e.to_string()))?;

    listener.watch_scope(scope.clone());
    log::debug!("sending offer signal");
    sender.send(&scope, own_id, &remote, &SignalData::Offer { description: offer })?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn begin_answer(
    call_data: &mut CallData,
    webrtc: &mut simple_webrtc::Controller,
    listener: &SignalListener,
    sender: &SignalSender,
    media: &dyn MediaDevices,
    config: &CallConfig,
    own_id: &ParticipantId,
    offer_row: SignalRow,
) -> Result<(), Error> {
    let description = match decode_row(&offer_row)? {
        SignalData::Offer { description } => description,
        other => {
            return Err(Error::InvalidSignal(format!(
                "expected an offer row, got {other}"
            )))
        }
    };
    let scope = offer_row.match_scope.clone();
    let remote = offer_row.from_participant.clone();

    let stream = media.acquire_stream().await?;
    call_data.scope = Some(scope.clone());
    call_data.remote = Some(remote.clone());
    call_data.local_stream = Some(stream.clone());

    webrtc
        .init(remote.clone(), config)
        .await
        .map_err(|e| Error::OtherWithContext(e.to_string()))?;
    webrtc
        .attach_local_tracks(&stream)
        .await
        .map_err(|e| Error::OtherWithContext(e.to_string()))?;
    let answer = webrtc
        .accept_offer(description)
        .await
        .map_err(|e| Error::NegotiationError(e.to_string()))?;

    listener.watch_scope(scope.clone());
    log::debug!("sending answer signal");
    sender.send(&scope, own_id, &remote, &SignalData::Answer { description: answer })?;
    Ok(())
}

/// An unrecoverable connection-health report. Ending the call is the only
/// defined recovery; there is no automatic reconnect.
async fn fail_connection(
    call_data: &mut CallData,
    webrtc: &mut simple_webrtc::Controller,
    listener: &SignalListener,
    ui_event_ch: &broadcast::Sender<HeartlineEventKind>,
    reason: &str,
) {
    if !matches!(call_data.phase, CallPhase::Connecting | CallPhase::Connected) {
        return;
    }
    release_resources(call_data, webrtc, listener).await;
    call_data.phase = CallPhase::Error;
    call_data.last_error = Some(reason.to_string());
    let _ = ui_event_ch.send(HeartlineEventKind::CallFailed {
        reason: reason.to_string(),
    });
}
