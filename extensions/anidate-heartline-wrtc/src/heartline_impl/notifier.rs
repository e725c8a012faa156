use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    oneshot, Notify,
};

use anidate::{
    error::Error,
    heartline::HeartlineEventKind,
    profile::ProfileDirectory,
    signal::{ParticipantId, SignalKind, SignalRow, SignalStore},
};

use super::{signal_listener::ObservedSignal, signal_sender::SignalSender};
use crate::{notify_wrapper::NotifyWrapper, signaling::{decode_row, SignalData}};

enum NotifierCmd {
    /// resolve the pending prompt positively. emits the courtesy
    /// `call-accepted` signal and hands the stored offer row back
    Accept {
        rsp: oneshot::Sender<Result<SignalRow, Error>>,
    },
    /// drop the pending prompt without sending anything. the state machine
    /// owns the `end-call` signal on a decline
    Dismiss,
    SetCallScreenActive {
        active: bool,
    },
    PendingOffer {
        rsp: oneshot::Sender<Option<SignalRow>>,
    },
}

/// Process-wide watcher of the signal inbox, independent of any call
/// screen. Reacts only to `offer` rows and keeps at most one prompt
/// pending; later offers are dropped, not queued.
#[derive(Clone)]
pub struct IncomingCallNotifier {
    ch: UnboundedSender<NotifierCmd>,
    notify: Arc<NotifyWrapper>,
}

impl IncomingCallNotifier {
    pub fn new(
        own_id: ParticipantId,
        store: Arc<dyn SignalStore>,
        profiles: Arc<dyn ProfileDirectory>,
        sender: SignalSender,
        signal_tx: UnboundedSender<ObservedSignal>,
        ui_event_ch: tokio::sync::broadcast::Sender<HeartlineEventKind>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let notify = Arc::new(Notify::new());
        let notify2 = notify.clone();
        tokio::spawn(async move {
            run(own_id, store, profiles, sender, signal_tx, ui_event_ch, rx, notify2).await;
        });
        Self {
            ch: tx,
            notify: Arc::new(NotifyWrapper { notify }),
        }
    }

    pub async fn accept(&self) -> Result<SignalRow, Error> {
        let (tx, rx) = oneshot::channel();
        self.ch
            .send(NotifierCmd::Accept { rsp: tx })
            .map_err(|e| Error::OtherWithContext(e.to_string()))?;
        rx.await.map_err(|_| Error::ReceiverChannelUnavailable)?
    }

    pub fn dismiss(&self) {
        let _ = self.ch.send(NotifierCmd::Dismiss);
    }

    pub fn set_call_screen_active(&self, active: bool) {
        let _ = self.ch.send(NotifierCmd::SetCallScreenActive { active });
    }

    pub async fn pending_offer(&self) -> Option<SignalRow> {
        let (tx, rx) = oneshot::channel();
        self.ch.send(NotifierCmd::PendingOffer { rsp: tx }).ok()?;
        rx.await.ok()?
    }
}

#[allow(clippy::too_many_arguments)]
async fn run(
    own_id: ParticipantId,
    store: Arc<dyn SignalStore>,
    profiles: Arc<dyn ProfileDirectory>,
    sender: SignalSender,
    signal_tx: UnboundedSender<ObservedSignal>,
    ui_event_ch: tokio::sync::broadcast::Sender<HeartlineEventKind>,
    mut cmd_rx: UnboundedReceiver<NotifierCmd>,
    notify: Arc<Notify>,
) {
    let mut inbox = match store.subscribe_inbox(own_id.clone()).await {
        Ok(s) => s,
        Err(e) => {
            log::error!("failed to subscribe to the signal inbox. quitting notifier: {e}");
            return;
        }
    };

    let mut pending: Option<SignalRow> = None;
    let mut call_screen_active = false;

    loop {
        tokio::select! {
            _ = notify.notified() => {
                log::debug!("quitting incoming call notifier");
                break;
            }
            opt = cmd_rx.recv() => {
                let cmd = match opt {
                    Some(r) => r,
                    None => {
                        log::debug!("notifier cmd_rx channel is closed. quitting");
                        break;
                    }
                };
                match cmd {
                    NotifierCmd::Accept { rsp } => match pending.take() {
                        Some(row) => {
                            if let Err(e) = sender.send(
                                &row.match_scope,
                                &own_id,
                                &row.from_participant,
                                &SignalData::CallAccepted,
                            ) {
                                log::error!("failed to send call-accepted signal: {e}");
                            }
                            let _ = rsp.send(Ok(row));
                        }
                        None => {
                            let _ = rsp.send(Err(Error::CallNotFound));
                        }
                    },
                    NotifierCmd::Dismiss => {
                        pending = None;
                    }
                    NotifierCmd::SetCallScreenActive { active } => {
                        call_screen_active = active;
                    }
                    NotifierCmd::PendingOffer { rsp } => {
                        let _ = rsp.send(pending.clone());
                    }
                }
            }
            opt = inbox.next() => {
                let row = match opt {
                    Some(r) => r,
                    None => {
                        log::debug!("signal inbox stream closed!");
                        break;
                    }
                };
                // the feed delivers our own writes too
                if row.from_participant == own_id {
                    continue;
                }
                if row.signal_type != SignalKind::Offer {
                    continue;
                }
                let data = match decode_row(&row) {
                    Ok(d) => d,
                    Err(e) => {
                        log::error!("failed to decode offer row: {e}");
                        continue;
                    }
                };

                // the active call screen learns about the offer regardless
                // of whether a prompt is raised
                let _ = signal_tx.send(ObservedSignal { row: row.clone(), data });

                if call_screen_active {
                    log::debug!("suppressing incoming-call prompt: a call screen is active");
                    continue;
                }
                if pending.is_some() {
                    log::debug!("dropping offer from {}: a prompt is already pending", row.from_participant);
                    continue;
                }
                // a caller identity must be resolvable before the user is
                // interrupted
                let profile = match profiles.get_profile(&row.from_participant).await {
                    Ok(p) => p,
                    Err(e) => {
                        log::error!("failed to resolve caller profile for {}: {e}", row.from_participant);
                        continue;
                    }
                };

                pending = Some(row.clone());
                if let Err(e) = ui_event_ch.send(HeartlineEventKind::IncomingCall {
                    from: profile,
                    offer: row,
                }) {
                    log::error!("failed to send IncomingCall event: {e}");
                }
            }
        }
    }
}
