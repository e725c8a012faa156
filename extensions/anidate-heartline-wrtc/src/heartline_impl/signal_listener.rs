use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    Notify,
};

use anidate::signal::{MatchScope, ParticipantId, SignalRow, SignalStore};

use crate::{notify_wrapper::NotifyWrapper, signaling::{decode_row, SignalData}};

/// A decoded signal observed on a subscription. Self-echo has already been
/// removed by the time one of these reaches the state machine.
pub struct ObservedSignal {
    pub row: SignalRow,
    pub data: SignalData,
}

enum ListenerCmd {
    /// watch the signal feed of one match. replaces any previous watch
    WatchScope { scope: MatchScope },
    UnwatchScope,
}

/// Subscribes to the active call's match scope on command and forwards the
/// decoded rows to the state machine.
#[derive(Clone)]
pub struct SignalListener {
    ch: UnboundedSender<ListenerCmd>,
    notify: Arc<NotifyWrapper>,
}

impl SignalListener {
    pub fn new(
        own_id: ParticipantId,
        store: Arc<dyn SignalStore>,
        signal_tx: UnboundedSender<ObservedSignal>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let notify = Arc::new(Notify::new());
        let notify2 = notify.clone();
        tokio::spawn(async move {
            run(own_id, store, rx, signal_tx, notify2).await;
        });
        Self {
            ch: tx,
            notify: Arc::new(NotifyWrapper { notify }),
        }
    }

    pub fn watch_scope(&self, scope: MatchScope) {
        let _ = self.ch.send(ListenerCmd::WatchScope { scope });
    }

    pub fn unwatch_scope(&self) {
        let _ = self.ch.send(ListenerCmd::UnwatchScope);
    }
}

async fn run(
    own_id: ParticipantId,
    store: Arc<dyn SignalStore>,
    mut cmd_rx: UnboundedReceiver<ListenerCmd>,
    signal_tx: UnboundedSender<ObservedSignal>,
    notify: Arc<Notify>,
) {
    // replaced after notifying waiters, so an old watch dies with its notify
    let mut scope_notify = Arc::new(Notify::new());

    loop {
        tokio::select! {
            opt = cmd_rx.recv() => match opt {
                Some(cmd) => match cmd {
                    ListenerCmd::WatchScope { scope } => {
                        scope_notify.notify_waiters();
                        scope_notify = Arc::new(Notify::new());

                        let mut stream = match store.subscribe_scope(scope.clone()).await {
                            Ok(s) => s,
                            Err(e) => {
                                log::error!("failed to subscribe to scope {scope}: {e}");
                                continue;
                            }
                        };

                        let ch = signal_tx.clone();
                        let own_id = own_id.clone();
                        let notify = scope_notify.clone();
                        tokio::spawn(async move {
                            loop {
                                tokio::select! {
                                    _ = notify.notified() => {
                                        log::debug!("scope signal stream terminated by notify");
                                        break;
                                    }
                                    opt = stream.next() => match opt {
                                        Some(row) => {
                                            // the feed delivers our own writes too
                                            if row.from_participant == own_id {
                                                continue;
                                            }
                                            match decode_row(&row) {
                                                Ok(data) => {
                                                    let _ = ch.send(ObservedSignal { row, data });
                                                }
                                                Err(e) => {
                                                    log::error!("failed to decode signal row: {e}");
                                                }
                                            };
                                        }
                                        None => {
                                            log::debug!("scope signal stream closed!");
                                            break;
                                        }
                                    }
                                };
                            }
                        });
                    }
                    ListenerCmd::UnwatchScope => {
                        scope_notify.notify_waiters();
                        scope_notify = Arc::new(Notify::new());
                    }
                },
                None => {
                    log::debug!("SignalListener channel closed");
                    break;
                }
            },
            _ = notify.notified() => {
                log::debug!("SignalListener terminated");
                break;
            }
        }
    }

    scope_notify.notify_waiters();
}
