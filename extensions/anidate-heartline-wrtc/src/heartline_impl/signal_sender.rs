use std::sync::Arc;

use tokio::sync::{
    mpsc::{self, UnboundedReceiver, UnboundedSender},
    Notify,
};

use anidate::{
    error::Error,
    signal::{MatchScope, ParticipantId, SignalRow, SignalStore},
};

use crate::{notify_wrapper::NotifyWrapper, signaling::{build_row, SignalData}};

enum SenderCmd {
    Append { row: SignalRow },
}

/// Fire-and-forget writer for the signal table. Appends are queued onto a
/// dedicated task; failures are logged, never propagated back to the state
/// machine.
#[derive(Clone)]
pub struct SignalSender {
    ch: UnboundedSender<SenderCmd>,
    // when SignalSender gets cloned, NotifyWrapper doesn't get cloned.
    // when NotifyWrapper finally gets dropped, then it's ok to call notify_waiters
    notify: Arc<NotifyWrapper>,
}

impl SignalSender {
    pub fn new(store: Arc<dyn SignalStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let notify = Arc::new(Notify::new());
        let notify2 = notify.clone();
        tokio::spawn(async move {
            run(store, rx, notify2).await;
        });
        Self {
            ch: tx,
            notify: Arc::new(NotifyWrapper { notify }),
        }
    }

    pub fn send(
        &self,
        scope: &MatchScope,
        from: &ParticipantId,
        to: &ParticipantId,
        data: &SignalData,
    ) -> Result<(), Error> {
        let row = build_row(scope, from, to, data)?;
        self.ch
            .send(SenderCmd::Append { row })
            .map_err(|e| Error::FailedToSendSignal(e.to_string()))
    }
}

async fn run(
    store: Arc<dyn SignalStore>,
    mut ch: UnboundedReceiver<SenderCmd>,
    notify: Arc<Notify>,
) {
    loop {
        tokio::select! {
            opt = ch.recv() => match opt {
                Some(SenderCmd::Append { row }) => {
                    if let Err(e) = store.append(row).await {
                        log::error!("failed to append signal row: {e}");
                    }
                }
                None => {
                    log::debug!("SignalSender channel closed");
                    return;
                }
            },
            _ = notify.notified() => {
                log::debug!("SignalSender terminated");
                return;
            }
        }
    }
}
