//! In-process [`SignalStore`] backed by a broadcast channel. Used by the
//! test suites and local demos; a deployment substitutes the real table.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{MatchScope, ParticipantId, SignalRow, SignalStore, SignalStream};
use crate::error::Error;

pub struct MemorySignalStore {
    rows: RwLock<Vec<SignalRow>>,
    tx: broadcast::Sender<SignalRow>,
}

impl MemorySignalStore {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(1024);
        Arc::new(Self {
            rows: RwLock::new(Vec::new()),
            tx,
        })
    }

    /// Everything appended so far, oldest first.
    pub fn rows(&self) -> Vec<SignalRow> {
        self.rows.read().clone()
    }

    fn subscribe<F>(&self, filter: F) -> SignalStream
    where
        F: Fn(&SignalRow) -> bool + Send + 'static,
    {
        // replay matching rows before tailing the feed. a row inserted
        // between the snapshot and the subscription could show up twice,
        // so track what was already yielded
        let mut rx = self.tx.subscribe();
        let backlog: Vec<SignalRow> = self.rows.read().iter().filter(|r| filter(r)).cloned().collect();
        let stream = async_stream::stream! {
            let mut seen: HashSet<Uuid> = HashSet::new();
            for row in backlog {
                seen.insert(row.id);
                yield row;
            }
            loop {
                match rx.recv().await {
                    Ok(row) => {
                        if filter(&row) && seen.insert(row.id) {
                            yield row;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                };
            }
        };
        SignalStream(Box::pin(stream))
    }
}

#[async_trait]
impl SignalStore for MemorySignalStore {
    async fn append(&self, row: SignalRow) -> Result<(), Error> {
        self.rows.write().push(row.clone());
        // a send error only means nobody is subscribed yet
        let _ = self.tx.send(row);
        Ok(())
    }

    async fn subscribe_scope(&self, scope: MatchScope) -> Result<SignalStream, Error> {
        Ok(self.subscribe(move |row| row.match_scope == scope))
    }

    async fn subscribe_inbox(&self, participant: ParticipantId) -> Result<SignalStream, Error> {
        Ok(self.subscribe(move |row| row.to_participant == participant))
    }
}
