//! The signaling transport: a durable, append-only table of signal rows,
//! observable through a subscribe-on-insert change feed. Rows are the only
//! data that crosses participant boundaries during a call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

pub mod memory;

/// Identifies a user profile. Opaque to the calling layer.
#[derive(Debug, Display, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Groups every signal belonging to one call relationship. Acts as the
/// channel key for scoped subscriptions.
#[derive(Debug, Display, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchScope(String);

impl MatchScope {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MatchScope {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Display, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    #[display(fmt = "offer")]
    Offer,
    #[display(fmt = "answer")]
    Answer,
    #[display(fmt = "ice-candidate")]
    IceCandidate,
    #[display(fmt = "end-call")]
    EndCall,
    #[display(fmt = "call-accepted")]
    CallAccepted,
}

/// One immutable row of the signal table. The store never updates or
/// deletes a row once it is written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalRow {
    pub id: Uuid,
    pub match_scope: MatchScope,
    pub from_participant: ParticipantId,
    pub to_participant: ParticipantId,
    pub signal_type: SignalKind,
    /// kind-specific document. its `type` tag repeats `signal_type`
    pub signal_data: serde_json::Value,
    /// producer-stamped. diagnostic only, never an ordering guarantee
    pub created_at: DateTime<Utc>,
}

pub struct SignalStream(pub BoxStream<'static, SignalRow>);

impl core::ops::Deref for SignalStream {
    type Target = BoxStream<'static, SignalRow>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for SignalStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Where signal rows live. Appends need no coordination; subscriptions
/// deliver every insert in scope, including the subscriber's own writes,
/// and in no guaranteed order relative to other rows.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Append one immutable row.
    async fn append(&self, row: SignalRow) -> Result<(), Error>;
    /// Observe rows whose scope matches. Rows already in the table for the
    /// scope are replayed before live inserts.
    async fn subscribe_scope(&self, scope: MatchScope) -> Result<SignalStream, Error>;
    /// Observe rows addressed to the given participant.
    async fn subscribe_inbox(&self, participant: ParticipantId) -> Result<SignalStream, Error>;
}
