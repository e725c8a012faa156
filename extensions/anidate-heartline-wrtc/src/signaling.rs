use chrono::Utc;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use anidate::{
    error::Error,
    heartline::EndReason,
    signal::{MatchScope, ParticipantId, SignalKind, SignalRow},
};
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
};

/// Typed body of a signal row. Serialized into the row's `signalData`
/// document; the `type` tag repeats the row's `signalType` column.
#[derive(Serialize, Deserialize, Display, Clone, Debug)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalData {
    #[display(fmt = "Offer")]
    Offer { description: RTCSessionDescription },
    #[display(fmt = "Answer")]
    Answer { description: RTCSessionDescription },
    #[display(fmt = "IceCandidate")]
    IceCandidate { candidate: RTCIceCandidateInit },
    #[display(fmt = "EndCall")]
    EndCall {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        reason: Option<EndReason>,
    },
    #[display(fmt = "CallAccepted")]
    CallAccepted,
}

impl SignalData {
    pub fn kind(&self) -> SignalKind {
        match self {
            SignalData::Offer { .. } => SignalKind::Offer,
            SignalData::Answer { .. } => SignalKind::Answer,
            SignalData::IceCandidate { .. } => SignalKind::IceCandidate,
            SignalData::EndCall { .. } => SignalKind::EndCall,
            SignalData::CallAccepted => SignalKind::CallAccepted,
        }
    }
}

/// Builds an immutable row ready for the signal store.
pub fn build_row(
    scope: &MatchScope,
    from: &ParticipantId,
    to: &ParticipantId,
    data: &SignalData,
) -> Result<SignalRow, Error> {
    let signal_data =
        serde_json::to_value(data).map_err(|e| Error::FailedToSendSignal(e.to_string()))?;
    Ok(SignalRow {
        id: Uuid::new_v4(),
        match_scope: scope.clone(),
        from_participant: from.clone(),
        to_participant: to.clone(),
        signal_type: data.kind(),
        signal_data,
        created_at: Utc::now(),
    })
}

/// Recovers the typed body from a row. A malformed row is dropped by the
/// caller, never propagated into the state machine.
pub fn decode_row(row: &SignalRow) -> Result<SignalData, Error> {
    serde_json::from_value(row.signal_data.clone())
        .map_err(|e| Error::InvalidSignal(e.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn row_kind_matches_payload_tag() {
        let scope = MatchScope::new("m1");
        let from = ParticipantId::new("a");
        let to = ParticipantId::new("b");
        let data = SignalData::EndCall {
            reason: Some(EndReason::Declined),
        };

        let row = build_row(&scope, &from, &to, &data).unwrap();
        assert_eq!(row.signal_type, SignalKind::EndCall);
        assert_eq!(row.signal_data["type"], "end-call");
        assert_eq!(row.signal_data["reason"], "declined");

        match decode_row(&row).unwrap() {
            SignalData::EndCall { reason } => assert_eq!(reason, Some(EndReason::Declined)),
            other => panic!("decoded wrong variant: {other}"),
        }
    }
}
