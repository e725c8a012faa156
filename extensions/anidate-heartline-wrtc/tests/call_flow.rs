use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use uuid::Uuid;

use anidate::{
    error::Error,
    heartline::{CallConfig, CallPhase, EndReason, Heartline, HeartlineEventKind, HeartlineEventStream},
    profile::{Profile, ProfileDirectory},
    signal::{
        memory::MemorySignalStore, MatchScope, ParticipantId, SignalKind, SignalRow, SignalStore,
    },
};
use anidate_heartline_wrtc::{
    host_media::{loopback::LoopbackMediaDevices, MediaDevices},
    HeartlineImpl,
};

struct StaticProfiles;

#[async_trait]
impl ProfileDirectory for StaticProfiles {
    async fn get_profile(&self, id: &ParticipantId) -> Result<Profile, Error> {
        Ok(Profile {
            id: id.clone(),
            display_name: id.as_str().to_string(),
            avatar_url: None,
        })
    }
}

struct UnresolvableProfiles;

#[async_trait]
impl ProfileDirectory for UnresolvableProfiles {
    async fn get_profile(&self, _id: &ParticipantId) -> Result<Profile, Error> {
        Err(Error::ProfileNotFound)
    }
}

fn peer(id: &str, store: &Arc<MemorySignalStore>, dial_timeout: Duration) -> HeartlineImpl {
    peer_with(
        id,
        store,
        Arc::new(LoopbackMediaDevices::new()),
        Arc::new(StaticProfiles),
        dial_timeout,
    )
}

fn peer_with(
    id: &str,
    store: &Arc<MemorySignalStore>,
    media: Arc<dyn MediaDevices>,
    profiles: Arc<dyn ProfileDirectory>,
    dial_timeout: Duration,
) -> HeartlineImpl {
    HeartlineImpl::new(
        ParticipantId::new(id),
        store.clone(),
        media,
        profiles,
        CallConfig {
            dial_timeout,
            ..Default::default()
        },
    )
    .expect("failed to build heartline instance")
}

/// An offer row as another client would have written it.
fn offer_row(scope: &str, from: &str, to: &str) -> SignalRow {
    SignalRow {
        id: Uuid::new_v4(),
        match_scope: MatchScope::new(scope),
        from_participant: ParticipantId::new(from),
        to_participant: ParticipantId::new(to),
        signal_type: SignalKind::Offer,
        signal_data: json!({
            "type": "offer",
            "description": {
                "type": "offer",
                "sdp": "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            },
        }),
        created_at: Utc::now(),
    }
}

async fn wait_event<F>(stream: &mut HeartlineEventStream, mut pred: F) -> HeartlineEventKind
where
    F: FnMut(&HeartlineEventKind) -> bool,
{
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match stream.next().await {
                Some(event) if pred(&event) => break event,
                Some(_) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn expect_no_event<F>(stream: &mut HeartlineEventStream, pred: F, wait: Duration)
where
    F: Fn(&HeartlineEventKind) -> bool,
{
    let unexpected = tokio::time::timeout(wait, async {
        loop {
            match stream.next().await {
                Some(event) if pred(&event) => break event,
                Some(_) => continue,
                None => futures::future::pending::<()>().await,
            }
        }
    })
    .await;
    if let Ok(event) = unexpected {
        panic!("unexpected event: {event:?}");
    }
}

async fn wait_phase(peer: &HeartlineImpl, phase: CallPhase) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if peer.call_state().await.expect("controller gone").phase == phase {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for phase {phase}"));
}

#[tokio::test(flavor = "multi_thread")]
async fn caller_and_callee_reach_connected() {
    let _ = env_logger::builder().is_test(true).try_init();

    let store = MemorySignalStore::new();
    let mut alice = peer("alice", &store, Duration::from_secs(30));
    let mut bob = peer("bob", &store, Duration::from_secs(30));
    let mut alice_events = alice.get_event_stream().await.unwrap();
    let mut bob_events = bob.get_event_stream().await.unwrap();

    alice
        .start_call(MatchScope::new("m1"), ParticipantId::new("bob"))
        .await
        .unwrap();

    let offer = match wait_event(&mut bob_events, |e| {
        matches!(e, HeartlineEventKind::IncomingCall { .. })
    })
    .await
    {
        HeartlineEventKind::IncomingCall { from, offer } => {
            assert_eq!(from.id, ParticipantId::new("alice"));
            offer
        }
        _ => unreachable!(),
    };

    let accepted = bob.accept_incoming().await.unwrap();
    assert_eq!(accepted.id, offer.id);
    bob.set_call_screen_active(true);
    bob.answer_call(accepted).await.unwrap();

    // the caller's UI hears about the acceptance before media flows
    wait_event(&mut alice_events, |e| {
        matches!(e, HeartlineEventKind::OutgoingCallAccepted { .. })
    })
    .await;

    wait_event(&mut alice_events, |e| {
        matches!(e, HeartlineEventKind::CallConnected { .. })
    })
    .await;
    wait_event(&mut bob_events, |e| {
        matches!(e, HeartlineEventKind::CallConnected { .. })
    })
    .await;

    assert_eq!(alice.call_state().await.unwrap().phase, CallPhase::Connected);
    assert_eq!(bob.call_state().await.unwrap().phase, CallPhase::Connected);

    wait_event(&mut alice_events, |e| {
        matches!(e, HeartlineEventKind::RemoteMediaArrived { .. })
    })
    .await;
    wait_event(&mut bob_events, |e| {
        matches!(e, HeartlineEventKind::RemoteMediaArrived { .. })
    })
    .await;
    assert!(!alice.remote_tracks().await.is_empty());
    assert!(!bob.remote_tracks().await.is_empty());

    let rows = store.rows();
    assert!(rows.iter().any(|r| {
        r.signal_type == SignalKind::Offer
            && r.from_participant == ParticipantId::new("alice")
            && r.to_participant == ParticipantId::new("bob")
            && r.match_scope == MatchScope::new("m1")
    }));
    assert!(rows.iter().any(|r| {
        r.signal_type == SignalKind::Answer
            && r.from_participant == ParticipantId::new("bob")
            && r.to_participant == ParticipantId::new("alice")
    }));
}

#[tokio::test(flavor = "multi_thread")]
async fn declined_call_never_touches_the_camera() {
    let store = MemorySignalStore::new();
    let bob_media = Arc::new(LoopbackMediaDevices::new());

    let mut alice = peer("alice", &store, Duration::from_secs(30));
    let mut bob = peer_with(
        "bob",
        &store,
        bob_media.clone(),
        Arc::new(StaticProfiles),
        Duration::from_secs(30),
    );
    let mut alice_events = alice.get_event_stream().await.unwrap();
    let mut bob_events = bob.get_event_stream().await.unwrap();

    alice
        .start_call(MatchScope::new("m1"), ParticipantId::new("bob"))
        .await
        .unwrap();

    wait_event(&mut bob_events, |e| {
        matches!(e, HeartlineEventKind::IncomingCall { .. })
    })
    .await;
    wait_phase(&bob, CallPhase::Incoming).await;

    bob.decline_call().await.unwrap();
    assert_eq!(bob.call_state().await.unwrap().phase, CallPhase::Ended);
    assert_eq!(bob_media.acquire_count(), 0);

    match wait_event(&mut alice_events, |e| {
        matches!(e, HeartlineEventKind::CallTerminated { .. })
    })
    .await
    {
        HeartlineEventKind::CallTerminated { reason } => {
            assert_eq!(reason, Some(EndReason::Declined));
        }
        _ => unreachable!(),
    }
    assert_eq!(alice.call_state().await.unwrap().phase, CallPhase::Ended);

    assert!(store.rows().iter().any(|r| {
        r.signal_type == SignalKind::EndCall
            && r.from_participant == ParticipantId::new("bob")
            && r.signal_data["reason"] == "declined"
    }));
}

#[tokio::test(flavor = "multi_thread")]
async fn unanswered_call_times_out() {
    let store = MemorySignalStore::new();
    let mut alice = peer("alice", &store, Duration::from_millis(500));
    let mut alice_events = alice.get_event_stream().await.unwrap();

    alice
        .start_call(MatchScope::new("m1"), ParticipantId::new("bob"))
        .await
        .unwrap();

    match wait_event(&mut alice_events, |e| {
        matches!(e, HeartlineEventKind::CallTerminated { .. })
    })
    .await
    {
        HeartlineEventKind::CallTerminated { reason } => {
            assert_eq!(reason, Some(EndReason::Timeout));
        }
        _ => unreachable!(),
    }
    assert_eq!(alice.call_state().await.unwrap().phase, CallPhase::Ended);

    // the abandoned attempt announced itself to the other side
    assert!(store.rows().iter().any(|r| {
        r.signal_type == SignalKind::EndCall && r.from_participant == ParticipantId::new("alice")
    }));
}

#[tokio::test(flavor = "multi_thread")]
async fn end_call_is_idempotent_and_releases_media() {
    let store = MemorySignalStore::new();
    let mut alice = peer("alice", &store, Duration::from_secs(30));

    alice
        .start_call(MatchScope::new("m1"), ParticipantId::new("bob"))
        .await
        .unwrap();

    let stream = alice.local_stream().await.expect("no local stream");
    assert!(stream.is_live());

    alice.end_call().await.unwrap();
    assert_eq!(alice.call_state().await.unwrap().phase, CallPhase::Ended);
    assert!(!stream.is_live());

    // the second end is a no-op
    alice.end_call().await.unwrap();
    assert_eq!(alice.call_state().await.unwrap().phase, CallPhase::Ended);
}

#[tokio::test]
async fn own_signals_are_ignored() {
    let store = MemorySignalStore::new();
    let mut alice = peer("alice", &store, Duration::from_secs(30));
    let mut alice_events = alice.get_event_stream().await.unwrap();

    // the feed echoes the subscriber's own writes
    store
        .append(offer_row("m1", "alice", "alice"))
        .await
        .unwrap();

    expect_no_event(
        &mut alice_events,
        |e| matches!(e, HeartlineEventKind::IncomingCall { .. }),
        Duration::from_millis(500),
    )
    .await;
    assert_eq!(alice.call_state().await.unwrap().phase, CallPhase::Idle);
}

#[tokio::test]
async fn later_offers_do_not_stack_prompts() {
    let store = MemorySignalStore::new();
    let mut alice = peer("alice", &store, Duration::from_secs(30));
    let mut alice_events = alice.get_event_stream().await.unwrap();

    store
        .append(offer_row("m1", "casey", "alice"))
        .await
        .unwrap();
    wait_event(&mut alice_events, |e| {
        matches!(e, HeartlineEventKind::IncomingCall { .. })
    })
    .await;

    store
        .append(offer_row("m2", "drew", "alice"))
        .await
        .unwrap();
    expect_no_event(
        &mut alice_events,
        |e| matches!(e, HeartlineEventKind::IncomingCall { .. }),
        Duration::from_millis(500),
    )
    .await;

    let pending = alice.pending_incoming().await.expect("prompt vanished");
    assert_eq!(pending.from_participant, ParticipantId::new("casey"));
}

#[tokio::test]
async fn prompt_is_suppressed_while_a_call_screen_is_active() {
    let store = MemorySignalStore::new();
    let mut alice = peer("alice", &store, Duration::from_secs(30));
    let mut alice_events = alice.get_event_stream().await.unwrap();

    alice.set_call_screen_active(true);
    // give the notifier task a beat to pick up the flag
    tokio::time::sleep(Duration::from_millis(50)).await;
    store
        .append(offer_row("m1", "casey", "alice"))
        .await
        .unwrap();

    expect_no_event(
        &mut alice_events,
        |e| matches!(e, HeartlineEventKind::IncomingCall { .. }),
        Duration::from_millis(500),
    )
    .await;
    assert!(alice.pending_incoming().await.is_none());

    // the offer still reached the state machine for in-screen handling
    wait_phase(&alice, CallPhase::Incoming).await;
}

#[tokio::test]
async fn unresolvable_caller_fails_closed() {
    let store = MemorySignalStore::new();
    let mut alice = peer_with(
        "alice",
        &store,
        Arc::new(LoopbackMediaDevices::new()),
        Arc::new(UnresolvableProfiles),
        Duration::from_secs(30),
    );
    let mut alice_events = alice.get_event_stream().await.unwrap();

    store
        .append(offer_row("m1", "casey", "alice"))
        .await
        .unwrap();

    expect_no_event(
        &mut alice_events,
        |e| matches!(e, HeartlineEventKind::IncomingCall { .. }),
        Duration::from_millis(500),
    )
    .await;
    assert!(alice.pending_incoming().await.is_none());
}

#[tokio::test]
async fn rejected_media_access_fails_the_attempt() {
    let store = MemorySignalStore::new();
    let mut alice = peer_with(
        "alice",
        &store,
        Arc::new(LoopbackMediaDevices::denied()),
        Arc::new(StaticProfiles),
        Duration::from_secs(30),
    );
    let mut alice_events = alice.get_event_stream().await.unwrap();

    let err = alice
        .start_call(MatchScope::new("m1"), ParticipantId::new("bob"))
        .await
        .expect_err("media acquisition should have been rejected");
    assert!(matches!(err, Error::MediaAccessFailure(_)));

    wait_event(&mut alice_events, |e| {
        matches!(e, HeartlineEventKind::CallFailed { .. })
    })
    .await;

    let state = alice.call_state().await.unwrap();
    assert_eq!(state.phase, CallPhase::Error);
    assert!(state.last_error.is_some());
}

#[tokio::test]
async fn toggles_flip_local_tracks_only() {
    let store = MemorySignalStore::new();
    let mut alice = peer("alice", &store, Duration::from_secs(30));

    // no stream yet: a silent no-op
    alice.toggle_video().await.unwrap();
    assert!(alice.call_state().await.unwrap().media.is_none());

    alice
        .start_call(MatchScope::new("m1"), ParticipantId::new("bob"))
        .await
        .unwrap();

    alice.toggle_video().await.unwrap();
    wait_media_flags(&alice, true, false).await;
    alice.toggle_audio().await.unwrap();
    wait_media_flags(&alice, false, false).await;
    alice.toggle_video().await.unwrap();
    wait_media_flags(&alice, false, true).await;

    assert_eq!(alice.call_state().await.unwrap().phase, CallPhase::Connecting);
}

async fn wait_media_flags(peer: &HeartlineImpl, audio: bool, video: bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let state = peer.call_state().await.expect("controller gone");
            if let Some(media) = state.media {
                if media.audio_enabled == audio && media.video_enabled == video {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("timed out waiting for media flags");
}
