//! simple-webrtc
//! This module augments the [webrtc-rs](https://github.com/webrtc-rs/webrtc) library with the
//! negotiation flow Heartline needs: exactly one live media connection per call attempt,
//! driven through a single offer/answer round-trip.
//!
//! WebRTC requires out of band signalling. The functions here return or accept session
//! descriptions and ICE candidates; transmitting them over the signal feed is the caller's
//! responsibility. Remote candidates may arrive before the remote description (they travel
//! as separate rows with no ordering guarantee) and are queued until the description lands.

use anyhow::{anyhow, bail, Result};

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

use anidate::heartline::CallConfig;
use anidate::signal::ParticipantId;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::sdp::extmap::AUDIO_LEVEL_URI;
use webrtc::track::track_remote::TrackRemote;

use crate::host_media::{opus_codec, vp8_codec, LocalStream};

use self::events::{EmittedEvents, WebRtcEventStream};

// public exports
pub mod events;

/// Owns at most one negotiated media connection. The session is recreated
/// for every call attempt and discarded whenever the call leaves
/// connecting/connected.
pub struct Controller {
    api: webrtc::api::API,
    session: Option<Session>,
    event_ch: broadcast::Sender<EmittedEvents>,
}

/// stores the RTCPeerConnection for updating SDP and ICE candidates,
/// along with the bookkeeping a single offer/answer round-trip needs
struct Session {
    remote: ParticipantId,
    connection: Arc<RTCPeerConnection>,
    /// gates early-arriving remote candidates
    remote_description_set: bool,
    /// FIFO. flushed once the remote description is applied
    pending_candidates: Vec<RTCIceCandidateInit>,
    /// track ids already registered, so re-attachment is a no-op
    attached: HashSet<String>,
    rtp_senders: Vec<RtcRtpManager>,
}

impl Session {
    async fn flush_pending_candidates(&mut self) {
        for candidate in self.pending_candidates.drain(..) {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                log::error!("failed to add queued ice candidate: {e}");
            }
        }
    }
}

pub struct RtcRtpManager {
    _sender: Arc<RTCRtpSender>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for RtcRtpManager {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// The following functions are driven by the call controller:
/// init
/// attach_local_tracks
/// dial
/// accept_offer
/// teardown
///
/// The following functions are driven by signaling
/// apply_remote_answer
/// add_remote_ice_candidate
impl Controller {
    pub fn new() -> Result<Self> {
        let (event_ch, _rx) = broadcast::channel(1024);
        Ok(Self {
            api: create_api()?,
            session: None,
            event_ch,
        })
    }

    pub fn get_event_stream(&self) -> WebRtcEventStream {
        let mut rx = self.event_ch.subscribe();
        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(_) => {}
                };
            }
        };
        WebRtcEventStream(Box::pin(stream))
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn remote(&self) -> Option<&ParticipantId> {
        self.session.as_ref().map(|s| &s.remote)
    }

    /// remote candidates queued behind the remote description
    pub fn pending_candidate_count(&self) -> usize {
        self.session
            .as_ref()
            .map(|s| s.pending_candidates.len())
            .unwrap_or_default()
    }

    /// Creates a fresh session for `remote`, configured with the STUN
    /// addresses from `config`. Any prior session is closed and discarded
    /// first.
    pub async fn init(&mut self, remote: ParticipantId, config: &CallConfig) -> Result<()> {
        self.teardown().await;

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let connection = Arc::new(self.api.new_peer_connection(rtc_config).await?);

        // configure callbacks

        let tx = self.event_ch.clone();
        let dest = remote.clone();
        connection.on_peer_connection_state_change(Box::new(
            move |c: RTCPeerConnectionState| {
                log::info!("WebRTC connection state for peer {} has changed {}", &dest, c);
                match c {
                    RTCPeerConnectionState::Unspecified => {}
                    RTCPeerConnectionState::New => {}
                    RTCPeerConnectionState::Connecting => {}
                    RTCPeerConnectionState::Connected => {
                        if let Err(e) = tx.send(EmittedEvents::Connected) {
                            log::error!("failed to send Connected event for peer {}: {}", &dest, e);
                        }
                    }
                    RTCPeerConnectionState::Disconnected => {
                        if let Err(e) = tx.send(EmittedEvents::Disconnected) {
                            log::error!(
                                "failed to send disconnect event for peer {}: {}",
                                &dest,
                                e
                            );
                        }
                    }
                    RTCPeerConnectionState::Failed => {
                        if let Err(e) = tx.send(EmittedEvents::ConnectionFailed) {
                            log::error!(
                                "failed to send ConnectionFailed event for peer {}: {}",
                                &dest,
                                e
                            );
                        }
                    }
                    RTCPeerConnectionState::Closed => {
                        if let Err(e) = tx.send(EmittedEvents::ConnectionClosed) {
                            log::error!(
                                "failed to send ConnectionClosed event for peer {}: {}",
                                &dest,
                                e
                            );
                        }
                    }
                }

                Box::pin(futures::future::ready(()))
            },
        ));

        let tx = self.event_ch.clone();
        connection.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            if let Some(candidate) = c {
                if let Err(e) = tx.send(EmittedEvents::Ice {
                    candidate: Box::new(candidate),
                }) {
                    log::error!("failed to send ice candidate: {e}");
                }
            }
            Box::pin(futures::future::ready(()))
        }));

        let dest = remote.clone();
        connection.on_ice_connection_state_change(Box::new(
            move |connection_state: RTCIceConnectionState| {
                log::info!(
                    "ICE connection state for peer {} has changed {}",
                    &dest,
                    connection_state
                );

                Box::pin(futures::future::ready(()))
            },
        ));

        let tx = self.event_ch.clone();
        connection.on_track(Box::new(
            move |track: Option<Arc<TrackRemote>>, _receiver| {
                if let Some(track) = track {
                    if let Err(e) = tx.send(EmittedEvents::TrackAdded { track }) {
                        log::error!("failed to send track added event: {e}");
                    }
                }
                Box::pin(futures::future::ready(()))
            },
        ));

        self.session = Some(Session {
            remote,
            connection,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            attached: HashSet::new(),
            rtp_senders: Vec::new(),
        });

        Ok(())
    }

    /// Registers every track of the local stream on the connection so they
    /// are sent to the remote peer. Tracks already registered with this
    /// session are skipped.
    pub async fn attach_local_tracks(&mut self, stream: &LocalStream) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("no session initialized"))?;

        for track in stream.tracks() {
            if !session.attached.insert(track.id().to_string()) {
                log::warn!("track {} already attached", track.id());
                continue;
            }
            let rtp_sender = session.connection.add_track(track.rtp()).await?;

            // Read incoming RTCP packets
            // Before these packets are returned they are processed by interceptors. For things
            // like NACK this needs to be called.
            let sender2 = rtp_sender.clone();
            let handle = tokio::spawn(async move {
                let mut rtcp_buf = vec![0u8; 1500];
                while let Ok((_, _)) = sender2.read(&mut rtcp_buf).await {}
                log::debug!("terminating rtp_sender thread from attach_local_tracks");
            });
            session.rtp_senders.push(RtcRtpManager {
                _sender: rtp_sender,
                handle,
            });
        }

        Ok(())
    }

    /// creates the local offer and sets it as the local description,
    /// which starts the gathering of ICE candidates. The returned offer
    /// is transmitted over the signal feed.
    pub async fn dial(&mut self) -> Result<RTCSessionDescription> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("no session initialized"))?;

        let local_sdp = session.connection.create_offer(None).await?;
        session
            .connection
            .set_local_description(local_sdp.clone())
            .await?;

        Ok(local_sdp)
    }

    /// applies the remote offer, then produces and sets the matching
    /// answer, returned for transmission. Fails if a remote description
    /// was already applied to this session.
    pub async fn accept_offer(
        &mut self,
        remote_sdp: RTCSessionDescription,
    ) -> Result<RTCSessionDescription> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("no session initialized"))?;

        if session.remote_description_set {
            bail!("remote description already set for this session");
        }

        session.connection.set_remote_description(remote_sdp).await?;
        session.remote_description_set = true;
        session.flush_pending_candidates().await;

        let answer = session.connection.create_answer(None).await?;
        session
            .connection
            .set_local_description(answer.clone())
            .await?;

        Ok(answer)
    }

    /// completes the negotiation started by `dial`. A repeated answer is
    /// logged and ignored rather than crashing the session.
    pub async fn apply_remote_answer(&mut self, remote_sdp: RTCSessionDescription) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("no session initialized"))?;

        if session.remote_description_set {
            log::debug!("ignoring duplicate answer");
            return Ok(());
        }

        session.connection.set_remote_description(remote_sdp).await?;
        session.remote_description_set = true;
        session.flush_pending_candidates().await;

        Ok(())
    }

    /// receive an ICE candidate from the remote side. Applied immediately
    /// when a remote description exists, queued otherwise.
    pub async fn add_remote_ice_candidate(
        &mut self,
        candidate: RTCIceCandidateInit,
    ) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("no session initialized"))?;

        if session.remote_description_set {
            session.connection.add_ice_candidate(candidate).await?;
        } else {
            session.pending_candidates.push(candidate);
        }

        Ok(())
    }

    /// Closes the connection and releases all session resources. Safe to
    /// call on an already-closed or never-initialized controller.
    pub async fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.connection.close().await {
                log::error!("failed to close peer connection: {e}");
            }
        }
    }
}

fn create_api() -> Result<webrtc::api::API> {
    let mut media = MediaEngine::default();

    media.register_header_extension(
        webrtc::rtp_transceiver::rtp_codec::RTCRtpHeaderExtensionCapability {
            uri: AUDIO_LEVEL_URI.into(),
        },
        RTPCodecType::Audio,
        Some(RTCRtpTransceiverDirection::Sendrecv),
    )?;

    media.register_codec(
        RTCRtpCodecParameters {
            capability: opus_codec(),
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    media.register_codec(
        RTCRtpCodecParameters {
            capability: vp8_codec(),
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    // Create a InterceptorRegistry. This is the user configurable RTP/RTCP Pipeline.
    // This provides NACKs, RTCP Reports and other features. If you use `webrtc.NewPeerConnection`
    // this is enabled by default. If you are manually managing You MUST create a InterceptorRegistry
    // for each PeerConnection.
    let mut registry = Registry::new();

    // Use the default set of Interceptors
    registry = register_default_interceptors(registry, &mut media)?;

    // Create the API object with the MediaEngine
    Ok(APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .build())
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use futures::StreamExt;

    use super::*;
    use crate::host_media::{LocalTrack, AUDIO_SOURCE_ID, VIDEO_SOURCE_ID};

    fn local_stream() -> LocalStream {
        LocalStream::new(
            LocalTrack::new(AUDIO_SOURCE_ID, opus_codec()),
            LocalTrack::new(VIDEO_SOURCE_ID, vp8_codec()),
        )
    }

    async fn dialed_controller() -> (Controller, WebRtcEventStream, RTCSessionDescription) {
        let mut controller = Controller::new().unwrap();
        controller
            .init(ParticipantId::new("remote"), &CallConfig::default())
            .await
            .unwrap();
        controller.attach_local_tracks(&local_stream()).await.unwrap();
        // subscribe before dialing so no gathered candidate is missed
        let events = controller.get_event_stream();
        let offer = controller.dial().await.unwrap();
        (controller, events, offer)
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let mut controller = Controller::new().unwrap();
        controller.teardown().await;

        controller
            .init(ParticipantId::new("remote"), &CallConfig::default())
            .await
            .unwrap();
        controller.teardown().await;
        controller.teardown().await;
        assert!(!controller.has_session());
    }

    #[tokio::test]
    async fn candidates_queue_until_remote_description() {
        let (mut offerer, mut events, offer) = dialed_controller().await;

        // gathering started when the local description was set; take the
        // first discovered host candidate
        let candidate = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.next().await {
                    Some(EmittedEvents::Ice { candidate }) => break candidate,
                    Some(_) => continue,
                    None => panic!("event stream closed before a candidate arrived"),
                }
            }
        })
        .await
        .expect("no ice candidate gathered");

        let mut answerer = Controller::new().unwrap();
        answerer
            .init(ParticipantId::new("caller"), &CallConfig::default())
            .await
            .unwrap();

        answerer
            .add_remote_ice_candidate(candidate.to_json().unwrap())
            .await
            .unwrap();
        assert_eq!(answerer.pending_candidate_count(), 1);

        answerer.attach_local_tracks(&local_stream()).await.unwrap();
        answerer.accept_offer(offer).await.unwrap();
        assert_eq!(answerer.pending_candidate_count(), 0);

        offerer.teardown().await;
        answerer.teardown().await;
    }

    #[tokio::test]
    async fn duplicate_answer_is_ignored() {
        let (mut offerer, _events, offer) = dialed_controller().await;

        let mut answerer = Controller::new().unwrap();
        answerer
            .init(ParticipantId::new("caller"), &CallConfig::default())
            .await
            .unwrap();
        answerer.attach_local_tracks(&local_stream()).await.unwrap();
        let answer = answerer.accept_offer(offer).await.unwrap();

        offerer.apply_remote_answer(answer.clone()).await.unwrap();
        // the second answer must neither error nor disturb the session
        offerer.apply_remote_answer(answer).await.unwrap();

        offerer.teardown().await;
        answerer.teardown().await;
    }

    #[tokio::test]
    async fn second_remote_offer_is_rejected() {
        let (mut offerer, _events, offer) = dialed_controller().await;

        let mut answerer = Controller::new().unwrap();
        answerer
            .init(ParticipantId::new("caller"), &CallConfig::default())
            .await
            .unwrap();
        answerer.attach_local_tracks(&local_stream()).await.unwrap();
        answerer.accept_offer(offer.clone()).await.unwrap();
        assert!(answerer.accept_offer(offer).await.is_err());

        offerer.teardown().await;
        answerer.teardown().await;
    }

    #[tokio::test]
    async fn reattaching_tracks_is_a_noop() {
        let mut controller = Controller::new().unwrap();
        controller
            .init(ParticipantId::new("remote"), &CallConfig::default())
            .await
            .unwrap();

        let stream = local_stream();
        controller.attach_local_tracks(&stream).await.unwrap();
        controller.attach_local_tracks(&stream).await.unwrap();

        let session = controller.session.as_ref().unwrap();
        assert_eq!(session.attached.len(), 2);
        assert_eq!(session.rtp_senders.len(), 2);

        controller.teardown().await;
    }
}
