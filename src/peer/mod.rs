//! One end of one real-time media session. The peer gets told about the
//! outside world through its public methods and tells the outside world what
//! happens inside the peer connection by posting [`PeerEvent`]s to its sink.

pub mod subscription;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_remote::TrackRemote;

use crate::conference::publisher::{RemoteSource, SourceError};
use crate::entity::ParticipantId;
use crate::signaling::{Candidate, HangupReason};
use crate::sink::MessageSink;
use subscription::Subscription;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {
    #[error("can't create peer connection")]
    CantCreatePeerConnection,
    #[error("can't set remote description")]
    CantSetRemoteDescription,
    #[error("can't create answer")]
    CantCreateAnswer,
    #[error("can't set local description")]
    CantSetLocalDescription,
    #[error("data channel is not available")]
    DataChannelNotAvailable,
    #[error("data channel is not ready")]
    DataChannelNotReady,
    #[error("can't subscribe to track")]
    CantSubscribeToTrack,
    #[error("track not found")]
    TrackNotFound,
    #[error("can't write RTCP")]
    CantWriteRtcp,
    #[error(transparent)]
    Engine(#[from] webrtc::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl From<RTPCodecType> for TrackKind {
    fn from(kind: RTPCodecType) -> Self {
        match kind {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        }
    }
}

/// One of the independent encodings of a simulcast source, identified on the
/// wire by its RID header extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SimulcastLayer {
    None,
    Low,
    Medium,
    High,
}

impl SimulcastLayer {
    pub fn from_rid(rid: &str) -> Self {
        match rid {
            "l" => SimulcastLayer::Low,
            "m" => SimulcastLayer::Medium,
            "h" => SimulcastLayer::High,
            _ => SimulcastLayer::None,
        }
    }

    pub fn rid(&self) -> &'static str {
        match self {
            SimulcastLayer::Low => "l",
            SimulcastLayer::Medium => "m",
            SimulcastLayer::High => "h",
            SimulcastLayer::None => "",
        }
    }
}

impl std::fmt::Display for SimulcastLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimulcastLayer::None => f.write_str("none"),
            SimulcastLayer::Low => f.write_str("low"),
            SimulcastLayer::Medium => f.write_str("medium"),
            SimulcastLayer::High => f.write_str("high"),
        }
    }
}

/// Everything needed to identify one layer of one published track and to
/// build a matching local track for a subscriber.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub track_id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    pub codec: RTCRtpCodecCapability,
    pub layer: SimulcastLayer,
}

impl TrackInfo {
    pub fn from_remote(track: &TrackRemote) -> Self {
        Self {
            track_id: track.id(),
            stream_id: track.stream_id(),
            kind: track.kind().into(),
            codec: track.codec().capability,
            layer: SimulcastLayer::from_rid(track.rid()),
        }
    }
}

/// The RTCP feedback kinds the SFU forwards; everything else is dropped at
/// the edge.
#[derive(Debug, Clone)]
pub enum RtcpPacket {
    PictureLossIndication(PictureLossIndication),
    FullIntraRequest(FullIntraRequest),
}

#[derive(Debug)]
pub enum PeerEvent {
    IceCandidateGathered(Candidate),
    IceGatheringComplete,
    RenegotiationRequired(RTCSessionDescription),
    NewTrack(Arc<TrackRemote>),
    RtcpReceived {
        track: TrackInfo,
        packets: Vec<RtcpPacket>,
    },
    DataChannelAvailable,
    DataChannelMessage(String),
    JoinedTheCall,
    LeftTheCall(HangupReason),
}

pub type PeerSink = MessageSink<ParticipantId, PeerEvent>;

#[derive(Debug, Clone, Copy)]
pub struct PeerConfig {
    /// How long we tolerate silence on the heartbeat channel before treating
    /// the participant as gone.
    pub keep_alive_deadline: Duration,
    /// Minimum spacing between key-frame requests forwarded to this peer.
    pub pli_min_interval: Duration,
    /// Stall timeout for subscriptions created on this peer.
    pub subscription_stall_timeout: Duration,
}

pub struct Peer {
    pc: Arc<RTCPeerConnection>,
    sink: PeerSink,
    data_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    heartbeat_tx: mpsc::UnboundedSender<()>,
    last_keyframe_forward: Mutex<Instant>,
    config: PeerConfig,
}

impl Peer {
    /// Creates the underlying peer connection, wires the callback set into
    /// the sink, applies the SDP offer and returns the peer together with the
    /// SDP answer.
    pub async fn new(
        offer_sdp: String,
        sink: PeerSink,
        config: PeerConfig,
    ) -> Result<(Arc<Self>, String), PeerError> {
        let pc = create_peer_connection().await?;

        let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            pc: pc.clone(),
            sink: sink.clone(),
            data_channel: Mutex::new(None),
            heartbeat_tx,
            last_keyframe_forward: Mutex::new(Instant::now() - config.pli_min_interval),
            config,
        });

        peer.register_callbacks();
        peer.spawn_keep_alive(heartbeat_rx);

        let answer = peer.process_sdp_offer(offer_sdp).await?;
        Ok((peer, answer.sdp))
    }

    fn register_callbacks(self: &Arc<Self>) {
        let sink = self.sink.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let sink = sink.clone();
                Box::pin(async move {
                    let _ = sink.send(PeerEvent::NewTrack(track));
                })
            },
        ));

        let sink = self.sink.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = sink.clone();
                Box::pin(async move {
                    match candidate {
                        Some(candidate) => match candidate.to_json() {
                            Ok(init) => {
                                let _ = sink.send(PeerEvent::IceCandidateGathered(Candidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_m_line_index: init.sdp_mline_index,
                                }));
                            }
                            Err(err) => {
                                tracing::error!(error = %err, "failed to serialize ICE candidate");
                            }
                        },
                        None => {
                            tracing::debug!("ICE candidate gathering finished");
                            let _ = sink.send(PeerEvent::IceGatheringComplete);
                        }
                    }
                })
            }));

        let sink = self.sink.clone();
        let pc = Arc::downgrade(&self.pc);
        self.pc.on_negotiation_needed(Box::new(move || {
            let sink = sink.clone();
            let pc = pc.clone();
            Box::pin(async move {
                let Some(pc) = pc.upgrade() else { return };
                tracing::debug!("negotiation needed");
                let offer = match pc.create_offer(None).await {
                    Ok(offer) => offer,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to create offer");
                        return;
                    }
                };
                if let Err(err) = pc.set_local_description(offer.clone()).await {
                    tracing::error!(error = %err, "failed to set local description");
                    return;
                }
                let _ = sink.send(PeerEvent::RenegotiationRequired(offer));
            })
        }));

        let sink = self.sink.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    tracing::info!(%state, "connection state changed");
                    match state {
                        RTCPeerConnectionState::Connected => {
                            let _ = sink.send(PeerEvent::JoinedTheCall);
                        }
                        RTCPeerConnectionState::Failed => {
                            let _ = sink.send(PeerEvent::LeftTheCall(HangupReason::IceFailed));
                        }
                        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                            let _ = sink.send(PeerEvent::LeftTheCall(HangupReason::UserHangup));
                        }
                        _ => {}
                    }
                })
            }));

        self.pc.on_ice_connection_state_change(Box::new(|state| {
            // ICE failures do not trigger a restart here. See the design
            // notes: transitions are observed and logged only.
            tracing::info!(%state, "ICE connection state changed");
            Box::pin(async {})
        }));

        self.pc.on_ice_gathering_state_change(Box::new(|state| {
            tracing::debug!(%state, "ICE gathering state changed");
            Box::pin(async {})
        }));

        self.pc.on_signaling_state_change(Box::new(|state| {
            tracing::debug!(%state, "signaling state changed");
            Box::pin(async {})
        }));

        let peer = Arc::downgrade(self);
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let peer = peer.clone();
                Box::pin(async move {
                    if let Some(peer) = peer.upgrade() {
                        peer.register_data_channel(dc).await;
                    }
                })
            }));
    }

    async fn register_data_channel(&self, dc: Arc<RTCDataChannel>) {
        let duplicate = {
            let mut slot = self.data_channel.lock().expect("data channel lock");
            if slot.is_some() {
                true
            } else {
                *slot = Some(dc.clone());
                false
            }
        };
        if duplicate {
            tracing::error!("data channel already exists, closing the new one");
            if let Err(err) = dc.close().await {
                tracing::error!(error = %err, "failed to close duplicate data channel");
            }
            return;
        }

        tracing::debug!(label = dc.label(), "data channel ready");

        let sink = self.sink.clone();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                let _ = sink.send(PeerEvent::DataChannelAvailable);
            })
        }));

        let sink = self.sink.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = sink.clone();
            Box::pin(async move {
                if !msg.is_string {
                    tracing::warn!("data channel message is not a string, ignoring");
                    return;
                }
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = sink.send(PeerEvent::DataChannelMessage(text));
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "data channel message is not valid UTF-8");
                    }
                }
            })
        }));

        dc.on_error(Box::new(|err| {
            tracing::error!(error = %err, "data channel error");
            Box::pin(async {})
        }));

        dc.on_close(Box::new(|| {
            tracing::info!("data channel closed");
            Box::pin(async {})
        }));
    }

    fn spawn_keep_alive(&self, mut heartbeat_rx: mpsc::UnboundedReceiver<()>) {
        let sink = self.sink.clone();
        let deadline = self.config.keep_alive_deadline;
        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(deadline, heartbeat_rx.recv()).await {
                    Ok(Some(())) => continue,
                    // The peer is gone; nothing left to watch.
                    Ok(None) => break,
                    Err(_) => {
                        tracing::warn!("keep-alive deadline expired");
                        let _ = sink.send(PeerEvent::LeftTheCall(HangupReason::KeepAliveTimeout));
                        break;
                    }
                }
            }
        });
    }

    /// Applies the SDP offer from the remote peer and returns our answer.
    pub async fn process_sdp_offer(
        &self,
        offer_sdp: String,
    ) -> Result<RTCSessionDescription, PeerError> {
        let offer = RTCSessionDescription::offer(offer_sdp).map_err(|err| {
            tracing::error!(error = %err, "malformed SDP offer");
            PeerError::CantSetRemoteDescription
        })?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "failed to set remote description");
                PeerError::CantSetRemoteDescription
            })?;

        let answer = self.pc.create_answer(None).await.map_err(|err| {
            tracing::error!(error = %err, "failed to create answer");
            PeerError::CantCreateAnswer
        })?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "failed to set local description");
                PeerError::CantSetLocalDescription
            })?;

        Ok(answer)
    }

    /// Applies the SDP answer the remote peer sent for our offer.
    pub async fn process_sdp_answer(&self, answer_sdp: String) -> Result<(), PeerError> {
        let answer = RTCSessionDescription::answer(answer_sdp).map_err(|err| {
            tracing::error!(error = %err, "malformed SDP answer");
            PeerError::CantSetRemoteDescription
        })?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|err| {
                tracing::error!(error = %err, "failed to set remote description");
                PeerError::CantSetRemoteDescription
            })?;
        Ok(())
    }

    pub async fn add_remote_candidates(&self, candidates: Vec<Candidate>) {
        for candidate in candidates {
            let init = RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: None,
            };
            if let Err(err) = self.pc.add_ice_candidate(init).await {
                tracing::error!(error = %err, "failed to add ICE candidate");
            }
        }
    }

    /// Adds a local track mirroring `info` to this peer's session so that the
    /// remote end starts receiving it, and spawns its RTCP return path.
    pub async fn subscribe_to(self: &Arc<Self>, info: TrackInfo) -> Result<Arc<Subscription>, PeerError> {
        let controller = Arc::new(ConnectionWrapper {
            pc: Arc::downgrade(&self.pc),
            sink: self.sink.clone(),
        });
        let subscription =
            Subscription::new(info.clone(), controller, self.config.subscription_stall_timeout)
                .await
                .map_err(|err| {
                    tracing::error!(error = %err, track_id = %info.track_id, "failed to subscribe to track");
                    PeerError::CantSubscribeToTrack
                })?;
        tracing::info!(track_id = %info.track_id, layer = %info.layer, "subscribed to track");
        Ok(subscription)
    }

    /// Detaches the given subscriptions from this peer's session.
    pub async fn unsubscribe_from(&self, subscriptions: &[Arc<Subscription>]) {
        for subscription in subscriptions {
            if let Err(err) = subscription.unsubscribe().await {
                tracing::warn!(error = %err, "failed to unsubscribe from track");
            }
        }
    }

    /// Check-and-stamp for the peer-wide key-frame request throttle. Every
    /// PLI/FIR towards this peer passes through here, whichever path asked
    /// for it, so requests from different subscribers cannot stack up within
    /// one interval.
    fn keyframe_request_allowed(&self) -> bool {
        let mut last = self
            .last_keyframe_forward
            .lock()
            .expect("keyframe lock poisoned");
        if last.elapsed() < self.config.pli_min_interval {
            return false;
        }
        *last = Instant::now();
        true
    }

    /// Asks this peer for a key-frame on the track with the given SSRC,
    /// subject to the peer-wide throttle.
    pub(crate) async fn request_keyframe(&self, ssrc: u32) -> Result<(), PeerError> {
        if !self.keyframe_request_allowed() {
            return Ok(());
        }
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc: ssrc,
        };
        self.pc.write_rtcp(&[Box::new(pli)]).await.map_err(|err| {
            tracing::error!(error = %err, "failed to write RTCP");
            PeerError::CantWriteRtcp
        })?;
        Ok(())
    }

    /// Forwards key-frame requests to this peer, rewriting each packet's
    /// media SSRC to the SSRC of the receiver track identified by `info`;
    /// the remote endpoint would not recognize the report otherwise. Requests
    /// share the peer-wide throttle; anything that is not a PLI or FIR has
    /// already been dropped at the edge.
    pub async fn write_rtcp(
        &self,
        info: &TrackInfo,
        packets: Vec<RtcpPacket>,
    ) -> Result<(), PeerError> {
        if packets.is_empty() {
            return Ok(());
        }

        let mut ssrc = None;
        'outer: for receiver in self.pc.get_receivers().await {
            for track in receiver.tracks().await {
                if track.id() == info.track_id
                    && SimulcastLayer::from_rid(track.rid()) == info.layer
                {
                    ssrc = Some(track.ssrc());
                    break 'outer;
                }
            }
        }
        let Some(ssrc) = ssrc else {
            return Err(PeerError::TrackNotFound);
        };

        if !self.keyframe_request_allowed() {
            return Ok(());
        }

        let to_send: Vec<Box<dyn rtcp::packet::Packet + Send + Sync>> = packets
            .into_iter()
            .map(|packet| match packet {
                RtcpPacket::PictureLossIndication(mut pli) => {
                    pli.media_ssrc = ssrc;
                    Box::new(pli) as Box<dyn rtcp::packet::Packet + Send + Sync>
                }
                RtcpPacket::FullIntraRequest(mut fir) => {
                    fir.media_ssrc = ssrc;
                    Box::new(fir) as Box<dyn rtcp::packet::Packet + Send + Sync>
                }
            })
            .collect();

        self.pc.write_rtcp(&to_send).await.map_err(|err| {
            tracing::error!(error = %err, "failed to write RTCP");
            PeerError::CantWriteRtcp
        })?;
        Ok(())
    }

    /// Tries to send the given text to the remote counterpart of this peer.
    pub async fn send_over_data_channel(&self, text: String) -> Result<(), PeerError> {
        let dc = {
            let slot = self.data_channel.lock().expect("data channel lock");
            slot.clone()
        };
        let Some(dc) = dc else {
            return Err(PeerError::DataChannelNotAvailable);
        };
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(PeerError::DataChannelNotReady);
        }
        dc.send_text(text).await?;
        Ok(())
    }

    /// Resets the keep-alive deadline.
    pub fn process_heartbeat(&self) {
        let _ = self.heartbeat_tx.send(());
    }

    /// Builds a [`RemoteSource`] for a track received on this peer, used to
    /// drive a publisher: reads come from the track, key-frame requests go
    /// out as PLIs through this peer's throttled RTCP path.
    pub fn remote_source(self: &Arc<Self>, track: Arc<TrackRemote>) -> RemoteTrackSource {
        RemoteTrackSource {
            track,
            peer: Arc::downgrade(self),
        }
    }

    /// Closes the connection and seals the outbound sink, in that order; no
    /// new events from this peer are observable afterwards.
    pub async fn terminate(&self) {
        if let Err(err) = self.pc.close().await {
            tracing::error!(error = %err, "failed to close peer connection");
        }
        self.sink.seal();
    }
}

async fn create_peer_connection() -> Result<Arc<RTCPeerConnection>, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(|err| {
        tracing::error!(error = %err, "failed to register codecs");
        PeerError::CantCreatePeerConnection
    })?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine).map_err(
        |err| {
            tracing::error!(error = %err, "failed to register interceptors");
            PeerError::CantCreatePeerConnection
        },
    )?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = api
        .new_peer_connection(RTCConfiguration::default())
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "failed to create peer connection");
            PeerError::CantCreatePeerConnection
        })?;
    Ok(Arc::new(pc))
}

/// Publisher-side adapter around a received track. Holds its peer weakly:
/// a publisher must not keep a terminated peer alive.
pub struct RemoteTrackSource {
    track: Arc<TrackRemote>,
    peer: Weak<Peer>,
}

#[async_trait]
impl RemoteSource for RemoteTrackSource {
    async fn read_rtp(&self) -> Result<rtp::packet::Packet, SourceError> {
        match self.track.read_rtp().await {
            Ok((packet, _attributes)) => Ok(packet),
            Err(webrtc::Error::ErrClosedPipe) | Err(webrtc::Error::ErrConnectionClosed) => {
                Err(SourceError::Closed)
            }
            Err(err) => Err(SourceError::Failed(err.to_string())),
        }
    }

    async fn request_keyframe(&self) -> Result<(), SourceError> {
        let Some(peer) = self.peer.upgrade() else {
            return Err(SourceError::Closed);
        };
        peer.request_keyframe(self.track.ssrc())
            .await
            .map_err(|err| SourceError::Failed(err.to_string()))
    }
}

/// The slice of the peer a subscription is allowed to touch.
pub(crate) struct ConnectionWrapper {
    pc: Weak<RTCPeerConnection>,
    sink: PeerSink,
}

#[async_trait]
impl subscription::ConnectionController for ConnectionWrapper {
    async fn subscribe(
        &self,
        track: Arc<webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP>,
    ) -> Result<Arc<webrtc::rtp_transceiver::rtp_sender::RTCRtpSender>, webrtc::Error> {
        let pc = self.pc.upgrade().ok_or(webrtc::Error::ErrConnectionClosed)?;
        pc.add_track(track).await
    }

    async fn unsubscribe(
        &self,
        sender: &Arc<webrtc::rtp_transceiver::rtp_sender::RTCRtpSender>,
    ) -> Result<(), webrtc::Error> {
        let pc = self.pc.upgrade().ok_or(webrtc::Error::ErrConnectionClosed)?;
        pc.remove_track(sender).await
    }

    /// The publisher of `info` lives on a different peer, so a key-frame
    /// request travels up through the sink as synthesized RTCP feedback and
    /// the conference routes it to the publishing peer.
    async fn request_keyframe(&self, info: &TrackInfo) {
        let _ = self.sink.send(PeerEvent::RtcpReceived {
            track: info.clone(),
            packets: vec![RtcpPacket::PictureLossIndication(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc: 0,
            })],
        });
    }
}
