//! The single-writer actor owning one group call: its participants, their
//! published tracks and the subscriptions between them. All state mutation
//! happens inside the conference loop; peers and publishers communicate with
//! it exclusively through messages.

pub mod participant;
pub mod publisher;
pub mod track;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::actor::{Actor, ActorError};
use crate::config::ConferenceConfig;
use crate::entity::{ConferenceId, ParticipantId};
use crate::peer::{Peer, PeerConfig, PeerEvent, RtcpPacket, TrackInfo};
use crate::router::RouterMessage;
use crate::signaling::{
    CandidatesContent, ConferenceSignaler, DataChannelEvent, HangupContent, HangupReason,
    InviteContent, SelectAnswerContent, SessionDescription, SignalerMessage, StreamMetadataMap,
    TrackSubscribeRequest,
};
use crate::sink::{Message, MessageSink};
use participant::Participant;
use publisher::{Publisher, PublisherConfig, PublisherStatus};
use track::PublishedTrack;

/// The signaling operations a conference accepts, one variant per to-device
/// call event.
#[derive(Debug)]
pub enum SignalingContent {
    CallInvite(InviteContent),
    CallCandidates(CandidatesContent),
    CallSelectAnswer(SelectAnswerContent),
    CallHangup(HangupContent),
}

pub type SignalingMessage = Message<ParticipantId, SignalingContent>;

/// Status transition of one publisher, forwarded into the conference inbox
/// so the layer-switching logic runs on the conference loop.
#[derive(Debug)]
struct PublisherStatusUpdate {
    owner: ParticipantId,
    track_id: String,
    layer: crate::peer::SimulcastLayer,
    status: PublisherStatus,
}

#[derive(Clone)]
pub struct ConferenceHandle {
    pub id: ConferenceId,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

impl ConferenceHandle {
    /// Fails when the conference has sealed its inbox.
    pub fn send(
        &self,
        message: SignalingMessage,
    ) -> Result<(), mpsc::error::SendError<SignalingMessage>> {
        self.tx.send(message)
    }
}

pub struct Conference {
    id: ConferenceId,
    config: ConferenceConfig,
    signaler: ConferenceSignaler,
    participants: HashMap<ParticipantId, Participant>,

    inbox_rx: mpsc::UnboundedReceiver<SignalingMessage>,
    peer_events_tx: mpsc::UnboundedSender<Message<ParticipantId, PeerEvent>>,
    peer_events_rx: mpsc::UnboundedReceiver<Message<ParticipantId, PeerEvent>>,
    publisher_events_tx: mpsc::UnboundedSender<PublisherStatusUpdate>,
    publisher_events_rx: mpsc::UnboundedReceiver<PublisherStatusUpdate>,
    router_tx: mpsc::UnboundedSender<RouterMessage>,

    /// Set once the first invite is processed; a conference whose last
    /// participant left (or whose only invite failed) ends.
    saw_invite: bool,
}

impl Conference {
    /// Builds a conference; the caller spawns it via [`crate::actor::run`]
    /// and keeps the handle for routing.
    pub fn new(
        id: ConferenceId,
        config: ConferenceConfig,
        signaler: ConferenceSignaler,
        router_tx: mpsc::UnboundedSender<RouterMessage>,
    ) -> (ConferenceHandle, Self) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let (publisher_events_tx, publisher_events_rx) = mpsc::unbounded_channel();
        let handle = ConferenceHandle {
            id: id.clone(),
            tx: inbox_tx,
        };
        let conference = Self {
            id,
            config,
            signaler,
            participants: HashMap::new(),
            inbox_rx,
            peer_events_tx,
            peer_events_rx,
            publisher_events_tx,
            publisher_events_rx,
            router_tx,
            saw_invite: false,
        };
        (handle, conference)
    }
}

impl Actor for Conference {
    type Id = ConferenceId;

    fn kind(&self) -> &'static str {
        "conference"
    }

    fn id(&self) -> Self::Id {
        self.id.clone()
    }

    async fn run(&mut self) -> Result<(), ActorError> {
        loop {
            tokio::select! {
                Some(message) = self.inbox_rx.recv() => self.handle_signaling(message).await,
                Some(message) = self.peer_events_rx.recv() => self.handle_peer_event(message).await,
                Some(update) = self.publisher_events_rx.recv() => self.handle_publisher_update(update).await,
                else => break,
            }

            if self.saw_invite && self.participants.is_empty() {
                tracing::info!("last participant left, ending conference");
                break;
            }
        }

        // Seal the inbox; a message that raced the seal is handed back to
        // the router together with the end notification.
        self.inbox_rx.close();
        let unread = self.inbox_rx.try_recv().ok();
        let _ = self.router_tx.send(RouterMessage::ConferenceEnded {
            conference_id: self.id.clone(),
            unread,
        });
        Ok(())
    }
}

impl Conference {
    async fn handle_signaling(&mut self, message: SignalingMessage) {
        let sender = message.sender;
        match message.content {
            SignalingContent::CallInvite(invite) => {
                self.saw_invite = true;
                self.on_new_participant(sender, invite).await;
            }
            SignalingContent::CallCandidates(content) => {
                match self.participants.get(&sender) {
                    Some(participant) => {
                        participant
                            .peer
                            .add_remote_candidates(content.candidates)
                            .await;
                    }
                    None => tracing::debug!(%sender, "candidates for an unknown participant"),
                }
            }
            SignalingContent::CallSelectAnswer(content) => {
                let Some(participant) = self.participants.get(&sender) else {
                    return;
                };
                if content.selected_party_id != participant.id.device_id.as_str() {
                    tracing::warn!(
                        %sender,
                        selected_party_id = %content.selected_party_id,
                        "call answered on another device, kicking this peer"
                    );
                    self.remove_participant(&sender, None).await;
                }
            }
            SignalingContent::CallHangup(_) => {
                self.remove_participant(&sender, None).await;
            }
        }
    }

    /// A new participant tries to join. A second invite from the same device
    /// with the same session is rejected; a changed session id supersedes the
    /// device's existing call.
    async fn on_new_participant(&mut self, participant_id: ParticipantId, invite: InviteContent) {
        let mut stale = Vec::new();
        for (id, existing) in &self.participants {
            if id.user_id == participant_id.user_id && id.device_id == participant_id.device_id {
                if existing.remote_session_id == invite.sender_session_id {
                    tracing::error!(
                        %participant_id,
                        session_id = %invite.sender_session_id,
                        "found existing participant with equal device and session id"
                    );
                    return;
                }
                stale.push(id.clone());
            }
        }
        for id in stale {
            self.remove_participant(&id, None).await;
        }

        let sink = MessageSink::new(participant_id.clone(), self.peer_events_tx.clone());
        let peer_config = PeerConfig {
            keep_alive_deadline: self.config.keep_alive_timeout,
            pli_min_interval: self.config.pli_min_interval,
            subscription_stall_timeout: self.config.subscription_stall_timeout,
        };
        // On failure the half-built participant is discarded and the inviter
        // observes no answer.
        let (peer, answer_sdp) = match Peer::new(invite.offer.sdp, sink, peer_config).await {
            Ok(created) => created,
            Err(err) => {
                tracing::error!(error = %err, %participant_id, "failed to create peer");
                return;
            }
        };

        let participant = Participant {
            id: participant_id.clone(),
            peer,
            remote_session_id: invite.sender_session_id,
            stream_metadata: invite.metadata,
            published_tracks: HashMap::new(),
        };
        let recipient = participant.recipient();
        self.participants.insert(participant_id.clone(), participant);
        tracing::info!(%participant_id, "participant joined");

        let metadata = self.streams_metadata_except(&participant_id);
        if let Err(err) = self
            .signaler
            .send(
                &recipient,
                SignalerMessage::SdpAnswer {
                    sdp: answer_sdp,
                    metadata,
                },
            )
            .await
        {
            tracing::error!(error = %err, "failed to send SDP answer");
        }
    }

    async fn handle_peer_event(&mut self, message: Message<ParticipantId, PeerEvent>) {
        let sender = message.sender;
        match message.content {
            PeerEvent::IceCandidateGathered(candidate) => {
                let Some(participant) = self.participants.get(&sender) else {
                    return;
                };
                if let Err(err) = self
                    .signaler
                    .send(
                        &participant.recipient(),
                        SignalerMessage::IceCandidates(vec![candidate]),
                    )
                    .await
                {
                    tracing::error!(error = %err, "failed to send ICE candidates");
                }
            }
            PeerEvent::IceGatheringComplete => {
                let Some(participant) = self.participants.get(&sender) else {
                    return;
                };
                if let Err(err) = self
                    .signaler
                    .send(
                        &participant.recipient(),
                        SignalerMessage::CandidatesGatheringFinished,
                    )
                    .await
                {
                    tracing::error!(error = %err, "failed to send gathering-finished");
                }
            }
            PeerEvent::RenegotiationRequired(offer) => {
                let Some(participant) = self.participants.get(&sender) else {
                    return;
                };
                let event = DataChannelEvent::Negotiate {
                    description: SessionDescription {
                        kind: "offer".to_string(),
                        sdp: offer.sdp,
                    },
                };
                if let Err(err) = participant.send_data_channel_event(&event).await {
                    tracing::warn!(error = %err, %sender, "failed to send renegotiation offer");
                }
            }
            PeerEvent::NewTrack(remote_track) => {
                self.on_new_published_track(sender, remote_track).await;
            }
            PeerEvent::RtcpReceived { track, packets } => {
                self.forward_rtcp(&track, packets).await;
            }
            PeerEvent::DataChannelAvailable => {
                let metadata = self.streams_metadata_except(&sender);
                let Some(participant) = self.participants.get(&sender) else {
                    return;
                };
                let event = DataChannelEvent::SdpStreamMetadataChanged { metadata };
                if let Err(err) = participant.send_data_channel_event(&event).await {
                    tracing::warn!(error = %err, %sender, "failed to send metadata snapshot");
                }
            }
            PeerEvent::DataChannelMessage(text) => {
                self.handle_data_channel_message(sender, text).await;
            }
            PeerEvent::JoinedTheCall => {
                tracing::info!(%sender, "participant connected");
            }
            PeerEvent::LeftTheCall(reason) => {
                tracing::info!(%sender, ?reason, "participant left the call");
                let hangup = match reason {
                    // They hung up themselves; no point echoing it back.
                    HangupReason::UserHangup => None,
                    other => Some(other),
                };
                self.remove_participant(&sender, hangup).await;
            }
        }
    }

    /// One remote track, one simulcast layer: spawn a publisher forwarding
    /// it and watch its status from the conference loop.
    async fn on_new_published_track(
        &mut self,
        owner_id: ParticipantId,
        remote_track: Arc<webrtc::track::track_remote::TrackRemote>,
    ) {
        let Some(participant) = self.participants.get_mut(&owner_id) else {
            tracing::warn!(%owner_id, "track from an unknown participant, ignoring");
            return;
        };

        let info = TrackInfo::from_remote(&remote_track);
        let source = Arc::new(participant.peer.remote_source(remote_track));
        let metadata = participant.track_metadata(&info.stream_id, &info.track_id);

        let published = participant
            .published_tracks
            .entry(info.track_id.clone())
            .or_insert_with(|| PublishedTrack::new(owner_id.clone(), &info, metadata));

        let (publisher, mut status_rx) = Publisher::start(
            source,
            PublisherConfig {
                stall_timeout: self.config.publisher_stall_timeout,
                pli_min_interval: self.config.pli_min_interval,
            },
        );
        published.add_publisher(info.layer, publisher);
        tracing::info!(
            %owner_id,
            track_id = %info.track_id,
            layer = %info.layer,
            "new track published"
        );

        let updates_tx = self.publisher_events_tx.clone();
        let track_id = info.track_id.clone();
        let layer = info.layer;
        tokio::spawn(async move {
            while let Some(status) = status_rx.recv().await {
                let update = PublisherStatusUpdate {
                    owner: owner_id.clone(),
                    track_id: track_id.clone(),
                    layer,
                    status,
                };
                if updates_tx.send(update).is_err() {
                    break;
                }
            }
        });

        self.broadcast_metadata().await;
    }

    /// Key-frame request feedback from a subscriber, routed to the peer that
    /// publishes the track (which rewrites the SSRC and throttles).
    async fn forward_rtcp(&self, track: &TrackInfo, packets: Vec<RtcpPacket>) {
        let owner = self
            .participants
            .values()
            .find(|p| p.published_tracks.contains_key(&track.track_id));
        let Some(owner) = owner else {
            tracing::debug!(track_id = %track.track_id, "RTCP for an unknown track");
            return;
        };
        if let Err(err) = owner.peer.write_rtcp(track, packets).await {
            tracing::debug!(error = %err, track_id = %track.track_id, "failed to forward RTCP");
        }
    }

    async fn handle_data_channel_message(&mut self, sender: ParticipantId, text: String) {
        let event = match serde_json::from_str::<DataChannelEvent>(&text) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, %sender, "undecodable data channel message");
                return;
            }
        };

        match event {
            DataChannelEvent::Negotiate { description } => {
                let Some(participant) = self.participants.get(&sender) else {
                    return;
                };
                let peer = participant.peer.clone();
                match description.kind.as_str() {
                    "answer" => {
                        if let Err(err) = peer.process_sdp_answer(description.sdp).await {
                            tracing::error!(error = %err, %sender, "failed to apply SDP answer");
                        }
                    }
                    "offer" => match peer.process_sdp_offer(description.sdp).await {
                        Ok(answer) => {
                            let reply = DataChannelEvent::Negotiate {
                                description: SessionDescription {
                                    kind: "answer".to_string(),
                                    sdp: answer.sdp,
                                },
                            };
                            if let Some(participant) = self.participants.get(&sender) {
                                if let Err(err) =
                                    participant.send_data_channel_event(&reply).await
                                {
                                    tracing::warn!(error = %err, %sender, "failed to reply with answer");
                                }
                            }
                        }
                        Err(err) => {
                            tracing::error!(error = %err, %sender, "failed to answer renegotiation offer");
                        }
                    },
                    other => {
                        tracing::warn!(%sender, kind = other, "unexpected negotiate description");
                    }
                }
            }
            DataChannelEvent::TrackSubscription {
                subscribe,
                unsubscribe,
            } => {
                for request in unsubscribe {
                    self.unsubscribe_track(&sender, &request.track_id).await;
                }
                for request in subscribe {
                    self.subscribe_track(&sender, request).await;
                }
            }
            DataChannelEvent::Ping => {
                let Some(participant) = self.participants.get(&sender) else {
                    return;
                };
                participant.peer.process_heartbeat();
                if let Err(err) = participant
                    .send_data_channel_event(&DataChannelEvent::Pong)
                    .await
                {
                    tracing::debug!(error = %err, %sender, "failed to answer ping");
                }
            }
            DataChannelEvent::Pong => {}
            DataChannelEvent::SdpStreamMetadataChanged { metadata } => {
                self.on_metadata_changed(&sender, metadata).await;
            }
        }
    }

    async fn on_metadata_changed(&mut self, sender: &ParticipantId, metadata: StreamMetadataMap) {
        {
            let Some(participant) = self.participants.get_mut(sender) else {
                return;
            };
            participant.stream_metadata = metadata;

            // Mute bits and declared dimensions feed stall handling and
            // layer selection; refresh them on every published track.
            let updates: Vec<(String, track::TrackMetadata)> = participant
                .published_tracks
                .iter()
                .map(|(track_id, published)| {
                    (
                        track_id.clone(),
                        participant.track_metadata(published.stream_id(), track_id),
                    )
                })
                .collect();
            for (track_id, track_metadata) in updates {
                if let Some(published) = participant.published_tracks.get_mut(&track_id) {
                    published.set_metadata(track_metadata);
                }
            }
        }
        self.broadcast_metadata().await;
    }

    async fn subscribe_track(
        &mut self,
        subscriber_id: &ParticipantId,
        request: TrackSubscribeRequest,
    ) {
        // Locate the published track and pick the layer for the requested
        // resolution.
        let mut target = None;
        for (owner_id, participant) in &self.participants {
            if owner_id == subscriber_id {
                continue;
            }
            if let Some(published) = participant.published_tracks.get(&request.track_id) {
                let layer = published.optimal_layer(request.width, request.height);
                target = Some((owner_id.clone(), published.subscribe_info(layer), layer));
                break;
            }
        }
        let Some((owner_id, info, layer)) = target else {
            tracing::warn!(track_id = %request.track_id, "subscription request for unknown track");
            return;
        };

        let Some(subscriber) = self.participants.get(subscriber_id) else {
            return;
        };
        let peer = subscriber.peer.clone();

        // Re-subscribing switches layers: drop the previous subscription.
        if let Some(owner) = self.participants.get_mut(&owner_id) {
            if let Some(published) = owner.published_tracks.get_mut(&request.track_id) {
                if published.is_subscribed(subscriber_id) {
                    published.unsubscribe(subscriber_id).await;
                }
            }
        }

        let subscription = match peer.subscribe_to(info).await {
            Ok(subscription) => subscription,
            Err(err) => {
                tracing::error!(error = %err, %subscriber_id, "failed to create subscription");
                return;
            }
        };

        if let Some(owner) = self.participants.get_mut(&owner_id) {
            if let Some(published) = owner.published_tracks.get_mut(&request.track_id) {
                published
                    .subscribe(subscriber_id.clone(), subscription, layer)
                    .await;
            }
        }
    }

    async fn unsubscribe_track(&mut self, subscriber_id: &ParticipantId, track_id: &str) {
        for participant in self.participants.values_mut() {
            if let Some(published) = participant.published_tracks.get_mut(track_id) {
                published.unsubscribe(subscriber_id).await;
            }
        }
    }

    async fn handle_publisher_update(&mut self, update: PublisherStatusUpdate) {
        let track_gone = {
            let Some(participant) = self.participants.get_mut(&update.owner) else {
                return;
            };
            let Some(published) = participant.published_tracks.get_mut(&update.track_id) else {
                return;
            };
            published
                .handle_publisher_status(update.layer, update.status)
                .await;

            let terminal = matches!(
                update.status,
                PublisherStatus::TrackClosed | PublisherStatus::Fatal
            );
            if terminal && published.publisher_count() == 0 {
                participant.published_tracks.remove(&update.track_id);
                true
            } else {
                false
            }
        };
        if track_gone {
            tracing::info!(track_id = %update.track_id, "published track is gone");
            self.broadcast_metadata().await;
        }
    }

    /// Removes a participant and everything hanging off it: their published
    /// tracks (and all dependent subscriptions), their subscriptions on other
    /// participants' tracks, and finally the peer itself. When `hangup` is
    /// set, the removed device is told why.
    async fn remove_participant(&mut self, id: &ParticipantId, hangup: Option<HangupReason>) {
        let Some(mut participant) = self.participants.remove(id) else {
            return;
        };
        tracing::info!(participant_id = %id, "removing participant");

        for (_, mut published) in participant.published_tracks.drain() {
            published.close().await;
        }
        for other in self.participants.values_mut() {
            for published in other.published_tracks.values_mut() {
                published.unsubscribe(id).await;
            }
        }

        participant.peer.terminate().await;

        if let Some(reason) = hangup {
            if let Err(err) = self
                .signaler
                .send(&participant.recipient(), SignalerMessage::Hangup(reason))
                .await
            {
                tracing::error!(error = %err, "failed to send hangup");
            }
        }

        self.broadcast_metadata().await;
    }

    /// Aggregate stream metadata of everyone but `except`, as sent in SDP
    /// answers and metadata-changed events.
    fn streams_metadata_except(&self, except: &ParticipantId) -> StreamMetadataMap {
        let mut merged = StreamMetadataMap::new();
        for (id, participant) in &self.participants {
            if id == except {
                continue;
            }
            for (stream_id, stream) in &participant.stream_metadata {
                merged.insert(stream_id.clone(), stream.clone());
            }
        }
        merged
    }

    /// Tells every participant what everyone else currently streams.
    async fn broadcast_metadata(&self) {
        for (id, participant) in &self.participants {
            let metadata = self.streams_metadata_except(id);
            let event = DataChannelEvent::SdpStreamMetadataChanged { metadata };
            if let Err(err) = participant.send_data_channel_event(&event).await {
                tracing::debug!(error = %err, participant_id = %id, "failed to broadcast metadata");
            }
        }
    }
}
