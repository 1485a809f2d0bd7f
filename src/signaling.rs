use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::entity::{ConferenceId, DeviceId, UserId};

/// Session id the SFU stamps on every outbound call event.
pub const LOCAL_SESSION_ID: &str = "sfu";
/// Call signaling protocol version.
pub const CALL_VERSION: &str = "1";

/// To-device event types the SFU receives and emits.
pub mod event_type {
    pub const CALL_INVITE: &str = "m.call.invite";
    pub const CALL_CANDIDATES: &str = "m.call.candidates";
    pub const CALL_ANSWER: &str = "m.call.answer";
    pub const CALL_SELECT_ANSWER: &str = "m.call.select_answer";
    pub const CALL_HANGUP: &str = "m.call.hangup";
}

#[derive(thiserror::Error, Debug)]
pub enum SignalerError {
    #[error("signaling transport error: {0}")]
    Transport(String),
    #[error("failed to encode signaling payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The chat-protocol client boundary: everything the SFU needs from it is the
/// ability to address a device with an event and to know its own device id.
#[async_trait]
pub trait ToDeviceSender: Send + Sync {
    async fn send_to_device(
        &self,
        event_type: &str,
        user_id: &UserId,
        device_id: &DeviceId,
        content: Value,
    ) -> Result<(), SignalerError>;

    fn device_id(&self) -> &DeviceId;
}

/// An inbound device-addressed event, content left raw until the router has
/// decided which conference it belongs to.
#[derive(Debug, Clone, Deserialize)]
pub struct ToDeviceEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub sender: UserId,
    pub content: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// Wire format of a single ICE candidate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Candidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupReason {
    UserHangup,
    IceFailed,
    KeepAliveTimeout,
}

/// Per-stream description shared between participants: purpose, mute bits
/// and, for video, the declared dimensions of each track.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub audio_muted: bool,
    #[serde(default)]
    pub video_muted: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tracks: HashMap<String, TrackDimensions>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TrackDimensions {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

/// Keyed by stream id.
pub type StreamMetadataMap = HashMap<String, StreamMetadata>;

/// Content of `m.call.invite`.
#[derive(Debug, Clone, Deserialize)]
pub struct InviteContent {
    pub conf_id: ConferenceId,
    pub call_id: String,
    pub device_id: DeviceId,
    pub sender_session_id: String,
    pub offer: SessionDescription,
    #[serde(default, rename = "sdp_stream_metadata")]
    pub metadata: StreamMetadataMap,
}

/// Content of `m.call.candidates`.
#[derive(Debug, Clone, Deserialize)]
pub struct CandidatesContent {
    pub conf_id: ConferenceId,
    pub call_id: String,
    pub device_id: DeviceId,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

/// Content of `m.call.select_answer`.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectAnswerContent {
    pub conf_id: ConferenceId,
    pub call_id: String,
    pub device_id: DeviceId,
    pub selected_party_id: String,
}

/// Content of `m.call.hangup`.
#[derive(Debug, Clone, Deserialize)]
pub struct HangupContent {
    pub conf_id: ConferenceId,
    pub call_id: String,
    pub device_id: DeviceId,
    #[serde(default)]
    pub reason: Option<HangupReason>,
}

/// Events exchanged over the peer's data channel once it is up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum DataChannelEvent {
    #[serde(rename = "m.call.negotiate")]
    Negotiate { description: SessionDescription },
    #[serde(rename = "m.call.track_subscription")]
    TrackSubscription {
        #[serde(default)]
        subscribe: Vec<TrackSubscribeRequest>,
        #[serde(default)]
        unsubscribe: Vec<TrackUnsubscribeRequest>,
    },
    #[serde(rename = "m.call.ping")]
    Ping,
    #[serde(rename = "m.call.pong")]
    Pong,
    #[serde(rename = "m.call.sdp_stream_metadata_changed")]
    SdpStreamMetadataChanged {
        #[serde(rename = "sdp_stream_metadata")]
        metadata: StreamMetadataMap,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackSubscribeRequest {
    pub track_id: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackUnsubscribeRequest {
    pub track_id: String,
}

/// Where an outbound message goes: the device that invited us, plus the
/// opaque session token it handed over during the invite.
#[derive(Debug, Clone)]
pub struct Recipient {
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub call_id: String,
    pub remote_session_id: String,
}

#[derive(Debug, Clone)]
pub enum SignalerMessage {
    SdpAnswer {
        sdp: String,
        metadata: StreamMetadataMap,
    },
    IceCandidates(Vec<Candidate>),
    CandidatesGatheringFinished,
    Hangup(HangupReason),
}

/// Outbound signaling scoped to one conference: stamps the base fields every
/// call event carries and serializes the message variants to the wire.
#[derive(Clone)]
pub struct ConferenceSignaler {
    sender: Arc<dyn ToDeviceSender>,
    conference_id: ConferenceId,
}

impl ConferenceSignaler {
    pub fn new(sender: Arc<dyn ToDeviceSender>, conference_id: ConferenceId) -> Self {
        Self {
            sender,
            conference_id,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        self.sender.device_id()
    }

    pub async fn send(
        &self,
        recipient: &Recipient,
        message: SignalerMessage,
    ) -> Result<(), SignalerError> {
        let (event_type, mut content) = match message {
            SignalerMessage::SdpAnswer { sdp, metadata } => (
                event_type::CALL_ANSWER,
                json!({
                    "answer": SessionDescription { kind: "answer".to_string(), sdp },
                    "sdp_stream_metadata": metadata,
                }),
            ),
            SignalerMessage::IceCandidates(candidates) => (
                event_type::CALL_CANDIDATES,
                json!({ "candidates": candidates }),
            ),
            // Encoded as a candidates message with a single empty candidate.
            SignalerMessage::CandidatesGatheringFinished => (
                event_type::CALL_CANDIDATES,
                json!({ "candidates": [Candidate::default()] }),
            ),
            SignalerMessage::Hangup(reason) => {
                (event_type::CALL_HANGUP, json!({ "reason": reason }))
            }
        };

        let base = self.base_content(recipient);
        if let (Some(content), Some(base)) = (content.as_object_mut(), base.as_object()) {
            for (key, value) in base {
                content.insert(key.clone(), value.clone());
            }
        }

        self.sender
            .send_to_device(event_type, &recipient.user_id, &recipient.device_id, content)
            .await
    }

    fn base_content(&self, recipient: &Recipient) -> Value {
        json!({
            "conf_id": self.conference_id,
            "call_id": recipient.call_id,
            "device_id": self.sender.device_id(),
            "sender_session_id": LOCAL_SESSION_ID,
            "dest_session_id": recipient.remote_session_id,
            "party_id": self.sender.device_id(),
            "version": CALL_VERSION,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every outbound to-device event for assertions.
    pub(crate) struct RecordingSender {
        pub device_id: DeviceId,
        pub sent: Mutex<Vec<(String, UserId, DeviceId, Value)>>,
    }

    impl RecordingSender {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                device_id: DeviceId::new("SFUDEVICE"),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ToDeviceSender for RecordingSender {
        async fn send_to_device(
            &self,
            event_type: &str,
            user_id: &UserId,
            device_id: &DeviceId,
            content: Value,
        ) -> Result<(), SignalerError> {
            self.sent.lock().unwrap().push((
                event_type.to_string(),
                user_id.clone(),
                device_id.clone(),
                content,
            ));
            Ok(())
        }

        fn device_id(&self) -> &DeviceId {
            &self.device_id
        }
    }

    fn recipient() -> Recipient {
        Recipient {
            user_id: UserId::new("@alice:example.org"),
            device_id: DeviceId::new("ALICEDEV"),
            call_id: "call1".to_string(),
            remote_session_id: "session1".to_string(),
        }
    }

    #[tokio::test]
    async fn answer_is_stamped_with_base_fields() {
        let sender = RecordingSender::new();
        let signaler = ConferenceSignaler::new(sender.clone(), ConferenceId::new("conf1"));

        signaler
            .send(
                &recipient(),
                SignalerMessage::SdpAnswer {
                    sdp: "v=0...".to_string(),
                    metadata: StreamMetadataMap::new(),
                },
            )
            .await
            .unwrap();

        let sent = sender.sent.lock().unwrap();
        let (event_type, user, device, content) = &sent[0];
        assert_eq!(event_type, event_type::CALL_ANSWER);
        assert_eq!(user.as_str(), "@alice:example.org");
        assert_eq!(device.as_str(), "ALICEDEV");
        assert_eq!(content["conf_id"], "conf1");
        assert_eq!(content["call_id"], "call1");
        assert_eq!(content["sender_session_id"], LOCAL_SESSION_ID);
        assert_eq!(content["dest_session_id"], "session1");
        assert_eq!(content["device_id"], "SFUDEVICE");
        assert_eq!(content["party_id"], "SFUDEVICE");
        assert_eq!(content["version"], "1");
        assert_eq!(content["answer"]["type"], "answer");
    }

    #[tokio::test]
    async fn gathering_finished_is_an_empty_candidate() {
        let sender = RecordingSender::new();
        let signaler = ConferenceSignaler::new(sender.clone(), ConferenceId::new("conf1"));

        signaler
            .send(&recipient(), SignalerMessage::CandidatesGatheringFinished)
            .await
            .unwrap();

        let sent = sender.sent.lock().unwrap();
        let (event_type, _, _, content) = &sent[0];
        assert_eq!(event_type, event_type::CALL_CANDIDATES);
        let candidates = content["candidates"].as_array().unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0]["candidate"], "");
    }

    #[test]
    fn data_channel_events_round_trip() {
        let ping = serde_json::to_string(&DataChannelEvent::Ping).unwrap();
        assert_eq!(ping, r#"{"type":"m.call.ping"}"#);

        let parsed: DataChannelEvent = serde_json::from_str(
            r#"{"type":"m.call.track_subscription",
                "content":{"subscribe":[{"track_id":"t1","width":640,"height":480}]}}"#,
        )
        .unwrap();
        match parsed {
            DataChannelEvent::TrackSubscription {
                subscribe,
                unsubscribe,
            } => {
                assert_eq!(subscribe.len(), 1);
                assert_eq!(subscribe[0].track_id, "t1");
                assert_eq!(subscribe[0].width, 640);
                assert!(unsubscribe.is_empty());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn hangup_reason_uses_snake_case() {
        let reason = serde_json::to_value(HangupReason::KeepAliveTimeout).unwrap();
        assert_eq!(reason, "keep_alive_timeout");
    }
}
