use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::actor::{self, Actor, ActorError};
use crate::conference::{
    Conference, ConferenceHandle, SignalingContent, SignalingMessage,
};
use crate::config::ConferenceConfig;
use crate::entity::{ConferenceId, DeviceId, ParticipantId, UserId};
use crate::signaling::{
    event_type, CandidatesContent, ConferenceSignaler, HangupContent, InviteContent,
    SelectAnswerContent, ToDeviceEvent, ToDeviceSender,
};
use crate::sink::Message;

#[derive(Debug)]
pub enum RouterMessage {
    /// An inbound to-device event from the chat protocol.
    SignalingEvent(ToDeviceEvent),
    /// A conference sealed its inbox and ended, possibly leaving one message
    /// unread.
    ConferenceEnded {
        conference_id: ConferenceId,
        unread: Option<SignalingMessage>,
    },
    /// Supervision query.
    GetConferenceCount(oneshot::Sender<usize>),
}

/// The send half of the router inbox. The embedder feeds every call-related
/// to-device event here.
#[derive(Clone)]
pub struct RouterHandle {
    tx: mpsc::UnboundedSender<RouterMessage>,
}

impl RouterHandle {
    pub fn dispatch(&self, event: ToDeviceEvent) {
        let _ = self.tx.send(RouterMessage::SignalingEvent(event));
    }

    pub async fn conference_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(RouterMessage::GetConferenceCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Owns every conference running on this SFU. A single loop serializes all
/// inbound signaling: events are routed to the conference owning their
/// `conf_id`, and only a `call.invite` may create a new conference.
pub struct Router {
    signaler: Arc<dyn ToDeviceSender>,
    config: ConferenceConfig,
    conferences: HashMap<ConferenceId, ConferenceHandle>,
    rx: mpsc::UnboundedReceiver<RouterMessage>,
    tx: mpsc::UnboundedSender<RouterMessage>,
    conference_tasks: JoinSet<ConferenceId>,
}

impl Router {
    /// Spawns the router loop and returns its handle.
    pub fn start(signaler: Arc<dyn ToDeviceSender>, config: ConferenceConfig) -> RouterHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RouterHandle { tx: tx.clone() };
        let router = Self {
            signaler,
            config,
            conferences: HashMap::new(),
            rx,
            tx,
            conference_tasks: JoinSet::new(),
        };
        tokio::spawn(actor::run(router));
        handle
    }
}

impl Actor for Router {
    type Id = String;

    fn kind(&self) -> &'static str {
        "router"
    }

    fn id(&self) -> Self::Id {
        self.signaler.device_id().to_string()
    }

    async fn run(&mut self) -> Result<(), ActorError> {
        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(RouterMessage::SignalingEvent(event)) => self.handle_event(event),
                    Some(RouterMessage::ConferenceEnded { conference_id, unread }) => {
                        tracing::info!(%conference_id, "conference ended");
                        self.conferences.remove(&conference_id);
                        if let Some(unread) = unread {
                            // Captured but not replayed; see the design notes
                            // on session-end glare.
                            tracing::warn!(
                                %conference_id,
                                sender = %unread.sender,
                                "conference ended with an unread message"
                            );
                        }
                    }
                    Some(RouterMessage::GetConferenceCount(reply)) => {
                        let _ = reply.send(self.conferences.len());
                    }
                    None => break,
                },
                Some(result) = self.conference_tasks.join_next() => {
                    if let Err(err) = result {
                        tracing::error!(error = %err, "conference task failed");
                    }
                }
            }
        }
        Ok(())
    }
}

impl Router {
    fn handle_event(&mut self, event: ToDeviceEvent) {
        // Call events carry their conference id in the content; anything
        // without one is not for us.
        let Some(conference_id) = event
            .content
            .get("conf_id")
            .and_then(|value| value.as_str())
            .map(ConferenceId::new)
        else {
            return;
        };

        let known = self.conferences.contains_key(&conference_id);
        if !known && event.kind != event_type::CALL_INVITE {
            tracing::warn!(
                %conference_id,
                kind = %event.kind,
                "ignoring event for an unknown conference"
            );
            return;
        }

        let Some((participant_id, content)) = parse_event(&event) else {
            return;
        };

        if !known {
            tracing::info!(%conference_id, "creating new conference");
            let signaler =
                ConferenceSignaler::new(self.signaler.clone(), conference_id.clone());
            let (handle, conference) =
                Conference::new(conference_id.clone(), self.config, signaler, self.tx.clone());
            let task_id = conference_id.clone();
            self.conference_tasks.spawn(async move {
                actor::run(conference).await;
                task_id
            });
            self.conferences.insert(conference_id.clone(), handle);
        }

        let handle = self
            .conferences
            .get(&conference_id)
            .expect("conference registered above");
        let message = Message {
            sender: participant_id,
            content,
        };
        if handle.send(message).is_err() {
            // The conference sealed its inbox while the entry was still in
            // the map: evict it and re-feed the event, so a fresh invite
            // reconstructs the conference.
            tracing::info!(%conference_id, "conference is gone, evicting and re-feeding");
            self.conferences.remove(&conference_id);
            let _ = self.tx.send(RouterMessage::SignalingEvent(event));
        }
    }
}

/// Parses the typed content out of a call event and derives the sender's
/// participant identity from it.
fn parse_event(event: &ToDeviceEvent) -> Option<(ParticipantId, SignalingContent)> {
    fn parse<T: serde::de::DeserializeOwned>(event: &ToDeviceEvent) -> Option<T> {
        match serde_json::from_value(event.content.clone()) {
            Ok(content) => Some(content),
            Err(err) => {
                tracing::warn!(error = %err, kind = %event.kind, "undecodable call event");
                None
            }
        }
    }

    fn participant_id(sender: &UserId, device_id: &DeviceId, call_id: &str) -> ParticipantId {
        ParticipantId {
            user_id: sender.clone(),
            device_id: device_id.clone(),
            call_id: call_id.to_string(),
        }
    }

    match event.kind.as_str() {
        event_type::CALL_INVITE => {
            let content: InviteContent = parse(event)?;
            let id = participant_id(&event.sender, &content.device_id, &content.call_id);
            Some((id, SignalingContent::CallInvite(content)))
        }
        event_type::CALL_CANDIDATES => {
            let content: CandidatesContent = parse(event)?;
            let id = participant_id(&event.sender, &content.device_id, &content.call_id);
            Some((id, SignalingContent::CallCandidates(content)))
        }
        event_type::CALL_SELECT_ANSWER => {
            let content: SelectAnswerContent = parse(event)?;
            let id = participant_id(&event.sender, &content.device_id, &content.call_id);
            Some((id, SignalingContent::CallSelectAnswer(content)))
        }
        event_type::CALL_HANGUP => {
            let content: HangupContent = parse(event)?;
            let id = participant_id(&event.sender, &content.device_id, &content.call_id);
            Some((id, SignalingContent::CallHangup(content)))
        }
        other => {
            tracing::warn!(kind = other, "ignoring event we must not receive");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: &str, content: serde_json::Value) -> ToDeviceEvent {
        ToDeviceEvent {
            kind: kind.to_string(),
            sender: UserId::new("@alice:example.org"),
            content,
        }
    }

    #[test]
    fn parse_event_derives_the_participant_identity() {
        crate::test_utils::setup_tracing();
        let event = event(
            event_type::CALL_HANGUP,
            json!({
                "conf_id": "conf1",
                "call_id": "call1",
                "device_id": "ALICEDEV",
                "reason": "user_hangup",
            }),
        );
        let (id, content) = parse_event(&event).unwrap();
        assert_eq!(id.user_id.as_str(), "@alice:example.org");
        assert_eq!(id.device_id.as_str(), "ALICEDEV");
        assert_eq!(id.call_id, "call1");
        assert!(matches!(content, SignalingContent::CallHangup(_)));
    }

    #[test]
    fn parse_event_rejects_unknown_kinds() {
        crate::test_utils::setup_tracing();
        let event = event("m.room.message", json!({ "conf_id": "conf1" }));
        assert!(parse_event(&event).is_none());
    }

    #[test]
    fn parse_event_rejects_malformed_content() {
        crate::test_utils::setup_tracing();
        let event = event(event_type::CALL_INVITE, json!({ "conf_id": "conf1" }));
        assert!(parse_event(&event).is_none());
    }
}
