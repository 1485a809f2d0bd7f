use std::collections::HashMap;
use std::sync::Arc;

use crate::entity::ParticipantId;
use crate::peer::{Peer, PeerError};
use crate::signaling::{DataChannelEvent, Recipient, StreamMetadataMap};

use super::track::{PublishedTrack, TrackMetadata};

/// One member of the conference: identity, media session, the stream
/// metadata it announced and the tracks it publishes.
pub struct Participant {
    pub id: ParticipantId,
    pub peer: Arc<Peer>,
    /// Opaque session token from the invite; outbound messages must carry it
    /// back as the destination session.
    pub remote_session_id: String,
    pub stream_metadata: StreamMetadataMap,
    pub published_tracks: HashMap<String, PublishedTrack>,
}

impl Participant {
    pub fn recipient(&self) -> Recipient {
        Recipient {
            user_id: self.id.user_id.clone(),
            device_id: self.id.device_id.clone(),
            call_id: self.id.call_id.clone(),
            remote_session_id: self.remote_session_id.clone(),
        }
    }

    /// Declared dimensions and mute state for one of this participant's
    /// tracks, defaulting to unknown when the metadata does not mention it.
    pub fn track_metadata(&self, stream_id: &str, track_id: &str) -> TrackMetadata {
        let Some(stream) = self.stream_metadata.get(stream_id) else {
            return TrackMetadata::default();
        };
        let dimensions = stream.tracks.get(track_id).copied().unwrap_or_default();
        TrackMetadata {
            max_width: dimensions.width,
            max_height: dimensions.height,
            muted: stream.video_muted,
        }
    }

    /// Sends a control event over the data channel. Failures are returned so
    /// the conference can decide; buffering and re-sending once the channel
    /// recovers is future work.
    pub async fn send_data_channel_event(
        &self,
        event: &DataChannelEvent,
    ) -> Result<(), PeerError> {
        let json = serde_json::to_string(event).map_err(|err| {
            tracing::error!(error = %err, "failed to encode data channel event");
            PeerError::DataChannelNotReady
        })?;
        self.peer.send_over_data_channel(json).await
    }
}
