use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use crate::entity::ParticipantId;
use crate::peer::{SimulcastLayer, TrackInfo, TrackKind};

use super::publisher::{Publisher, PublisherStatus, SubscriptionSink};

/// What the owner declared about the source in its stream metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackMetadata {
    pub max_width: u32,
    pub max_height: u32,
    pub muted: bool,
}

struct TrackSubscription {
    sink: Arc<dyn SubscriptionSink>,
    current_layer: SimulcastLayer,
}

/// A remote track exposed by one participant, grouping the publishers of its
/// simulcast layers and the subscriptions other participants hold on it.
/// Mutated only from within the conference loop.
pub struct PublishedTrack {
    owner: ParticipantId,
    track_id: String,
    stream_id: String,
    kind: TrackKind,
    codec: RTCRtpCodecCapability,
    metadata: TrackMetadata,
    publishers: HashMap<SimulcastLayer, Publisher>,
    subscriptions: HashMap<ParticipantId, TrackSubscription>,
}

impl PublishedTrack {
    pub fn new(owner: ParticipantId, info: &TrackInfo, metadata: TrackMetadata) -> Self {
        Self {
            owner,
            track_id: info.track_id.clone(),
            stream_id: info.stream_id.clone(),
            kind: info.kind,
            codec: info.codec.clone(),
            metadata,
            publishers: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    pub fn owner(&self) -> &ParticipantId {
        &self.owner
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn set_metadata(&mut self, metadata: TrackMetadata) {
        self.metadata = metadata;
    }

    pub fn add_publisher(&mut self, layer: SimulcastLayer, publisher: Publisher) {
        self.publishers.insert(layer, publisher);
    }

    pub fn publisher_count(&self) -> usize {
        self.publishers.len()
    }

    /// The layer a subscriber asking for `desired_width` × `desired_height`
    /// should get, given what is currently available.
    pub fn optimal_layer(&self, desired_width: u32, desired_height: u32) -> SimulcastLayer {
        let available: HashSet<SimulcastLayer> = self
            .publishers
            .keys()
            .copied()
            .filter(|layer| *layer != SimulcastLayer::None)
            .collect();
        optimal_layer(&available, self.metadata, desired_width, desired_height)
    }

    /// Track info for a subscription at the given layer.
    pub fn subscribe_info(&self, layer: SimulcastLayer) -> TrackInfo {
        TrackInfo {
            track_id: self.track_id.clone(),
            stream_id: self.stream_id.clone(),
            kind: self.kind,
            codec: self.codec.clone(),
            layer,
        }
    }

    /// Attaches a subscription to the publisher of `layer` and asks the
    /// source for a key-frame so the new subscriber gets a decodable picture
    /// quickly.
    pub async fn subscribe(
        &mut self,
        subscriber: ParticipantId,
        sink: Arc<dyn SubscriptionSink>,
        layer: SimulcastLayer,
    ) {
        if let Some(publisher) = self.publishers.get(&layer) {
            publisher.add_subscription(sink.clone());
            publisher.request_keyframe().await;
        } else {
            tracing::warn!(
                track_id = %self.track_id,
                %layer,
                "subscribing to a layer with no publisher"
            );
        }
        self.subscriptions.insert(
            subscriber,
            TrackSubscription {
                sink,
                current_layer: layer,
            },
        );
    }

    pub fn is_subscribed(&self, subscriber: &ParticipantId) -> bool {
        self.subscriptions.contains_key(subscriber)
    }

    pub fn subscription_layer(&self, subscriber: &ParticipantId) -> Option<SimulcastLayer> {
        self.subscriptions
            .get(subscriber)
            .map(|sub| sub.current_layer)
    }

    /// Detaches and tears down one participant's subscription.
    pub async fn unsubscribe(&mut self, subscriber: &ParticipantId) {
        let Some(subscription) = self.subscriptions.remove(subscriber) else {
            return;
        };
        if let Some(publisher) = self.publishers.get(&subscription.current_layer) {
            publisher.remove_subscription(subscription.sink.id());
        }
        if let Err(err) = subscription.sink.unsubscribe().await {
            tracing::warn!(error = %err, track_id = %self.track_id, "failed to unsubscribe");
        }
    }

    /// Applies a publisher status transition to the subscriptions that
    /// depend on it.
    pub async fn handle_publisher_status(&mut self, layer: SimulcastLayer, status: PublisherStatus) {
        match status {
            PublisherStatus::Stalled => self.on_publisher_stalled(layer).await,
            PublisherStatus::Recovered => self.on_publisher_recovered(layer).await,
            PublisherStatus::TrackClosed | PublisherStatus::Fatal => {
                self.on_publisher_stopped(layer).await;
            }
        }
    }

    async fn on_publisher_stalled(&mut self, layer: SimulcastLayer) {
        // If the source is muted, silence is expected.
        if self.metadata.muted {
            tracing::info!(track_id = %self.track_id, %layer, "publisher stalled while muted, ignoring");
            return;
        }
        let Some(publisher) = self.publishers.get(&layer) else {
            return;
        };

        // Detach every subscription riding this layer. The lowest layer is
        // normally the last to fail, so it is the place to move them.
        let on_layer: Vec<ParticipantId> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.current_layer == layer)
            .map(|(id, _)| id.clone())
            .collect();
        let mut moved = Vec::with_capacity(on_layer.len());
        for id in &on_layer {
            if let Some(sub) = self.subscriptions.get(id) {
                if let Some(sink) = publisher.remove_subscription(sub.sink.id()) {
                    moved.push(sink);
                }
            }
        }

        let fallback = if layer != SimulcastLayer::Low {
            self.publishers.get(&SimulcastLayer::Low)
        } else {
            None
        };

        if let Some(low) = fallback {
            tracing::info!(track_id = %self.track_id, %layer, "publisher stalled, switching to the low layer");
            for sink in moved {
                low.add_subscription(sink);
            }
            for id in &on_layer {
                if let Some(sub) = self.subscriptions.get_mut(id) {
                    sub.current_layer = SimulcastLayer::Low;
                }
            }
            low.request_keyframe().await;
        } else {
            tracing::warn!(track_id = %self.track_id, %layer, "publisher stalled with no layer to switch to");
            for id in &on_layer {
                if let Some(sub) = self.subscriptions.get_mut(id) {
                    sub.current_layer = SimulcastLayer::None;
                }
            }
        }
    }

    async fn on_publisher_recovered(&mut self, layer: SimulcastLayer) {
        let Some(publisher) = self.publishers.get(&layer) else {
            return;
        };
        tracing::info!(track_id = %self.track_id, %layer, "publisher recovered");

        // Pick up the subscriptions that lost their source entirely.
        let mut reattached = false;
        for sub in self.subscriptions.values_mut() {
            if sub.current_layer == SimulcastLayer::None {
                sub.current_layer = layer;
                publisher.add_subscription(sub.sink.clone());
                reattached = true;
            }
        }
        if reattached {
            publisher.request_keyframe().await;
        }
    }

    async fn on_publisher_stopped(&mut self, layer: SimulcastLayer) {
        let Some(publisher) = self.publishers.remove(&layer) else {
            return;
        };
        publisher.stop();

        // A stopped layer usually means failure; dependent subscriptions are
        // lost rather than migrated.
        let lost: Vec<ParticipantId> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.current_layer == layer)
            .map(|(id, _)| id.clone())
            .collect();
        for id in lost {
            if let Some(sub) = self.subscriptions.remove(&id) {
                if let Err(err) = sub.sink.unsubscribe().await {
                    tracing::warn!(error = %err, track_id = %self.track_id, "failed to drop lost subscription");
                }
            }
        }
    }

    /// Stops every publisher and detaches every subscription. Called when
    /// the owner leaves.
    pub async fn close(&mut self) {
        for publisher in self.publishers.values() {
            publisher.stop();
        }
        self.publishers.clear();
        for (_, sub) in self.subscriptions.drain() {
            if let Err(err) = sub.sink.unsubscribe().await {
                tracing::warn!(error = %err, track_id = %self.track_id, "failed to unsubscribe on close");
            }
        }
    }
}

/// Picks the minimum layer able to satisfy the requested resolution, given
/// what the source declared about itself. The comparison is over combined
/// width + height: with `ratio = full / desired`, a ratio within 1 means the
/// subscriber wants (at least) the full resolution, within 2 half of it, and
/// anything beyond that is served by the low layer. When the ideal layer is
/// not available, the closest available one wins. An empty layer set (audio,
/// or video without simulcast) yields `None`.
pub fn optimal_layer(
    available: &HashSet<SimulcastLayer>,
    metadata: TrackMetadata,
    desired_width: u32,
    desired_height: u32,
) -> SimulcastLayer {
    if available.is_empty() {
        return SimulcastLayer::None;
    }

    let desired = desired_layer(metadata, desired_width, desired_height);
    let priority = [
        desired,
        SimulcastLayer::Medium,
        SimulcastLayer::Low,
        SimulcastLayer::High,
    ];
    for layer in priority {
        if available.contains(&layer) {
            return layer;
        }
    }

    SimulcastLayer::None
}

fn desired_layer(
    metadata: TrackMetadata,
    desired_width: u32,
    desired_height: u32,
) -> SimulcastLayer {
    let full_size = metadata.max_width + metadata.max_height;
    let desired_size = desired_width + desired_height;

    // Undeclared source dimensions or an unconstrained request: the lowest
    // layer is the safe default.
    if full_size == 0 || desired_size == 0 {
        return SimulcastLayer::Low;
    }

    let ratio = full_size as f64 / desired_size as f64;
    if ratio <= 1.0 {
        SimulcastLayer::High
    } else if ratio <= 2.0 {
        SimulcastLayer::Medium
    } else {
        SimulcastLayer::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conference::publisher::tests::{MockSink, MockSource};
    use crate::conference::publisher::PublisherConfig;
    use crate::entity::{DeviceId, UserId};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn layers(layers: &[SimulcastLayer]) -> HashSet<SimulcastLayer> {
        layers.iter().copied().collect()
    }

    fn metadata(max_width: u32, max_height: u32) -> TrackMetadata {
        TrackMetadata {
            max_width,
            max_height,
            muted: false,
        }
    }

    #[test]
    fn optimal_layer_selection() {
        use SimulcastLayer::{High, Low, Medium};

        let all = layers(&[Low, Medium, High]);
        let cases: &[(
            &HashSet<SimulcastLayer>,
            (u32, u32),
            (u32, u32),
            SimulcastLayer,
        )] = &[
            // Screen sharing at an odd window size.
            (&all, (1728, 1056), (878, 799), Medium),
            (&all, (1920, 1080), (320, 240), Low),
            (&all, (1920, 1080), (1900, 1000), Medium),
            (&all, (1920, 1080), (0, 0), Low),
            (&all, (1280, 720), (1280, 720), High),
            (&all, (1280, 720), (640, 480), Medium),
            (&all, (1280, 720), (320, 240), Low),
        ];
        for (available, (full_w, full_h), (want_w, want_h), expected) in cases {
            assert_eq!(
                optimal_layer(available, metadata(*full_w, *full_h), *want_w, *want_h),
                *expected,
                "full {full_w}x{full_h} desired {want_w}x{want_h}"
            );
        }

        // Requested size beyond the source maximum falls to the best we have.
        let low_mid = layers(&[Low, Medium]);
        assert_eq!(
            optimal_layer(&low_mid, metadata(1280, 720), 1600, 1000),
            Medium
        );
        assert_eq!(
            optimal_layer(&low_mid, metadata(1280, 720), 500, 500),
            Medium
        );

        let only_low = layers(&[Low]);
        assert_eq!(
            optimal_layer(&only_low, metadata(1280, 720), 1600, 1000),
            Low
        );
        assert_eq!(optimal_layer(&only_low, metadata(1280, 720), 500, 500), Low);

        // Undeclared source dimensions always land on the lowest layer.
        assert_eq!(optimal_layer(&all, metadata(0, 0), 1600, 1000), Low);
        assert_eq!(optimal_layer(&all, metadata(0, 0), 0, 0), Low);
        assert_eq!(optimal_layer(&all, metadata(600, 400), 0, 0), Low);

        // Only the high layer exists: closest available wins.
        let only_high = layers(&[High]);
        assert_eq!(
            optimal_layer(&only_high, metadata(1280, 720), 200, 200),
            High
        );
    }

    #[test]
    fn no_layers_means_no_simulcast() {
        assert_eq!(
            optimal_layer(&HashSet::new(), TrackMetadata::default(), 100, 100),
            SimulcastLayer::None
        );
    }

    fn participant(name: &str) -> ParticipantId {
        ParticipantId {
            user_id: UserId::new(format!("@{name}:example.org")),
            device_id: DeviceId::new(name.to_uppercase()),
            call_id: "call1".to_string(),
        }
    }

    fn video_info(layer: SimulcastLayer) -> TrackInfo {
        TrackInfo {
            track_id: "track1".to_string(),
            stream_id: "stream1".to_string(),
            kind: TrackKind::Video,
            codec: RTCRtpCodecCapability::default(),
            layer,
        }
    }

    fn publisher_config() -> PublisherConfig {
        PublisherConfig {
            stall_timeout: Duration::from_secs(2),
            pli_min_interval: Duration::from_millis(500),
        }
    }

    fn track_with_layers(layers: &[SimulcastLayer]) -> PublishedTrack {
        let mut track = PublishedTrack::new(
            participant("bob"),
            &video_info(layers.first().copied().unwrap_or(SimulcastLayer::None)),
            metadata(1280, 720),
        );
        for layer in layers {
            let (source, _packets) = MockSource::new();
            let (publisher, _status) = Publisher::start(source, publisher_config());
            track.add_publisher(*layer, publisher);
        }
        track
    }

    #[tokio::test(start_paused = true)]
    async fn stall_migrates_subscriptions_to_low() {
        crate::test_utils::setup_tracing();
        let mut track = track_with_layers(&[SimulcastLayer::Low, SimulcastLayer::Medium]);
        let alice = participant("alice");
        let sink = MockSink::new();
        track
            .subscribe(alice.clone(), sink.clone(), SimulcastLayer::Medium)
            .await;

        track
            .handle_publisher_status(SimulcastLayer::Medium, PublisherStatus::Stalled)
            .await;

        assert_eq!(track.subscription_layer(&alice), Some(SimulcastLayer::Low));
        assert_eq!(sink.unsubscribed.load(Ordering::SeqCst), 0);

        // Recovery finds no orphaned subscriptions; alice stays on low.
        track
            .handle_publisher_status(SimulcastLayer::Medium, PublisherStatus::Recovered)
            .await;
        assert_eq!(track.subscription_layer(&alice), Some(SimulcastLayer::Low));
    }

    #[tokio::test(start_paused = true)]
    async fn stall_without_fallback_orphans_subscriptions() {
        crate::test_utils::setup_tracing();
        let mut track = track_with_layers(&[SimulcastLayer::Medium]);
        let alice = participant("alice");
        let sink = MockSink::new();
        track
            .subscribe(alice.clone(), sink.clone(), SimulcastLayer::Medium)
            .await;

        track
            .handle_publisher_status(SimulcastLayer::Medium, PublisherStatus::Stalled)
            .await;
        assert_eq!(track.subscription_layer(&alice), Some(SimulcastLayer::None));

        // The layer comes back: orphaned subscriptions reattach to it.
        track
            .handle_publisher_status(SimulcastLayer::Medium, PublisherStatus::Recovered)
            .await;
        assert_eq!(
            track.subscription_layer(&alice),
            Some(SimulcastLayer::Medium)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn muted_source_suppresses_stall_handling() {
        crate::test_utils::setup_tracing();
        let mut track = track_with_layers(&[SimulcastLayer::Low, SimulcastLayer::Medium]);
        track.set_metadata(TrackMetadata {
            max_width: 1280,
            max_height: 720,
            muted: true,
        });
        let alice = participant("alice");
        track
            .subscribe(alice.clone(), MockSink::new(), SimulcastLayer::Medium)
            .await;

        track
            .handle_publisher_status(SimulcastLayer::Medium, PublisherStatus::Stalled)
            .await;
        assert_eq!(
            track.subscription_layer(&alice),
            Some(SimulcastLayer::Medium)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_publisher_drops_dependent_subscriptions() {
        crate::test_utils::setup_tracing();
        let mut track = track_with_layers(&[SimulcastLayer::Low, SimulcastLayer::Medium]);
        let alice = participant("alice");
        let sink = MockSink::new();
        track
            .subscribe(alice.clone(), sink.clone(), SimulcastLayer::Medium)
            .await;

        track
            .handle_publisher_status(SimulcastLayer::Medium, PublisherStatus::TrackClosed)
            .await;

        assert_eq!(track.subscription_layer(&alice), None);
        assert_eq!(sink.unsubscribed.load(Ordering::SeqCst), 1);
        assert_eq!(track.publisher_count(), 1);
    }
}
