use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use webrtc::rtp;

use crate::watchdog::{Watchdog, WatchdogConfig, WatchdogStatus};

#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    /// The remote track reached end of stream.
    #[error("remote track closed")]
    Closed,
    #[error("remote track failed: {0}")]
    Failed(String),
}

/// One simulcast layer of one participant's source, seen from the forwarding
/// side: a stream of RTP packets plus a way to ask the remote end for a
/// key-frame.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn read_rtp(&self) -> Result<rtp::packet::Packet, SourceError>;
    async fn request_keyframe(&self) -> Result<(), SourceError>;
}

pub type SubscriptionId = u64;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_subscription_id() -> SubscriptionId {
    NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// The receiving end of a subscription, as the publisher sees it.
#[async_trait]
pub trait SubscriptionSink: Send + Sync {
    fn id(&self) -> SubscriptionId;
    async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<(), webrtc::Error>;
    async fn unsubscribe(&self) -> Result<(), webrtc::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherStatus {
    /// No packets from the source for a while.
    Stalled,
    /// Packets started flowing again.
    Recovered,
    /// The source track ended or the owner stopped the publisher. Terminal.
    TrackClosed,
    /// The source track failed with a read error. Terminal.
    Fatal,
}

#[derive(Debug, Clone, Copy)]
pub struct PublisherConfig {
    pub stall_timeout: Duration,
    pub pli_min_interval: Duration,
}

/// Owns one remote track and fans its RTP out to every current subscription.
/// The forwarding task feeds a stall watchdog; its transitions are surfaced
/// on the status stream, followed by exactly one terminal event when the
/// source ends or the owner calls [`Publisher::stop`].
pub struct Publisher {
    source: Arc<dyn RemoteSource>,
    subscriptions: Arc<Mutex<HashMap<SubscriptionId, Arc<dyn SubscriptionSink>>>>,
    watchdog: Watchdog,
    last_keyframe_request: Mutex<Instant>,
    pli_min_interval: Duration,
    stop_tx: mpsc::UnboundedSender<()>,
}

impl Publisher {
    pub fn start(
        source: Arc<dyn RemoteSource>,
        config: PublisherConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PublisherStatus>) {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (stop_tx, mut stop_rx) = mpsc::unbounded_channel();
        let (watchdog, mut watchdog_rx) =
            Watchdog::start(WatchdogConfig::with_timeout(config.stall_timeout));

        let transitions_tx = status_tx.clone();
        tokio::spawn(async move {
            while let Some(status) = watchdog_rx.recv().await {
                let mapped = match status {
                    WatchdogStatus::Stalled => PublisherStatus::Stalled,
                    WatchdogStatus::Recovered => PublisherStatus::Recovered,
                };
                if transitions_tx.send(mapped).is_err() {
                    break;
                }
            }
        });

        let subscriptions: Arc<Mutex<HashMap<SubscriptionId, Arc<dyn SubscriptionSink>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let forward_source = source.clone();
        let forward_subscriptions = subscriptions.clone();
        let forward_watchdog = watchdog.clone();
        tokio::spawn(async move {
            let final_status = loop {
                tokio::select! {
                    // Owner stop, or the publisher itself was dropped.
                    _ = stop_rx.recv() => break PublisherStatus::TrackClosed,
                    packet = forward_source.read_rtp() => match packet {
                        Ok(packet) => {
                            forward_watchdog.notify();
                            let sinks: Vec<_> = forward_subscriptions
                                .lock()
                                .expect("subscriptions lock poisoned")
                                .values()
                                .cloned()
                                .collect();
                            for sink in sinks {
                                if let Err(err) = sink.write_rtp(&packet).await {
                                    tracing::debug!(error = %err, "dropping RTP write to subscription");
                                }
                            }
                        }
                        Err(SourceError::Closed) => break PublisherStatus::TrackClosed,
                        Err(err) => {
                            tracing::warn!(error = %err, "remote track read failed");
                            break PublisherStatus::Fatal;
                        }
                    }
                }
            };
            forward_watchdog.close();
            let _ = status_tx.send(final_status);
        });

        let publisher = Self {
            source,
            subscriptions,
            watchdog,
            // Allow the first request immediately.
            last_keyframe_request: Mutex::new(Instant::now() - config.pli_min_interval),
            pli_min_interval: config.pli_min_interval,
            stop_tx,
        };
        (publisher, status_rx)
    }

    pub fn add_subscription(&self, sink: Arc<dyn SubscriptionSink>) {
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .insert(sink.id(), sink);
    }

    pub fn remove_subscription(&self, id: SubscriptionId) -> Option<Arc<dyn SubscriptionSink>> {
        self.subscriptions
            .lock()
            .expect("subscriptions lock poisoned")
            .remove(&id)
    }

    /// Asks the remote end for a key-frame, unless one was requested less
    /// than `pli_min_interval` ago. Many subscribers request independently;
    /// the source only needs to hear about it once per interval.
    pub async fn request_keyframe(&self) {
        {
            let mut last = self
                .last_keyframe_request
                .lock()
                .expect("keyframe lock poisoned");
            if last.elapsed() < self.pli_min_interval {
                return;
            }
            *last = Instant::now();
        }

        if let Err(err) = self.source.request_keyframe().await {
            tracing::warn!(error = %err, "failed to request key-frame from source");
        }
    }

    /// Stops the forwarding task; the status stream emits `TrackClosed` and
    /// closes.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
        self.watchdog.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex as AsyncMutex;

    pub(crate) struct MockSource {
        packets: AsyncMutex<mpsc::UnboundedReceiver<Result<rtp::packet::Packet, SourceError>>>,
        pub keyframe_requests: AtomicUsize,
    }

    impl MockSource {
        pub(crate) fn new() -> (
            Arc<Self>,
            mpsc::UnboundedSender<Result<rtp::packet::Packet, SourceError>>,
        ) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    packets: AsyncMutex::new(rx),
                    keyframe_requests: AtomicUsize::new(0),
                }),
                tx,
            )
        }
    }

    #[async_trait]
    impl RemoteSource for MockSource {
        async fn read_rtp(&self) -> Result<rtp::packet::Packet, SourceError> {
            match self.packets.lock().await.recv().await {
                Some(result) => result,
                None => Err(SourceError::Closed),
            }
        }

        async fn request_keyframe(&self) -> Result<(), SourceError> {
            self.keyframe_requests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) struct MockSink {
        id: SubscriptionId,
        pub written: AtomicUsize,
        pub unsubscribed: AtomicUsize,
    }

    impl MockSink {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                id: next_subscription_id(),
                written: AtomicUsize::new(0),
                unsubscribed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SubscriptionSink for MockSink {
        fn id(&self) -> SubscriptionId {
            self.id
        }

        async fn write_rtp(&self, _packet: &rtp::packet::Packet) -> Result<(), webrtc::Error> {
            self.written.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn unsubscribe(&self) -> Result<(), webrtc::Error> {
            self.unsubscribed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> PublisherConfig {
        PublisherConfig {
            stall_timeout: Duration::from_millis(200),
            pli_min_interval: Duration::from_millis(500),
        }
    }

    fn packet() -> rtp::packet::Packet {
        rtp::packet::Packet::default()
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_packets_to_all_subscriptions() {
        crate::test_utils::setup_tracing();
        let (source, packets) = MockSource::new();
        let (publisher, _status) = Publisher::start(source, config());
        let first = MockSink::new();
        let second = MockSink::new();
        publisher.add_subscription(first.clone());
        publisher.add_subscription(second.clone());

        packets.send(Ok(packet())).unwrap();
        packets.send(Ok(packet())).unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(first.written.load(Ordering::SeqCst), 2);
        assert_eq!(second.written.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stalls_and_recovers() {
        crate::test_utils::setup_tracing();
        let (source, packets) = MockSource::new();
        let (_publisher, mut status) = Publisher::start(source, config());

        packets.send(Ok(packet())).unwrap();
        assert_eq!(status.recv().await, Some(PublisherStatus::Stalled));

        packets.send(Ok(packet())).unwrap();
        assert_eq!(status.recv().await, Some(PublisherStatus::Recovered));
    }

    #[tokio::test(start_paused = true)]
    async fn closing_the_source_is_terminal() {
        crate::test_utils::setup_tracing();
        let (source, packets) = MockSource::new();
        let (_publisher, mut status) = Publisher::start(source, config());

        packets.send(Err(SourceError::Closed)).unwrap();
        assert_eq!(status.recv().await, Some(PublisherStatus::TrackClosed));
        assert_eq!(status.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn read_failure_is_fatal() {
        crate::test_utils::setup_tracing();
        let (source, packets) = MockSource::new();
        let (_publisher, mut status) = Publisher::start(source, config());

        packets
            .send(Err(SourceError::Failed("decrypt error".to_string())))
            .unwrap();
        assert_eq!(status.recv().await, Some(PublisherStatus::Fatal));
        assert_eq!(status.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_emits_track_closed() {
        crate::test_utils::setup_tracing();
        let (source, _packets) = MockSource::new();
        let (publisher, mut status) = Publisher::start(source, config());

        publisher.stop();
        assert_eq!(status.recv().await, Some(PublisherStatus::TrackClosed));
        assert_eq!(status.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn keyframe_requests_are_throttled() {
        crate::test_utils::setup_tracing();
        let (source, _packets) = MockSource::new();
        let (publisher, _status) = Publisher::start(source.clone(), config());

        publisher.request_keyframe().await;
        publisher.request_keyframe().await;
        assert_eq!(source.keyframe_requests.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        publisher.request_keyframe().await;
        assert_eq!(source.keyframe_requests.load(Ordering::SeqCst), 2);
    }
}
