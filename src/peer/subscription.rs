use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use webrtc::rtcp::payload_feedbacks::full_intra_request::FullIntraRequest;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use crate::conference::publisher::{next_subscription_id, SubscriptionId, SubscriptionSink};
use crate::peer::{SimulcastLayer, TrackInfo};
use crate::watchdog::{Watchdog, WatchdogConfig, WatchdogStatus};

/// What a subscription needs from the peer it is attached to. The key-frame
/// request goes through the peer because the publisher lives on a different
/// peer than the subscriber.
#[async_trait]
pub trait ConnectionController: Send + Sync {
    async fn subscribe(
        &self,
        track: Arc<TrackLocalStaticRTP>,
    ) -> Result<Arc<RTCRtpSender>, webrtc::Error>;

    async fn unsubscribe(&self, sender: &Arc<RTCRtpSender>) -> Result<(), webrtc::Error>;

    async fn request_keyframe(&self, info: &TrackInfo);
}

/// One outgoing track to one participant: a local RTP track attached to the
/// subscriber's session, an RTCP return path and a stall watchdog that nags
/// the upstream publisher for key-frames when packets stop arriving.
pub struct Subscription {
    id: SubscriptionId,
    sender: Arc<RTCRtpSender>,
    track: Arc<TrackLocalStaticRTP>,
    info: TrackInfo,
    controller: Arc<dyn ConnectionController>,
    watchdog: Watchdog,
}

impl Subscription {
    pub async fn new(
        info: TrackInfo,
        controller: Arc<dyn ConnectionController>,
        stall_timeout: Duration,
    ) -> Result<Arc<Self>, webrtc::Error> {
        // The RID tells the remote end which simulcast encoding this is;
        // absent for audio and non-simulcast video.
        let track = if info.layer == SimulcastLayer::None {
            Arc::new(TrackLocalStaticRTP::new(
                info.codec.clone(),
                info.track_id.clone(),
                info.stream_id.clone(),
            ))
        } else {
            Arc::new(TrackLocalStaticRTP::new_with_rid(
                info.codec.clone(),
                info.track_id.clone(),
                info.layer.rid().to_string(),
                info.stream_id.clone(),
            ))
        };

        let sender = controller.subscribe(track.clone()).await?;

        let (watchdog, mut watchdog_rx) =
            Watchdog::start(WatchdogConfig::with_timeout(stall_timeout));

        let subscription = Arc::new(Self {
            id: next_subscription_id(),
            sender,
            track,
            info,
            controller,
            watchdog,
        });

        {
            let controller = subscription.controller.clone();
            let info = subscription.info.clone();
            tokio::spawn(async move {
                while let Some(status) = watchdog_rx.recv().await {
                    match status {
                        WatchdogStatus::Stalled => {
                            tracing::warn!(
                                track_id = %info.track_id,
                                layer = %info.layer,
                                "no RTP on subscription, requesting key-frame"
                            );
                            controller.request_keyframe(&info).await;
                        }
                        WatchdogStatus::Recovered => {
                            tracing::debug!(track_id = %info.track_id, "subscription recovered");
                        }
                    }
                }
            });
        }

        subscription.clone().spawn_rtcp_reader();
        Ok(subscription)
    }

    /// Reads RTCP from our local sender. A picture-loss indication or a full
    /// intra request from the subscriber is translated into a key-frame
    /// request towards the upstream publisher; every other kind is dropped.
    fn spawn_rtcp_reader(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                match self.sender.read_rtcp().await {
                    Ok((packets, _attributes)) => {
                        for packet in packets {
                            let any = packet.as_any();
                            if any.downcast_ref::<PictureLossIndication>().is_some()
                                || any.downcast_ref::<FullIntraRequest>().is_some()
                            {
                                self.controller.request_keyframe(&self.info).await;
                            }
                        }
                    }
                    Err(webrtc::Error::ErrClosedPipe)
                    | Err(webrtc::Error::ErrConnectionClosed) => {
                        tracing::debug!(
                            track_id = %self.info.track_id,
                            "RTCP reader closed"
                        );
                        self.watchdog.close();
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to read RTCP on subscription");
                    }
                }
            }
        });
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<(), webrtc::Error> {
        if !self.watchdog.notify() {
            tracing::debug!(track_id = %self.info.track_id, "subscription is closed");
        }
        self.track.write_rtp(packet).await?;
        Ok(())
    }

    /// Closes the watchdog and detaches the track from the peer.
    pub async fn unsubscribe(&self) -> Result<(), webrtc::Error> {
        self.watchdog.close();
        self.controller.unsubscribe(&self.sender).await
    }
}

#[async_trait]
impl SubscriptionSink for Subscription {
    fn id(&self) -> SubscriptionId {
        self.id
    }

    async fn write_rtp(&self, packet: &rtp::packet::Packet) -> Result<(), webrtc::Error> {
        Subscription::write_rtp(self, packet).await
    }

    async fn unsubscribe(&self) -> Result<(), webrtc::Error> {
        Subscription::unsubscribe(self).await
    }
}
