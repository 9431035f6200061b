//! Engine glue: one object wiring the forwarding plane to the decision
//! plane.
//!
//! Media ingress goes `on_rtp_packet -> forwarder -> pacer -> socket sink`.
//! Control runs alongside: RTCP feedback updates per-subscriber bitrate
//! controllers and bandwidth estimates, the periodic [`SfuEngine::process`]
//! reconciles layers, and every layer switch lands back in the forwarder's
//! rules after the switch callback has fired.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use confero_infra_common::MetricsSink;
use confero_media_core::{MediaKind, ParticipantId, StreamId};
use confero_rtp_core::packet::rtcp::RtcpPacket;
use confero_rtp_core::pacer::PacerSink;
use confero_rtp_core::{
    BitrateController, BitrateControllerConfig, Pacer, PacerConfig, RtpSsrc, SimulcastLayer,
};

use crate::forwarder::{ForwarderStats, RtpForwarder};
use crate::mixer::{AudioMixer, AudioMixerConfig};
use crate::subscription::{BandwidthInfo, SubscriptionManager};
use crate::types::{
    ForwardingRule, KeyframeRequestSink, LayerSwitchSink, PacketSink, RtpStreamInfo,
};
use crate::Result;

/// Pacer priority for audio packets.
const AUDIO_PRIORITY: i32 = 10;
/// Pacer priority for video packets.
const VIDEO_PRIORITY: i32 = 5;

/// Engine configuration.
#[derive(Debug, Clone, Default)]
pub struct SfuEngineConfig {
    /// Egress pacing
    pub pacer: PacerConfig,
    /// Per-subscriber rate adaptation
    pub bitrate: BitrateControllerConfig,
    /// Audio mixing format
    pub mixer: AudioMixerConfig,
}

/// The assembled SFU core.
pub struct SfuEngine {
    forwarder: Arc<RtpForwarder>,
    subscriptions: Arc<SubscriptionManager>,
    mixer: Arc<AudioMixer>,
    pacer: Arc<Mutex<Pacer>>,
    controllers: Mutex<HashMap<ParticipantId, BitrateController>>,
    bandwidth: Mutex<HashMap<ParticipantId, BandwidthInfo>>,
    audio_payload_types: Arc<RwLock<Vec<u8>>>,
    keyframe_sink: Mutex<Option<Arc<dyn KeyframeRequestSink>>>,
    user_layer_switch_sink: Mutex<Option<Arc<dyn LayerSwitchSink>>>,
    metrics: Mutex<Option<Arc<dyn MetricsSink>>>,
    config: SfuEngineConfig,
}

impl SfuEngine {
    /// Build an engine and wire its internal planes together.
    pub fn new(config: SfuEngineConfig) -> Arc<Self> {
        let forwarder = Arc::new(RtpForwarder::new());
        let subscriptions = Arc::new(SubscriptionManager::new());
        let mixer = Arc::new(AudioMixer::new(config.mixer.clone()));
        let pacer = Arc::new(Mutex::new(Pacer::new(config.pacer.clone())));
        let audio_payload_types = Arc::new(RwLock::new(Vec::new()));

        // Forwarder egress feeds the pacer; audio outranks video
        {
            let pacer = Arc::clone(&pacer);
            let audio_pts = Arc::clone(&audio_payload_types);
            forwarder.set_packet_sink(Arc::new(
                move |_subscriber: &ParticipantId, packet: &[u8], destination: SocketAddr| {
                    let priority = if packet.len() > 1
                        && audio_pts.read().contains(&(packet[1] & 0x7F))
                    {
                        AUDIO_PRIORITY
                    } else {
                        VIDEO_PRIORITY
                    };
                    if pacer
                        .lock()
                        .enqueue(Bytes::copy_from_slice(packet), destination, priority)
                        .is_err()
                    {
                        trace!("pacer rejected packet");
                    }
                },
            ));
        }

        let engine = Arc::new(Self {
            forwarder,
            subscriptions,
            mixer,
            pacer,
            controllers: Mutex::new(HashMap::new()),
            bandwidth: Mutex::new(HashMap::new()),
            audio_payload_types,
            keyframe_sink: Mutex::new(None),
            user_layer_switch_sink: Mutex::new(None),
            metrics: Mutex::new(None),
            config,
        });

        // Layer decisions land in the forwarder's rules, after the
        // user-visible callback has fired
        {
            let engine_ref = Arc::downgrade(&engine);
            engine
                .subscriptions
                .set_layer_switch_sink(Arc::new(
                    move |subscriber: &ParticipantId,
                          publisher: &ParticipantId,
                          stream: &StreamId,
                          old: i32,
                          new: i32| {
                        let Some(engine) = engine_ref.upgrade() else {
                            return;
                        };
                        if let Some(user_sink) = engine.user_layer_sink() {
                            user_sink.on_layer_switch(subscriber, publisher, stream, old, new);
                        }
                        engine
                            .forwarder
                            .set_preferred_layer(publisher, subscriber, new);
                    },
                ));
        }

        engine
    }

    fn user_layer_sink(&self) -> Option<Arc<dyn LayerSwitchSink>> {
        self.user_layer_switch_sink.lock().clone()
    }

    /// Install the sink paced packets leave through.
    pub fn set_socket_sink(&self, sink: impl PacerSink + 'static) {
        self.pacer.lock().set_sink(sink);
    }

    /// Install a sink observing layer switches.
    pub fn set_layer_switch_sink(&self, sink: Arc<dyn LayerSwitchSink>) {
        *self.user_layer_switch_sink.lock() = Some(sink);
    }

    /// Install the sink notified when a subscriber needs a keyframe.
    pub fn set_keyframe_request_sink(&self, sink: Arc<dyn KeyframeRequestSink>) {
        *self.keyframe_sink.lock() = Some(sink);
    }

    /// Install the metrics destination.
    pub fn set_metrics_sink(&self, sink: Arc<dyn MetricsSink>) {
        *self.metrics.lock() = Some(sink);
    }

    /// Direct access to the forwarding plane.
    pub fn forwarder(&self) -> &Arc<RtpForwarder> {
        &self.forwarder
    }

    /// Direct access to the subscription manager.
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    /// Direct access to the audio mixer.
    pub fn mixer(&self) -> &Arc<AudioMixer> {
        &self.mixer
    }

    /// Register a publisher stream; video streams may carry a layer table.
    pub fn register_publisher(
        &self,
        publisher_id: &ParticipantId,
        stream_id: &StreamId,
        info: RtpStreamInfo,
        layers: Option<Vec<SimulcastLayer>>,
    ) -> Result<()> {
        if info.kind == MediaKind::Audio {
            let mut pts = self.audio_payload_types.write();
            if !pts.contains(&info.payload_type) {
                pts.push(info.payload_type);
            }
        }
        self.forwarder
            .register_publisher(publisher_id, stream_id, info)?;
        if let Some(layers) = layers {
            self.subscriptions
                .set_available_layers(publisher_id, stream_id, layers)?;
        }
        Ok(())
    }

    /// Remove one stream of a publisher.
    pub fn unregister_publisher(&self, publisher_id: &ParticipantId, stream_id: &StreamId) {
        self.forwarder.unregister_publisher(publisher_id, stream_id);
    }

    /// Subscribe `subscriber_id` to a publisher stream.
    pub fn subscribe(
        &self,
        subscriber_id: &ParticipantId,
        publisher_id: &ParticipantId,
        stream_id: &StreamId,
        destination: SocketAddr,
        rewritten_ssrc: RtpSsrc,
        target_layer: i32,
    ) -> Result<()> {
        let rule = ForwardingRule {
            subscriber_id: subscriber_id.clone(),
            destination,
            rewritten_ssrc,
            preferred_layer: target_layer,
            active: true,
        };
        self.forwarder.subscribe(publisher_id, subscriber_id, rule)?;
        self.subscriptions
            .subscribe(subscriber_id, publisher_id, stream_id, target_layer);
        self.controllers
            .lock()
            .entry(subscriber_id.clone())
            .or_insert_with(|| BitrateController::new(self.config.bitrate.clone()));
        Ok(())
    }

    /// Remove a subscription.
    pub fn unsubscribe(
        &self,
        subscriber_id: &ParticipantId,
        publisher_id: &ParticipantId,
        stream_id: &StreamId,
    ) {
        self.forwarder.unsubscribe(publisher_id, subscriber_id);
        self.subscriptions
            .unsubscribe(subscriber_id, publisher_id, stream_id);
    }

    /// Manually pin a subscription to a layer; -1 returns to automatic.
    pub fn set_target_layer(
        &self,
        subscriber_id: &ParticipantId,
        publisher_id: &ParticipantId,
        stream_id: &StreamId,
        layer: i32,
    ) -> Result<()> {
        self.subscriptions
            .set_target_layer(subscriber_id, publisher_id, stream_id, layer)?;
        self.forwarder
            .set_preferred_layer(publisher_id, subscriber_id, layer);
        Ok(())
    }

    /// Pause or resume a subscription. Rules stay in place, inactive.
    pub fn set_paused(
        &self,
        subscriber_id: &ParticipantId,
        publisher_id: &ParticipantId,
        stream_id: &StreamId,
        paused: bool,
    ) -> Result<()> {
        self.subscriptions
            .set_paused(subscriber_id, publisher_id, stream_id, paused)?;
        self.forwarder
            .set_rules_active(publisher_id, subscriber_id, !paused);
        Ok(())
    }

    /// Hot path: one received RTP packet.
    pub fn on_rtp_packet(&self, ssrc: RtpSsrc, packet: &[u8], source: SocketAddr) {
        self.forwarder.on_rtp_packet(ssrc, packet, source);
    }

    /// One received RTCP compound packet from `subscriber_id`.
    pub fn on_rtcp_packet(&self, subscriber_id: &ParticipantId, data: &[u8]) {
        let packets = match RtcpPacket::parse_compound(data) {
            Ok(packets) => packets,
            Err(e) => {
                debug!(subscriber = %subscriber_id, error = %e, "dropping malformed RTCP");
                return;
            }
        };

        for packet in packets {
            match packet {
                RtcpPacket::ReceiverEstimatedMaxBitrate(remb) => {
                    trace!(subscriber = %subscriber_id, bitrate = remb.bitrate_bps, "REMB");
                    // Layer selection sees the controller's moderated
                    // output, never the raw receiver estimate
                    let moderated = {
                        let mut controllers = self.controllers.lock();
                        let Some(controller) = controllers.get_mut(subscriber_id) else {
                            continue;
                        };
                        controller.on_remb(remb.bitrate_bps);
                        controller.target_bitrate()
                    };
                    self.merge_bandwidth(subscriber_id, |info| {
                        info.estimated_bps = moderated;
                    });
                }
                RtcpPacket::ReceiverReport(rr) => {
                    let Some(block) = rr.report_blocks.first() else {
                        continue;
                    };
                    let loss = block.fraction_lost as f32 / 256.0;
                    let moderated = {
                        let mut controllers = self.controllers.lock();
                        let Some(controller) = controllers.get_mut(subscriber_id) else {
                            continue;
                        };
                        controller.on_packet_loss(loss);
                        controller.target_bitrate()
                    };
                    self.merge_bandwidth(subscriber_id, |info| {
                        info.packet_loss = loss;
                        info.estimated_bps = moderated;
                    });
                }
                RtcpPacket::PictureLossIndication(pli) => {
                    self.request_keyframe(pli.media_ssrc);
                }
                RtcpPacket::FullIntraRequest(fir) => {
                    self.request_keyframe(fir.media_ssrc);
                }
                RtcpPacket::Nack(nack) => {
                    // Retransmission history lives outside the core; a NACK
                    // storm still signals trouble worth a log line
                    debug!(subscriber = %subscriber_id, media_ssrc = nack.media_ssrc,
                           lost = nack.lost_packets.len(), "NACK received");
                }
                other => {
                    trace!(subscriber = %subscriber_id, ?other, "RTCP ignored");
                }
            }
        }
    }

    fn merge_bandwidth(
        &self,
        subscriber_id: &ParticipantId,
        update: impl FnOnce(&mut BandwidthInfo),
    ) {
        let mut bandwidth = self.bandwidth.lock();
        let info = bandwidth.entry(subscriber_id.clone()).or_default();
        update(info);
        self.subscriptions.update_bandwidth(subscriber_id, *info);
    }

    fn request_keyframe(&self, ssrc: RtpSsrc) {
        if let Some(sink) = self.keyframe_sink.lock().clone() {
            sink.on_keyframe_request(ssrc);
        } else {
            warn!(ssrc, "keyframe requested but no sink installed");
        }
    }

    /// Periodic control-plane work: layer reconciliation, bitrate
    /// controller updates and pacer drain. Call every ~10 ms.
    pub fn process(&self) {
        // Tick every controller, then push the adapted targets into the
        // subscription manager so the next reconciliation sees them
        let targets: Vec<(ParticipantId, u64)> = {
            let mut controllers = self.controllers.lock();
            controllers
                .iter_mut()
                .map(|(subscriber, controller)| {
                    controller.process();
                    (subscriber.clone(), controller.target_bitrate())
                })
                .collect()
        };
        for (subscriber, target) in targets {
            self.merge_bandwidth(&subscriber, |info| {
                info.estimated_bps = target;
            });
        }
        self.subscriptions.process();

        let queue_depth = {
            let mut pacer = self.pacer.lock();
            pacer.process();
            pacer.queue_size()
        };

        if let Some(metrics) = self.metrics.lock().clone() {
            let stats = self.forwarder.stats();
            metrics.gauge("sfu_pacer_queue_depth", queue_depth as f64, &[]);
            metrics.gauge("sfu_active_publishers", stats.active_publishers as f64, &[]);
            metrics.gauge(
                "sfu_active_subscribers",
                stats.active_subscribers as f64,
                &[],
            );
        }
    }

    /// Remove a participant entirely: subscriptions first, then publisher
    /// streams, so no rule is ever orphaned.
    pub fn remove_participant(&self, participant_id: &ParticipantId) {
        self.subscriptions.remove_participant(participant_id);
        self.forwarder.remove_subscriber(participant_id);
        self.forwarder.remove_publisher(participant_id);
        self.mixer.remove_source(participant_id);
        self.controllers.lock().remove(participant_id);
        self.bandwidth.lock().remove(participant_id);
        debug!(participant = %participant_id, "participant removed");
    }

    /// Forwarding-plane counters.
    pub fn forwarder_stats(&self) -> ForwarderStats {
        self.forwarder.stats()
    }
}
