//! Subscription tracking and simulcast layer selection.
//!
//! Maps each `(subscriber, publisher, stream)` triple to its layer choice.
//! Automatic selection is damped: upgrades need headroom sustained over two
//! consecutive decision cycles, downgrades take effect immediately on loss
//! or overshoot, so a noisy bandwidth estimate cannot make the layer flap.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use confero_media_core::{ParticipantId, StreamId};
use confero_rtp_core::SimulcastLayer;

use crate::error::Error;
use crate::types::LayerSwitchSink;
use crate::Result;

/// Headroom an upgrade candidate must leave: its bitrate may use at most
/// this fraction of the estimate.
const UPGRADE_HEADROOM: f64 = 0.85;

/// Consecutive qualifying cycles before an upgrade is applied.
const UPGRADE_CYCLES: u8 = 2;

/// Overshoot fraction beyond which the current layer is abandoned at once.
const DOWNGRADE_OVERSHOOT: f64 = 1.10;

/// Loss fraction beyond which a downgrade is immediate.
const DOWNGRADE_LOSS: f32 = 0.02;

/// Per-subscriber link estimate, updated from RTCP.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BandwidthInfo {
    /// Estimated available bits per second
    pub estimated_bps: u64,
    /// Loss fraction in [0, 1]
    pub packet_loss: f32,
    /// Round-trip time in milliseconds
    pub rtt_ms: f32,
}

/// One subscriber-to-stream association.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Publisher participant
    pub publisher_id: ParticipantId,
    /// Stream of that publisher
    pub stream_id: StreamId,
    /// Requested layer; -1 selects automatically
    pub target_layer: i32,
    /// Layer currently forwarded
    pub current_layer: i32,
    /// Paused subscriptions keep state but forward nothing
    pub paused: bool,
    /// Bytes forwarded to this subscription so far
    pub bytes_forwarded: u64,
    /// Upgrade candidate and how many cycles it has qualified
    #[serde(skip)]
    pending_upgrade: Option<(i32, u8)>,
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct SubscriptionKey {
    subscriber_id: ParticipantId,
    publisher_id: ParticipantId,
    stream_id: StreamId,
}

#[derive(Default)]
struct State {
    subscriptions: HashMap<SubscriptionKey, Subscription>,
    stream_layers: HashMap<(ParticipantId, StreamId), Vec<SimulcastLayer>>,
    bandwidth: HashMap<ParticipantId, BandwidthInfo>,
    layer_switch_sink: Option<Arc<dyn LayerSwitchSink>>,
}

/// Tracks subscriptions and reconciles layer choices against bandwidth.
#[derive(Default)]
pub struct SubscriptionManager {
    state: Mutex<State>,
}

impl SubscriptionManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the sink fired on every layer switch, before the forwarding
    /// rule changes.
    pub fn set_layer_switch_sink(&self, sink: Arc<dyn LayerSwitchSink>) {
        self.state.lock().layer_switch_sink = Some(sink);
    }

    /// Publish the layer table of a stream.
    ///
    /// Layers must be ordered by index with non-decreasing bitrates.
    pub fn set_available_layers(
        &self,
        publisher_id: &ParticipantId,
        stream_id: &StreamId,
        layers: Vec<SimulcastLayer>,
    ) -> Result<()> {
        for pair in layers.windows(2) {
            if pair[1].layer_index <= pair[0].layer_index {
                return Err(Error::InvalidLayerTable(
                    "layer indices must be strictly increasing".to_string(),
                ));
            }
            if pair[1].bitrate_kbps < pair[0].bitrate_kbps {
                return Err(Error::InvalidLayerTable(format!(
                    "bitrate decreases from layer {} to {}",
                    pair[0].layer_index, pair[1].layer_index
                )));
            }
        }

        self.state
            .lock()
            .stream_layers
            .insert((publisher_id.clone(), stream_id.clone()), layers);
        Ok(())
    }

    /// Create a subscription. `target_layer` of -1 selects automatically;
    /// automatic subscriptions start on the highest layer so cold starts do
    /// not stall at the bottom.
    pub fn subscribe(
        &self,
        subscriber_id: &ParticipantId,
        publisher_id: &ParticipantId,
        stream_id: &StreamId,
        target_layer: i32,
    ) {
        let mut state = self.state.lock();
        let initial_layer = if target_layer >= 0 {
            target_layer
        } else {
            state
                .stream_layers
                .get(&(publisher_id.clone(), stream_id.clone()))
                .and_then(|layers| layers.iter().filter(|l| l.active).map(|l| l.layer_index).max())
                .unwrap_or(2)
        };

        state.subscriptions.insert(
            SubscriptionKey {
                subscriber_id: subscriber_id.clone(),
                publisher_id: publisher_id.clone(),
                stream_id: stream_id.clone(),
            },
            Subscription {
                publisher_id: publisher_id.clone(),
                stream_id: stream_id.clone(),
                target_layer,
                current_layer: initial_layer,
                paused: false,
                bytes_forwarded: 0,
                pending_upgrade: None,
            },
        );
    }

    /// Remove a subscription.
    pub fn unsubscribe(
        &self,
        subscriber_id: &ParticipantId,
        publisher_id: &ParticipantId,
        stream_id: &StreamId,
    ) {
        self.state.lock().subscriptions.remove(&SubscriptionKey {
            subscriber_id: subscriber_id.clone(),
            publisher_id: publisher_id.clone(),
            stream_id: stream_id.clone(),
        });
    }

    /// Remove everything involving a participant, as subscriber or
    /// publisher (departure cascade).
    pub fn remove_participant(&self, participant_id: &ParticipantId) {
        let mut state = self.state.lock();
        state.subscriptions.retain(|key, _| {
            key.subscriber_id != *participant_id && key.publisher_id != *participant_id
        });
        state
            .stream_layers
            .retain(|(publisher, _), _| publisher != participant_id);
        state.bandwidth.remove(participant_id);
    }

    /// Pause or resume one subscription.
    pub fn set_paused(
        &self,
        subscriber_id: &ParticipantId,
        publisher_id: &ParticipantId,
        stream_id: &StreamId,
        paused: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let sub = state
            .subscriptions
            .get_mut(&SubscriptionKey {
                subscriber_id: subscriber_id.clone(),
                publisher_id: publisher_id.clone(),
                stream_id: stream_id.clone(),
            })
            .ok_or_else(|| Error::UnknownSubscription {
                subscriber: subscriber_id.clone(),
                publisher: publisher_id.clone(),
            })?;
        sub.paused = paused;
        Ok(())
    }

    /// Override the layer manually; -1 returns to automatic selection.
    pub fn set_target_layer(
        &self,
        subscriber_id: &ParticipantId,
        publisher_id: &ParticipantId,
        stream_id: &StreamId,
        layer: i32,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let sub = state
            .subscriptions
            .get_mut(&SubscriptionKey {
                subscriber_id: subscriber_id.clone(),
                publisher_id: publisher_id.clone(),
                stream_id: stream_id.clone(),
            })
            .ok_or_else(|| Error::UnknownSubscription {
                subscriber: subscriber_id.clone(),
                publisher: publisher_id.clone(),
            })?;
        sub.target_layer = layer;
        sub.pending_upgrade = None;
        Ok(())
    }

    /// Update a subscriber's bandwidth estimate from RTCP feedback.
    pub fn update_bandwidth(&self, subscriber_id: &ParticipantId, info: BandwidthInfo) {
        self.state
            .lock()
            .bandwidth
            .insert(subscriber_id.clone(), info);
    }

    /// Account bytes forwarded to a subscription.
    pub fn add_forwarded_bytes(
        &self,
        subscriber_id: &ParticipantId,
        publisher_id: &ParticipantId,
        stream_id: &StreamId,
        bytes: u64,
    ) {
        let mut state = self.state.lock();
        if let Some(sub) = state.subscriptions.get_mut(&SubscriptionKey {
            subscriber_id: subscriber_id.clone(),
            publisher_id: publisher_id.clone(),
            stream_id: stream_id.clone(),
        }) {
            sub.bytes_forwarded += bytes;
        }
    }

    /// One decision cycle: reconcile every automatic subscription's layer
    /// against the latest bandwidth estimates.
    pub fn process(&self) {
        let mut state = self.state.lock();
        let sink = state.layer_switch_sink.clone();

        let keys: Vec<SubscriptionKey> = state.subscriptions.keys().cloned().collect();
        for key in keys {
            let Some(layers) = state
                .stream_layers
                .get(&(key.publisher_id.clone(), key.stream_id.clone()))
                .cloned()
            else {
                continue;
            };
            let bandwidth = state.bandwidth.get(&key.subscriber_id).copied();
            let Some(sub) = state.subscriptions.get_mut(&key) else {
                continue;
            };
            if sub.paused || sub.target_layer >= 0 {
                continue;
            }

            let old_layer = sub.current_layer;
            let new_layer = decide_layer(sub, &layers, bandwidth);
            if new_layer != old_layer {
                debug!(subscriber = %key.subscriber_id, publisher = %key.publisher_id,
                       old_layer, new_layer, "layer switch");
                sub.current_layer = new_layer;
                if let Some(sink) = &sink {
                    sink.on_layer_switch(
                        &key.subscriber_id,
                        &key.publisher_id,
                        &key.stream_id,
                        old_layer,
                        new_layer,
                    );
                }
            }
        }
    }

    /// Current layer of a subscription, if it exists.
    pub fn current_layer(
        &self,
        subscriber_id: &ParticipantId,
        publisher_id: &ParticipantId,
        stream_id: &StreamId,
    ) -> Option<i32> {
        self.state
            .lock()
            .subscriptions
            .get(&SubscriptionKey {
                subscriber_id: subscriber_id.clone(),
                publisher_id: publisher_id.clone(),
                stream_id: stream_id.clone(),
            })
            .map(|s| s.current_layer)
    }

    /// All subscriptions held by a subscriber.
    pub fn subscriptions_of(&self, subscriber_id: &ParticipantId) -> Vec<Subscription> {
        self.state
            .lock()
            .subscriptions
            .iter()
            .filter(|(key, _)| key.subscriber_id == *subscriber_id)
            .map(|(_, sub)| sub.clone())
            .collect()
    }

    /// Total number of subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }
}

/// Pick the layer a subscription should forward, applying hysteresis
/// against the previous choice.
fn decide_layer(
    sub: &mut Subscription,
    layers: &[SimulcastLayer],
    bandwidth: Option<BandwidthInfo>,
) -> i32 {
    let highest_active = layers
        .iter()
        .filter(|l| l.active)
        .map(|l| l.layer_index)
        .max()
        .unwrap_or(0);

    // No estimate yet: stay high rather than stalling the cold start
    let Some(bandwidth) = bandwidth else {
        sub.pending_upgrade = None;
        return highest_active;
    };
    let estimated = bandwidth.estimated_bps as f64;

    // Best layer whose bitrate fits the estimate outright
    let fitting = layers
        .iter()
        .filter(|l| l.active && (l.bitrate_kbps as u64 * 1000) <= bandwidth.estimated_bps)
        .map(|l| l.layer_index)
        .max()
        .unwrap_or(0);

    let current = sub.current_layer;
    if fitting > current {
        // Upgrade only with sustained headroom
        let candidate_bitrate = layers
            .iter()
            .find(|l| l.layer_index == fitting)
            .map(|l| l.bitrate_kbps as f64 * 1000.0)
            .unwrap_or(f64::MAX);
        if candidate_bitrate <= estimated * UPGRADE_HEADROOM {
            let cycles = match sub.pending_upgrade {
                Some((layer, cycles)) if layer == fitting => cycles + 1,
                _ => 1,
            };
            if cycles >= UPGRADE_CYCLES {
                sub.pending_upgrade = None;
                return fitting;
            }
            sub.pending_upgrade = Some((fitting, cycles));
        } else {
            sub.pending_upgrade = None;
        }
        return current;
    }
    sub.pending_upgrade = None;

    if fitting < current {
        // Downgrade immediately on loss or clear overshoot
        let current_bitrate = layers
            .iter()
            .find(|l| l.layer_index == current)
            .map(|l| l.bitrate_kbps as f64 * 1000.0);
        let overshoot = current_bitrate
            .map(|bps| bps > estimated * DOWNGRADE_OVERSHOOT)
            .unwrap_or(true);
        if bandwidth.packet_loss > DOWNGRADE_LOSS || overshoot {
            return fitting;
        }
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn three_layers() -> Vec<SimulcastLayer> {
        vec![
            SimulcastLayer {
                layer_index: 0,
                width: 320,
                height: 180,
                fps: 15,
                bitrate_kbps: 150,
                active: true,
            },
            SimulcastLayer {
                layer_index: 1,
                width: 640,
                height: 360,
                fps: 30,
                bitrate_kbps: 500,
                active: true,
            },
            SimulcastLayer {
                layer_index: 2,
                width: 1280,
                height: 720,
                fps: 30,
                bitrate_kbps: 1500,
                active: true,
            },
        ]
    }

    fn manager_with_sub() -> SubscriptionManager {
        let manager = SubscriptionManager::new();
        manager
            .set_available_layers(&"pub".to_string(), &"cam".to_string(), three_layers())
            .unwrap();
        manager.subscribe(&"sub".to_string(), &"pub".to_string(), &"cam".to_string(), -1);
        manager
    }

    fn bandwidth(bps: u64) -> BandwidthInfo {
        BandwidthInfo {
            estimated_bps: bps,
            packet_loss: 0.0,
            rtt_ms: 20.0,
        }
    }

    #[test]
    fn test_cold_start_begins_on_highest_layer() {
        let manager = manager_with_sub();
        assert_eq!(
            manager.current_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string()),
            Some(2)
        );
    }

    #[test]
    fn test_downgrade_on_overshoot_is_immediate() {
        let manager = manager_with_sub();
        let switches: Arc<StdMutex<Vec<(i32, i32)>>> = Arc::new(StdMutex::new(Vec::new()));
        let switches_clone = Arc::clone(&switches);
        manager.set_layer_switch_sink(Arc::new(
            move |_s: &ParticipantId, _p: &ParticipantId, _st: &StreamId, old: i32, new: i32| {
                switches_clone.lock().unwrap().push((old, new));
            },
        ));

        // 800 kbps: layer 2 (1500 kbps) overshoots 110%, layer 1 fits
        manager.update_bandwidth(&"sub".to_string(), bandwidth(800_000));
        manager.process();

        assert_eq!(
            manager.current_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string()),
            Some(1)
        );
        assert_eq!(switches.lock().unwrap().as_slice(), &[(2, 1)]);
    }

    #[test]
    fn test_downgrade_on_loss_is_immediate() {
        let manager = manager_with_sub();
        manager.update_bandwidth(&"sub".to_string(), bandwidth(800_000));
        manager.process(); // settle on layer 1

        manager.update_bandwidth(
            &"sub".to_string(),
            BandwidthInfo {
                estimated_bps: 400_000,
                packet_loss: 0.05,
                rtt_ms: 80.0,
            },
        );
        manager.process();
        assert_eq!(
            manager.current_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string()),
            Some(0)
        );
    }

    #[test]
    fn test_upgrade_requires_two_cycles_of_headroom() {
        let manager = manager_with_sub();
        manager.update_bandwidth(&"sub".to_string(), bandwidth(200_000));
        manager.process(); // down to 0

        assert_eq!(
            manager.current_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string()),
            Some(0)
        );

        // 700 kbps: layer 1 fits with headroom (500k <= 0.85 * 700k)
        manager.update_bandwidth(&"sub".to_string(), bandwidth(700_000));
        manager.process();
        assert_eq!(
            manager.current_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string()),
            Some(0),
            "first qualifying cycle does not switch yet"
        );

        manager.process();
        assert_eq!(
            manager.current_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string()),
            Some(1),
            "second consecutive cycle upgrades"
        );
    }

    #[test]
    fn test_upgrade_without_headroom_is_held() {
        let manager = manager_with_sub();
        manager.update_bandwidth(&"sub".to_string(), bandwidth(200_000));
        manager.process(); // down to 0

        // 550 kbps: layer 1 fits outright but 500k > 0.85 * 550k
        manager.update_bandwidth(&"sub".to_string(), bandwidth(550_000));
        manager.process();
        manager.process();
        manager.process();
        assert_eq!(
            manager.current_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string()),
            Some(0)
        );
    }

    #[test]
    fn test_interrupted_headroom_restarts_the_count() {
        let manager = manager_with_sub();
        manager.update_bandwidth(&"sub".to_string(), bandwidth(200_000));
        manager.process();

        manager.update_bandwidth(&"sub".to_string(), bandwidth(700_000));
        manager.process(); // qualifying cycle 1

        manager.update_bandwidth(&"sub".to_string(), bandwidth(200_000));
        manager.process(); // headroom gone, count resets

        manager.update_bandwidth(&"sub".to_string(), bandwidth(700_000));
        manager.process(); // qualifying cycle 1 again
        assert_eq!(
            manager.current_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string()),
            Some(0)
        );
    }

    #[test]
    fn test_paused_subscription_is_not_adjusted() {
        let manager = manager_with_sub();
        manager
            .set_paused(&"sub".to_string(), &"pub".to_string(), &"cam".to_string(), true)
            .unwrap();
        manager.update_bandwidth(&"sub".to_string(), bandwidth(100_000));
        manager.process();
        assert_eq!(
            manager.current_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string()),
            Some(2)
        );
    }

    #[test]
    fn test_manual_target_layer_wins() {
        let manager = manager_with_sub();
        manager
            .set_target_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string(), 0)
            .unwrap();
        manager.update_bandwidth(&"sub".to_string(), bandwidth(10_000_000));
        manager.process();
        // Manual subscriptions keep their current layer untouched
        let layer = manager
            .current_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string())
            .unwrap();
        assert_eq!(layer, 2, "process does not touch manual subscriptions");
    }

    #[test]
    fn test_unknown_bandwidth_defaults_high() {
        let manager = manager_with_sub();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        manager.set_layer_switch_sink(Arc::new(
            move |_s: &ParticipantId, _p: &ParticipantId, _st: &StreamId, _o: i32, _n: i32| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
            },
        ));

        manager.process();
        assert_eq!(
            manager.current_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string()),
            Some(2)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0, "no switch event without change");
    }

    #[test]
    fn test_layer_table_must_be_monotone() {
        let manager = SubscriptionManager::new();
        let mut layers = three_layers();
        layers[2].bitrate_kbps = 100; // decreasing
        let err = manager
            .set_available_layers(&"pub".to_string(), &"cam".to_string(), layers)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidLayerTable(_)));
    }

    #[test]
    fn test_remove_participant_cascades() {
        let manager = manager_with_sub();
        manager.subscribe(&"other".to_string(), &"pub".to_string(), &"cam".to_string(), -1);
        assert_eq!(manager.subscription_count(), 2);

        manager.remove_participant(&"pub".to_string());
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn test_no_layers_fit_falls_to_zero() {
        let manager = manager_with_sub();
        manager.update_bandwidth(&"sub".to_string(), bandwidth(50_000));
        manager.process();
        assert_eq!(
            manager.current_layer(&"sub".to_string(), &"pub".to_string(), &"cam".to_string()),
            Some(0)
        );
    }
}
