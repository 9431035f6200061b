//! Send-side rate adaptation driven by RTCP feedback.
//!
//! A deliberately small take on Google Congestion Control: loss-triggered
//! multiplicative decrease, a slow recovery phase, multiplicative probe
//! upward otherwise, always capped by the receiver's REMB.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Receives the chosen bitrate whenever it changes.
pub trait BitrateSink: Send + Sync {
    /// Called with the new target bitrate in bits per second.
    fn on_bitrate(&self, bitrate_bps: u64);
}

impl<F: Fn(u64) + Send + Sync> BitrateSink for F {
    fn on_bitrate(&self, bitrate_bps: u64) {
        self(bitrate_bps)
    }
}

/// Tunables for [`BitrateController`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitrateControllerConfig {
    /// Floor of the output range in bps
    pub min_bitrate_bps: u64,
    /// Ceiling of the output range in bps
    pub max_bitrate_bps: u64,
    /// Bitrate to assume before any feedback arrives
    pub start_bitrate_bps: u64,
    /// Loss fraction above which the rate is cut
    pub loss_threshold: f32,
    /// Multiplier applied on a loss-triggered decrease
    pub decrease_rate: f64,
    /// Multiplier applied during undisturbed increase
    pub increase_rate: f64,
    /// Milliseconds between rate updates
    pub update_interval_ms: u64,
}

impl Default for BitrateControllerConfig {
    fn default() -> Self {
        Self {
            min_bitrate_bps: 100_000,
            max_bitrate_bps: 5_000_000,
            start_bitrate_bps: 1_000_000,
            loss_threshold: 0.02,
            decrease_rate: 0.85,
            increase_rate: 1.08,
            update_interval_ms: 25,
        }
    }
}

/// Snapshot of the controller's view of the link.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BitrateEstimate {
    /// The controller's current output in bps
    pub estimated_bitrate_bps: u64,
    /// Latest REMB target in bps
    pub target_bitrate_bps: u64,
    /// Latest loss fraction
    pub packet_loss: f32,
    /// Latest round-trip time in milliseconds
    pub rtt_ms: f32,
    /// True while recovering from a loss episode
    pub is_overusing: bool,
    /// True when well below the REMB target
    pub is_underusing: bool,
}

/// Loss- and REMB-driven bitrate controller.
pub struct BitrateController {
    config: BitrateControllerConfig,
    sink: Option<Box<dyn BitrateSink>>,

    current_bitrate: u64,
    remb_target: u64,
    current_loss: f32,
    current_rtt_ms: f32,
    overusing: bool,
    last_update: Instant,
}

impl BitrateController {
    /// Create a controller starting at `config.start_bitrate_bps`.
    pub fn new(config: BitrateControllerConfig) -> Self {
        let start = config
            .start_bitrate_bps
            .clamp(config.min_bitrate_bps, config.max_bitrate_bps);
        Self {
            current_bitrate: start,
            remb_target: config.max_bitrate_bps,
            current_loss: 0.0,
            current_rtt_ms: 0.0,
            overusing: false,
            last_update: Instant::now(),
            sink: None,
            config,
        }
    }

    /// Install the sink notified on every rate change.
    pub fn set_sink(&mut self, sink: impl BitrateSink + 'static) {
        self.sink = Some(Box::new(sink));
    }

    /// Feed a REMB target from the receiver.
    pub fn on_remb(&mut self, bitrate_bps: u64) {
        self.remb_target = bitrate_bps;
        self.update_bitrate();
    }

    /// Feed the latest loss fraction (0.0..=1.0).
    pub fn on_packet_loss(&mut self, loss: f32) {
        self.current_loss = loss.clamp(0.0, 1.0);
    }

    /// Feed the latest RTT sample.
    pub fn on_rtt(&mut self, rtt_ms: f32) {
        self.current_rtt_ms = rtt_ms;
    }

    /// Run one adaptation step if the update interval has elapsed.
    pub fn process(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_update).as_millis() as u64 >= self.config.update_interval_ms
        {
            self.update_bitrate();
            self.last_update = now;
        }
    }

    /// Current output bitrate in bps.
    pub fn target_bitrate(&self) -> u64 {
        self.current_bitrate
    }

    /// Force the bitrate (clamped); used when a session restarts.
    pub fn set_bitrate(&mut self, bitrate_bps: u64) {
        self.current_bitrate =
            bitrate_bps.clamp(self.config.min_bitrate_bps, self.config.max_bitrate_bps);
    }

    /// Current link snapshot.
    pub fn estimate(&self) -> BitrateEstimate {
        BitrateEstimate {
            estimated_bitrate_bps: self.current_bitrate,
            target_bitrate_bps: self.remb_target,
            packet_loss: self.current_loss,
            rtt_ms: self.current_rtt_ms,
            is_overusing: self.overusing,
            is_underusing: (self.current_bitrate as f64) < self.remb_target as f64 * 0.8,
        }
    }

    fn update_bitrate(&mut self) {
        let mut new_bitrate = self.current_bitrate as f64;

        if self.current_loss > self.config.loss_threshold {
            new_bitrate *= self.config.decrease_rate;
            self.overusing = true;
        } else if self.overusing {
            // Recovery phase, climb gently until loss fully clears
            new_bitrate *= 1.02;
            if self.current_loss < 0.005 {
                self.overusing = false;
            }
        } else {
            new_bitrate *= self.config.increase_rate;
        }

        let mut clamped = (new_bitrate as u64)
            .clamp(self.config.min_bitrate_bps, self.config.max_bitrate_bps);
        clamped = clamped.min(self.remb_target.max(self.config.min_bitrate_bps));

        if clamped != self.current_bitrate {
            debug!(
                from = self.current_bitrate,
                to = clamped,
                loss = self.current_loss,
                "bitrate updated"
            );
            self.current_bitrate = clamped;
            if let Some(sink) = &self.sink {
                sink.on_bitrate(clamped);
            }
        }
    }
}

/// One simulcast encoding of a video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulcastLayer {
    /// Layer index, 0 = lowest quality
    pub layer_index: i32,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frames per second
    pub fps: u32,
    /// Encoded bitrate in kbps
    pub bitrate_kbps: u32,
    /// Whether the publisher is currently sending this layer
    pub active: bool,
}

impl SimulcastLayer {
    /// Standard three-layer ladder for a source of `width`x`height` at
    /// `max_bitrate_kbps` total: full, half and quarter resolution.
    pub fn default_layers(width: u32, height: u32, max_bitrate_kbps: u32) -> Vec<SimulcastLayer> {
        vec![
            SimulcastLayer {
                layer_index: 0,
                width: width / 4,
                height: height / 4,
                fps: 15,
                bitrate_kbps: max_bitrate_kbps * 10 / 100,
                active: true,
            },
            SimulcastLayer {
                layer_index: 1,
                width: width / 2,
                height: height / 2,
                fps: 30,
                bitrate_kbps: max_bitrate_kbps * 30 / 100,
                active: true,
            },
            SimulcastLayer {
                layer_index: 2,
                width,
                height,
                fps: 30,
                bitrate_kbps: max_bitrate_kbps * 60 / 100,
                active: true,
            },
        ]
    }

    /// Greedily pick the layers that fit `available_kbps`, lowest first,
    /// always keeping at least the lowest layer.
    pub fn select_active_layers(
        layers: &[SimulcastLayer],
        available_kbps: u32,
    ) -> Vec<SimulcastLayer> {
        let mut selected = Vec::new();
        let mut remaining = available_kbps;

        let mut ordered: Vec<&SimulcastLayer> = layers.iter().collect();
        ordered.sort_by_key(|l| l.bitrate_kbps);

        for layer in ordered {
            if layer.bitrate_kbps <= remaining {
                selected.push(*layer);
                remaining -= layer.bitrate_kbps;
            }
        }

        if selected.is_empty() {
            if let Some(lowest) = layers.iter().min_by_key(|l| l.bitrate_kbps) {
                selected.push(*lowest);
            }
        }

        selected
    }
}
