//! MCU audio path: N-way mix-minus-self with active-speaker detection.
//!
//! Each tick mixes every non-muted source with fresh data into a 32-bit
//! accumulator per recipient, excluding the recipient's own audio, then
//! saturates to i16. The lock is held for the whole tick; sources feed
//! their PCM in between ticks.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use confero_media_core::ParticipantId;
use confero_rtp_core::RtpTimestamp;

use crate::types::{ActiveSpeakerSink, MixedAudioSink};

/// Level below which a source is considered silent.
const SILENCE_FLOOR_DBFS: f32 = -96.0;

/// Minimum level a source needs to become the active speaker.
const ACTIVE_SPEAKER_THRESHOLD_DBFS: f32 = -40.0;

/// Mixer format configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioMixerConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// 1 (mono) or 2 (stereo, interleaved)
    pub channels: u32,
    /// Tick length in milliseconds
    pub frame_duration_ms: u32,
}

impl Default for AudioMixerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 1,
            frame_duration_ms: 20,
        }
    }
}

impl AudioMixerConfig {
    /// Samples per tick, channels included.
    pub fn frame_size(&self) -> usize {
        (self.sample_rate * self.frame_duration_ms / 1000 * self.channels) as usize
    }
}

/// Per-source gain, pan and mute.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MixingParams {
    /// Linear gain in [0, 2]
    pub volume: f32,
    /// Stereo position in [-1, 1]; ignored for mono output
    pub pan: f32,
    /// Muted sources contribute nothing and cannot be active speaker
    pub muted: bool,
}

impl Default for MixingParams {
    fn default() -> Self {
        Self {
            volume: 1.0,
            pan: 0.0,
            muted: false,
        }
    }
}

/// Mixer counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AudioMixerStats {
    /// Ticks that produced output
    pub mixed_frames: u64,
    /// Sources currently registered
    pub active_sources: usize,
}

struct AudioSource {
    params: MixingParams,
    buffer: Vec<i16>,
    last_timestamp: RtpTimestamp,
    level_dbfs: f32,
    has_data: bool,
}

struct MixerState {
    sources: HashMap<ParticipantId, AudioSource>,
    active_speaker: Option<ParticipantId>,
    mixed_sink: Option<Arc<dyn MixedAudioSink>>,
    speaker_sink: Option<Arc<dyn ActiveSpeakerSink>>,
    mix_buffer: Vec<i32>,
    output_buffer: Vec<i16>,
    stats: AudioMixerStats,
}

/// Mix-minus-self audio mixer.
pub struct AudioMixer {
    config: AudioMixerConfig,
    state: Mutex<MixerState>,
}

impl AudioMixer {
    /// Create a mixer for the given format.
    pub fn new(config: AudioMixerConfig) -> Self {
        let frame_size = config.frame_size();
        Self {
            config,
            state: Mutex::new(MixerState {
                sources: HashMap::new(),
                active_speaker: None,
                mixed_sink: None,
                speaker_sink: None,
                mix_buffer: vec![0; frame_size],
                output_buffer: vec![0; frame_size],
                stats: AudioMixerStats::default(),
            }),
        }
    }

    /// Install the per-recipient output sink.
    pub fn set_mixed_audio_sink(&self, sink: Arc<dyn MixedAudioSink>) {
        self.state.lock().mixed_sink = Some(sink);
    }

    /// Install the active-speaker transition sink.
    pub fn set_active_speaker_sink(&self, sink: Arc<dyn ActiveSpeakerSink>) {
        self.state.lock().speaker_sink = Some(sink);
    }

    /// Register a participant as an audio source and mix recipient.
    pub fn add_source(&self, participant_id: &ParticipantId, params: MixingParams) {
        let frame_size = self.config.frame_size();
        let mut state = self.state.lock();
        state.sources.insert(
            participant_id.clone(),
            AudioSource {
                params,
                buffer: vec![0; frame_size],
                last_timestamp: 0,
                level_dbfs: SILENCE_FLOOR_DBFS,
                has_data: false,
            },
        );
        state.stats.active_sources = state.sources.len();
        debug!(participant = %participant_id, "audio source added");
    }

    /// Remove a participant.
    pub fn remove_source(&self, participant_id: &ParticipantId) {
        let mut state = self.state.lock();
        state.sources.remove(participant_id);
        state.stats.active_sources = state.sources.len();
        if state.active_speaker.as_ref() == Some(participant_id) {
            state.active_speaker = None;
        }
    }

    /// Update a source's gain/pan/mute.
    pub fn set_mixing_params(&self, participant_id: &ParticipantId, params: MixingParams) {
        let mut state = self.state.lock();
        if let Some(source) = state.sources.get_mut(participant_id) {
            source.params = MixingParams {
                volume: params.volume.clamp(0.0, 2.0),
                pan: params.pan.clamp(-1.0, 1.0),
                muted: params.muted,
            };
        }
    }

    /// Feed one frame of PCM from a participant. Longer input is
    /// truncated to the frame size; shorter input zero-pads the tail.
    pub fn push_audio(
        &self,
        participant_id: &ParticipantId,
        samples: &[i16],
        timestamp: RtpTimestamp,
    ) {
        let mut state = self.state.lock();
        let Some(source) = state.sources.get_mut(participant_id) else {
            trace!(participant = %participant_id, "audio for unknown source");
            return;
        };

        let copy_len = samples.len().min(source.buffer.len());
        source.buffer[..copy_len].copy_from_slice(&samples[..copy_len]);
        source.buffer[copy_len..].fill(0);

        source.level_dbfs = level_dbfs(&source.buffer);
        source.last_timestamp = timestamp;
        source.has_data = true;
    }

    /// One mixer tick: update the active speaker, emit one mix per
    /// recipient, clear all `has_data` flags.
    pub fn process(&self) {
        let mut state = self.state.lock();
        if state.sources.is_empty() {
            return;
        }

        self.update_active_speaker(&mut state);

        let mixed_sink = state.mixed_sink.clone();
        let recipients: Vec<ParticipantId> = state.sources.keys().cloned().collect();
        let channels = self.config.channels;

        for recipient in &recipients {
            let state = &mut *state;
            state.mix_buffer.fill(0);

            for (source_id, source) in &state.sources {
                if source_id == recipient || !source.has_data || source.params.muted {
                    continue;
                }

                if channels == 1 {
                    let volume = source.params.volume;
                    for (acc, &sample) in
                        state.mix_buffer.iter_mut().zip(source.buffer.iter())
                    {
                        *acc += (sample as f32 * volume) as i32;
                    }
                } else {
                    // Constant-power pan: left fills even indices, right odd
                    let volume = source.params.volume;
                    let pan = source.params.pan;
                    let left_gain = volume * ((1.0 - pan) / 2.0).sqrt();
                    let right_gain = volume * ((1.0 + pan) / 2.0).sqrt();
                    for frame in 0..state.mix_buffer.len() / 2 {
                        let left = source.buffer[frame * 2];
                        let right = source.buffer[frame * 2 + 1];
                        state.mix_buffer[frame * 2] += (left as f32 * left_gain) as i32;
                        state.mix_buffer[frame * 2 + 1] += (right as f32 * right_gain) as i32;
                    }
                }
            }

            for (out, &acc) in state
                .output_buffer
                .iter_mut()
                .zip(state.mix_buffer.iter())
            {
                *out = acc.clamp(i16::MIN as i32, i16::MAX as i32) as i16;
            }

            if let Some(sink) = &mixed_sink {
                let timestamp = state
                    .sources
                    .get(recipient)
                    .map(|s| s.last_timestamp)
                    .unwrap_or(0);
                sink.on_mixed_audio(recipient, &state.output_buffer, timestamp);
            }
        }

        state.stats.mixed_frames += 1;
        for source in state.sources.values_mut() {
            source.has_data = false;
        }
    }

    fn update_active_speaker(&self, state: &mut MixerState) {
        let mut highest_level = SILENCE_FLOOR_DBFS;
        let mut loudest: Option<ParticipantId> = None;

        for (id, source) in &state.sources {
            if source.params.muted {
                continue;
            }
            if source.level_dbfs > highest_level {
                highest_level = source.level_dbfs;
                loudest = Some(id.clone());
            }
        }

        if highest_level > ACTIVE_SPEAKER_THRESHOLD_DBFS && loudest != state.active_speaker {
            state.active_speaker = loudest.clone();
            if let (Some(sink), Some(speaker)) = (&state.speaker_sink, &loudest) {
                debug!(speaker = %speaker, level = highest_level, "active speaker changed");
                sink.on_active_speaker(speaker, highest_level);
            }
        }
    }

    /// Current active speaker, if any.
    pub fn active_speaker(&self) -> Option<ParticipantId> {
        self.state.lock().active_speaker.clone()
    }

    /// Instantaneous level of one source in dBFS.
    pub fn source_level(&self, participant_id: &ParticipantId) -> Option<f32> {
        self.state
            .lock()
            .sources
            .get(participant_id)
            .map(|s| s.level_dbfs)
    }

    /// Number of registered sources.
    pub fn source_count(&self) -> usize {
        self.state.lock().sources.len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> AudioMixerStats {
        self.state.lock().stats
    }
}

/// RMS level of a PCM frame in dBFS, floored at -96.
fn level_dbfs(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return SILENCE_FLOOR_DBFS;
    }
    let sum_squares: i64 = samples.iter().map(|&s| s as i64 * s as i64).sum();
    let rms = ((sum_squares as f64) / samples.len() as f64).sqrt();
    if rms < 1.0 {
        return SILENCE_FLOOR_DBFS;
    }
    (20.0 * (rms / 32768.0).log10()) as f32
}
