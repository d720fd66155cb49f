//! Mixer and input configuration.
//!
//! Both configs are plain builders. Invalid values are not rejected at
//! construction: the mixer replaces each one with its default and logs a
//! warning. Call `validate()` first if you would rather fail.

use alloc::vec::Vec;

use crate::error::ConfigError;
use crate::format::{AudioFormat, SampleFormat, DEFAULT_BIT_DEPTH, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};

/// Default number of frames the mixer emits per pass, at most.
pub const DEFAULT_CHUNK_SIZE: usize = 131072;

/// Default input chunk in frames. An input's queue asserts backpressure
/// above two chunks and holds at most four.
pub const DEFAULT_INPUT_CHUNK_SIZE: usize = 16384;

/// Settings for a [`Mixer`](crate::Mixer).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MixerConfig {
    /// Output channels, 1 or 2.
    pub channels: u16,
    /// Output bit depth: 8, 16, 24 or 32.
    pub bit_depth: u16,
    /// Nominal output sample rate in Hz.
    pub sample_rate: u32,
    /// Largest number of frames produced per pass.
    pub chunk_size: usize,
    /// Default queue sizing for inputs, in frames.
    pub input_chunk_size: usize,
    /// Master volume applied to every input's contribution.
    pub volume: f64,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNELS,
            bit_depth: DEFAULT_BIT_DEPTH,
            sample_rate: DEFAULT_SAMPLE_RATE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            input_chunk_size: DEFAULT_INPUT_CHUNK_SIZE,
            volume: 1.0,
        }
    }
}

impl MixerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_bit_depth(mut self, bit_depth: u16) -> Self {
        self.bit_depth = bit_depth;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_chunk_size(mut self, frames: usize) -> Self {
        self.chunk_size = frames;
        self
    }

    pub fn with_input_chunk_size(mut self, frames: usize) -> Self {
        self.input_chunk_size = frames;
        self
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }

    /// Every problem with this config, empty if it is usable as-is.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if !matches!(self.channels, 1 | 2) {
            errors.push(ConfigError::Channels(self.channels));
        }
        if SampleFormat::from_bits(self.bit_depth).is_none() {
            errors.push(ConfigError::BitDepth(self.bit_depth));
        }
        if self.sample_rate == 0 {
            errors.push(ConfigError::SampleRate(self.sample_rate));
        }
        if self.chunk_size == 0 || self.input_chunk_size == 0 {
            errors.push(ConfigError::ChunkSize);
        }
        if !valid_volume(self.volume) {
            errors.push(ConfigError::Volume(self.volume));
        }
        errors
    }

    pub(crate) fn format(&self) -> AudioFormat {
        AudioFormat::new(self.channels, self.bit_depth, self.sample_rate)
    }

    pub(crate) fn resolved_chunk_size(&self) -> usize {
        resolve_chunk(self.chunk_size, DEFAULT_CHUNK_SIZE)
    }

    pub(crate) fn resolved_input_chunk_size(&self) -> usize {
        resolve_chunk(self.input_chunk_size, DEFAULT_INPUT_CHUNK_SIZE)
    }

    pub(crate) fn resolved_volume(&self) -> f64 {
        resolve_volume(self.volume)
    }
}

/// Settings for one mixer input.
///
/// Unset format fields inherit the mixer's. Inputs may differ from the mixer
/// in channels, bit depth and sample rate; channel count and bit depth are
/// converted while mixing, sample rate is only used for drift control and
/// metering (no resampling happens).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct InputConfig {
    pub channels: Option<u16>,
    pub bit_depth: Option<u16>,
    pub sample_rate: Option<u32>,
    /// Queue sizing in frames, inherits the mixer's input chunk size.
    pub chunk_size: Option<usize>,
    pub volume: f64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            channels: None,
            bit_depth: None,
            sample_rate: None,
            chunk_size: None,
            volume: 1.0,
        }
    }
}

impl InputConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_bit_depth(mut self, bit_depth: u16) -> Self {
        self.bit_depth = Some(bit_depth);
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    pub fn with_chunk_size(mut self, frames: usize) -> Self {
        self.chunk_size = Some(frames);
        self
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = volume;
        self
    }

    /// Every problem with this config, empty if it is usable as-is.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if let Some(channels) = self.channels.filter(|c| !matches!(c, 1 | 2)) {
            errors.push(ConfigError::Channels(channels));
        }
        if let Some(bits) = self.bit_depth.filter(|b| SampleFormat::from_bits(*b).is_none()) {
            errors.push(ConfigError::BitDepth(bits));
        }
        if self.sample_rate == Some(0) {
            errors.push(ConfigError::SampleRate(0));
        }
        if self.chunk_size == Some(0) {
            errors.push(ConfigError::ChunkSize);
        }
        if !valid_volume(self.volume) {
            errors.push(ConfigError::Volume(self.volume));
        }
        errors
    }

    pub(crate) fn format(&self, mixer: &AudioFormat) -> AudioFormat {
        AudioFormat::new(
            self.channels.unwrap_or(mixer.channels()),
            self.bit_depth.unwrap_or(mixer.bit_depth()),
            self.sample_rate.unwrap_or(mixer.sample_rate()),
        )
    }

    pub(crate) fn resolved_chunk_size(&self, mixer_default: usize) -> usize {
        self.chunk_size
            .map_or(mixer_default, |c| resolve_chunk(c, mixer_default))
    }

    pub(crate) fn resolved_volume(&self) -> f64 {
        resolve_volume(self.volume)
    }
}

fn valid_volume(volume: f64) -> bool {
    volume.is_finite() && volume >= 0.0
}

pub(crate) fn resolve_volume(volume: f64) -> f64 {
    if valid_volume(volume) {
        volume
    } else {
        tracing::warn!(volume, "invalid volume, using 1.0");
        1.0
    }
}

fn resolve_chunk(frames: usize, default: usize) -> usize {
    if frames > 0 {
        frames
    } else {
        tracing::warn!("chunk size must be positive, using {}", default);
        default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = MixerConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.format(), AudioFormat::default());
        assert_eq!(config.resolved_chunk_size(), 131072);
    }

    #[test]
    fn validate_collects_every_error() {
        let config = MixerConfig::new()
            .with_channels(4)
            .with_bit_depth(12)
            .with_sample_rate(0)
            .with_chunk_size(0)
            .with_volume(-1.0);

        assert_eq!(
            config.validate(),
            vec![
                ConfigError::Channels(4),
                ConfigError::BitDepth(12),
                ConfigError::SampleRate(0),
                ConfigError::ChunkSize,
                ConfigError::Volume(-1.0),
            ]
        );
        assert_eq!(config.resolved_volume(), 1.0);
        assert_eq!(config.resolved_chunk_size(), DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn input_inherits_mixer_format() {
        let mixer = AudioFormat::new(2, 24, 48000);
        let format = InputConfig::new().with_channels(1).format(&mixer);
        assert_eq!(format.channels(), 1);
        assert_eq!(format.bit_depth(), 24);
        assert_eq!(format.sample_rate(), 48000);

        assert_eq!(InputConfig::new().resolved_chunk_size(512), 512);
        assert_eq!(InputConfig::new().with_chunk_size(0).resolved_chunk_size(512), 512);
    }
}
