//! Configuration errors.

use thiserror::Error;

/// A rejected configuration value.
///
/// Mixer and input construction is permissive: each invalid field is replaced
/// by its default and reported through `tracing`. Use
/// [`MixerConfig::validate`](crate::MixerConfig::validate) or
/// [`AudioFormat::try_new`](crate::AudioFormat::try_new) to get these errors
/// instead.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum ConfigError {
    /// Only mono and stereo are supported.
    #[error("unsupported channel count {0}, expected 1 or 2")]
    Channels(u16),

    /// Only 8, 16, 24 and 32 bit signed PCM is supported.
    #[error("unsupported bit depth {0}, expected 8, 16, 24 or 32")]
    BitDepth(u16),

    /// Sample rate must be at least 1 Hz.
    #[error("sample rate must be positive, got {0}")]
    SampleRate(u32),

    /// Volume must be a finite, non-negative factor.
    #[error("volume must be a non-negative number, got {0}")]
    Volume(f64),

    /// Chunk sizes are counted in frames and must be non-zero.
    #[error("chunk size must be positive")]
    ChunkSize,
}
