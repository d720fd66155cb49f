//! PCM sample codec and stream format.
//!
//! All PCM handled by the mixer is signed, little-endian, interleaved integer
//! audio. [`SampleFormat`] reads and writes single samples at a byte offset;
//! [`AudioFormat`] describes a whole stream (channels, bit depth, rate).

use crate::error::ConfigError;

pub(crate) const DEFAULT_CHANNELS: u16 = 2;
pub(crate) const DEFAULT_BIT_DEPTH: u16 = 16;
pub(crate) const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Bit depth of a signed little-endian PCM sample.
///
/// Selected once per stream and then used to decode and encode every sample
/// in its buffers. 24-bit samples have no native machine word and are packed
/// by hand into 3 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SampleFormat {
    I8,
    I16,
    I24,
    I32,
}

impl SampleFormat {
    /// Look up the format for a bit depth, `None` if unsupported.
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            8 => Some(SampleFormat::I8),
            16 => Some(SampleFormat::I16),
            24 => Some(SampleFormat::I24),
            32 => Some(SampleFormat::I32),
            _ => None,
        }
    }

    #[inline]
    pub fn bits(self) -> u16 {
        match self {
            SampleFormat::I8 => 8,
            SampleFormat::I16 => 16,
            SampleFormat::I24 => 24,
            SampleFormat::I32 => 32,
        }
    }

    /// Bytes per sample.
    #[inline]
    pub fn byte_width(self) -> usize {
        self.bits() as usize / 8
    }

    /// Largest representable sample, `2^(bits-1) - 1`.
    #[inline]
    pub fn clamp_max(self) -> i32 {
        match self {
            SampleFormat::I8 => i8::MAX as i32,
            SampleFormat::I16 => i16::MAX as i32,
            SampleFormat::I24 => (1 << 23) - 1,
            SampleFormat::I32 => i32::MAX,
        }
    }

    /// Smallest representable sample, `-clamp_max - 1`.
    #[inline]
    pub fn clamp_min(self) -> i32 {
        -self.clamp_max() - 1
    }

    /// Saturate a wide intermediate value into this format's range.
    #[inline]
    pub fn clamp(self, value: i64) -> i32 {
        value.clamp(self.clamp_min() as i64, self.clamp_max() as i64) as i32
    }

    /// Read the sample starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the sample does not fit inside `buf`.
    #[inline]
    pub fn read(self, buf: &[u8], offset: usize) -> i32 {
        match self {
            SampleFormat::I8 => buf[offset] as i8 as i32,
            SampleFormat::I16 => i16::from_le_bytes([buf[offset], buf[offset + 1]]) as i32,
            SampleFormat::I24 => {
                let b = &buf[offset..offset + 3];
                // place the 3 bytes in the top of an i32, then shift back down to sign-extend
                i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8
            }
            SampleFormat::I32 => i32::from_le_bytes([
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            ]),
        }
    }

    /// Write `value` starting at `offset`.
    ///
    /// `value` is expected to already be inside `[clamp_min, clamp_max]`;
    /// out-of-range values are truncated to the low bytes.
    ///
    /// # Panics
    ///
    /// Panics if the sample does not fit inside `buf`.
    #[inline]
    pub fn write(self, buf: &mut [u8], offset: usize, value: i32) {
        match self {
            SampleFormat::I8 => buf[offset] = value as i8 as u8,
            SampleFormat::I16 => {
                buf[offset..offset + 2].copy_from_slice(&(value as i16).to_le_bytes())
            }
            SampleFormat::I24 => {
                let b = value.to_le_bytes();
                buf[offset..offset + 3].copy_from_slice(&b[..3]);
            }
            SampleFormat::I32 => buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes()),
        }
    }

    /// Convert a sample of this format to `target`'s bit depth.
    ///
    /// Widening shifts left, narrowing shifts right (arithmetic, so the sign
    /// is kept). Same-format conversion is the identity.
    #[inline]
    pub fn rescale(self, value: i32, target: SampleFormat) -> i32 {
        let from = self.bits() as i32;
        let to = target.bits() as i32;
        if to >= from {
            ((value as i64) << (to - from)) as i32
        } else {
            value >> (from - to)
        }
    }
}

impl Default for SampleFormat {
    fn default() -> Self {
        SampleFormat::I16
    }
}

/// Format of one PCM stream: channel count, sample format and sample rate.
///
/// Fixed for the lifetime of an input or mixer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AudioFormat {
    channels: u16,
    sample_format: SampleFormat,
    sample_rate: u32,
}

impl AudioFormat {
    /// Build a format, replacing every unsupported field with its default.
    ///
    /// Invalid channel counts fall back to stereo, unsupported bit depths to
    /// 16 bit and a zero sample rate to 44100 Hz. Each substitution is logged.
    pub fn new(channels: u16, bit_depth: u16, sample_rate: u32) -> Self {
        let channels = if matches!(channels, 1 | 2) {
            channels
        } else {
            tracing::warn!(channels, "unsupported channel count, using {}", DEFAULT_CHANNELS);
            DEFAULT_CHANNELS
        };

        let sample_format = SampleFormat::from_bits(bit_depth).unwrap_or_else(|| {
            tracing::warn!(bit_depth, "unsupported bit depth, using {}", DEFAULT_BIT_DEPTH);
            SampleFormat::default()
        });

        let sample_rate = if sample_rate > 0 {
            sample_rate
        } else {
            tracing::warn!("sample rate must be positive, using {}", DEFAULT_SAMPLE_RATE);
            DEFAULT_SAMPLE_RATE
        };

        Self {
            channels,
            sample_format,
            sample_rate,
        }
    }

    /// Build a format, rejecting the first unsupported field.
    pub fn try_new(channels: u16, bit_depth: u16, sample_rate: u32) -> Result<Self, ConfigError> {
        if !matches!(channels, 1 | 2) {
            return Err(ConfigError::Channels(channels));
        }
        let sample_format =
            SampleFormat::from_bits(bit_depth).ok_or(ConfigError::BitDepth(bit_depth))?;
        if sample_rate == 0 {
            return Err(ConfigError::SampleRate(sample_rate));
        }

        Ok(Self {
            channels,
            sample_format,
            sample_rate,
        })
    }

    #[inline]
    pub fn channels(&self) -> u16 {
        self.channels
    }

    #[inline]
    pub fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    #[inline]
    pub fn bit_depth(&self) -> u16 {
        self.sample_format.bits()
    }

    #[inline]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Bytes per single-channel sample.
    #[inline]
    pub fn sample_byte_len(&self) -> usize {
        self.sample_format.byte_width()
    }

    /// Bytes per frame (one sample for every channel).
    #[inline]
    pub fn frame_byte_len(&self) -> usize {
        self.sample_byte_len() * self.channels as usize
    }

    /// Whole frames contained in `bytes` bytes.
    #[inline]
    pub fn frames_in(&self, bytes: usize) -> usize {
        bytes / self.frame_byte_len()
    }

    #[inline]
    pub fn clamp_max(&self) -> i32 {
        self.sample_format.clamp_max()
    }

    #[inline]
    pub fn clamp_min(&self) -> i32 {
        self.sample_format.clamp_min()
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            channels: DEFAULT_CHANNELS,
            sample_format: SampleFormat::default(),
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}
