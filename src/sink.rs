//! Destinations for mixed PCM.
//!
//! [`Mixer::process`](crate::Mixer::process) hands every produced chunk to a
//! [`PcmSink`]. Plain closures work, and [`RtrbSink`] forwards the bytes
//! through a ring buffer to another thread (a device callback, a recorder).

use rtrb::Producer;

use crate::format::AudioFormat;

/// Receives frame-aligned PCM in the mixer's output format.
pub trait PcmSink: Send {
    fn write_pcm(&mut self, pcm: &[u8]);
}

impl<F> PcmSink for F
where
    F: FnMut(&[u8]) + Send,
{
    fn write_pcm(&mut self, pcm: &[u8]) {
        self(pcm)
    }
}

/// A sink that pushes PCM bytes into an rtrb ring buffer.
///
/// Only whole frames are pushed. Frames that do not fit are dropped and
/// counted instead of blocking the mixing thread.
pub struct RtrbSink {
    producer: Producer<u8>,
    frame_len: usize,
    overruns: u64,
}

impl RtrbSink {
    /// Create a sink writing frames of `format` to the given producer.
    pub fn new(producer: Producer<u8>, format: AudioFormat) -> Self {
        Self {
            producer,
            frame_len: format.frame_byte_len(),
            overruns: 0,
        }
    }

    /// Whole frames that can be pushed right now.
    #[inline]
    pub fn available(&self) -> usize {
        self.producer.slots() / self.frame_len
    }

    /// Frames dropped so far because the ring buffer was full.
    #[inline]
    pub fn overrun_frames(&self) -> u64 {
        self.overruns
    }
}

impl PcmSink for RtrbSink {
    fn write_pcm(&mut self, pcm: &[u8]) {
        let frames = pcm.len() / self.frame_len;
        let fit = frames.min(self.available());

        if fit > 0 {
            if let Ok(mut chunk) = self.producer.write_chunk(fit * self.frame_len) {
                let (first, second) = chunk.as_mut_slices();
                let mid = first.len();
                first.copy_from_slice(&pcm[..mid]);
                second.copy_from_slice(&pcm[mid..mid + second.len()]);
                chunk.commit_all();
            }
        }

        if fit < frames {
            let dropped = (frames - fit) as u64;
            self.overruns += dropped;
            tracing::warn!(dropped, total = self.overruns, "output ring buffer full, frames dropped");
        }
    }
}
