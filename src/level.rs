//! Cascaded peak metering.
//!
//! A [`LevelMeter`] chains four [`PeakBuffer`] stages with window lengths of
//! 1/1000 s, 1/100 s, 1/5 s and 3 s. Each stage only computes its maximum
//! once per full window and hands it to the next stage, so per-sample cost
//! is a single ring-buffer store.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::format::SampleFormat;

/// A value published by a [`LevelMeter`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MeterEvent {
    /// Normalised level (0.0 to 1.0) over the last 1/5 s window.
    Level(f64),
    /// Normalised moving peak over the last 3 s.
    Peak(f64),
}

/// One peak-hold stage: a ring of the last `len` values.
///
/// A stage reports its peak through the return value of
/// [`set_level`](Self::set_level); [`LevelMeter`] chains four of them.
pub struct PeakBuffer {
    ring: Vec<f64>,
    index: usize,
    output_rate: f64,
}

impl PeakBuffer {
    /// Create a stage fed at `input_rate` values per second, holding a window
    /// of `window_secs` seconds.
    ///
    /// # Panics
    ///
    /// Panics if the window rounds to zero values.
    pub fn new(input_rate: f64, window_secs: f64) -> Self {
        Self::with_len((input_rate * window_secs).round() as usize, window_secs)
    }

    fn with_len(len: usize, window_secs: f64) -> Self {
        assert!(len > 0, "peak window of {}s holds no samples", window_secs);
        Self {
            ring: vec![0.0; len],
            index: 0,
            output_rate: 1.0 / window_secs,
        }
    }

    /// Rate at which this stage emits peaks (one per full window).
    #[inline]
    pub fn output_rate(&self) -> f64 {
        self.output_rate
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Store `level`, returning the window peak if this filled the ring.
    pub fn set_level(&mut self, level: f64) -> Option<f64> {
        self.ring[self.index] = level;
        self.index += 1;
        if self.index < self.ring.len() {
            return None;
        }

        self.index = 0;
        Some(self.peak())
    }

    /// Largest value currently held.
    pub fn peak(&self) -> f64 {
        self.ring.iter().copied().fold(0.0, f64::max)
    }
}

/// Short-term level and 3 second peak for one PCM stream.
pub struct LevelMeter {
    ceiling: f64,
    millis: PeakBuffer,
    centis: PeakBuffer,
    fifths: PeakBuffer,
    seconds: PeakBuffer,
    level: f64,
    peak: f64,
    subscribers: Vec<Box<dyn FnMut(MeterEvent) + Send>>,
}

impl LevelMeter {
    pub fn new(sample_format: SampleFormat, sample_rate: u32) -> Self {
        // at least one sample, so rates under 500 Hz still meter
        let first_len = ((sample_rate as f64) / 1000.0).round().max(1.0) as usize;
        let millis = PeakBuffer::with_len(first_len, 1.0 / 1000.0);
        let centis = PeakBuffer::new(millis.output_rate(), 1.0 / 100.0);
        let fifths = PeakBuffer::new(centis.output_rate(), 1.0 / 5.0);
        let seconds = PeakBuffer::new(fifths.output_rate(), 3.0);

        Self {
            ceiling: sample_format.clamp_max() as f64,
            millis,
            centis,
            fifths,
            seconds,
            level: 0.0,
            peak: 0.0,
            subscribers: Vec::new(),
        }
    }

    /// Feed one sample (any sign) in the stream's native scale.
    pub fn calc(&mut self, sample: i32) {
        let Some(p) = self.millis.set_level((sample as f64).abs()) else {
            return;
        };
        let Some(p) = self.centis.set_level(p) else {
            return;
        };
        let Some(p) = self.fifths.set_level(p) else {
            return;
        };

        self.level = p / self.ceiling;
        self.publish(MeterEvent::Level(self.level));

        // the 3 s window is re-read on every update to give a moving peak
        self.seconds.set_level(self.level);
        self.peak = self.seconds.peak();
        self.publish(MeterEvent::Peak(self.peak));
    }

    /// Latest normalised level.
    #[inline]
    pub fn level(&self) -> f64 {
        self.level
    }

    /// Latest normalised 3 second peak.
    #[inline]
    pub fn peak(&self) -> f64 {
        self.peak
    }

    /// Receive every [`MeterEvent`] this meter publishes.
    ///
    /// Subscribers run inline on the mixing thread; forward to a ring buffer
    /// or channel if the consumer lives elsewhere.
    pub fn subscribe(&mut self, f: impl FnMut(MeterEvent) + Send + 'static) {
        self.subscribers.push(Box::new(f));
    }

    fn publish(&mut self, event: MeterEvent) {
        for subscriber in self.subscribers.iter_mut() {
            subscriber(event);
        }
    }
}

impl core::fmt::Debug for LevelMeter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LevelMeter")
            .field("level", &self.level)
            .field("peak", &self.peak)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
