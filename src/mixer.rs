//! The mixing engine.
//!
//! A [`Mixer`] owns the mixer side of every input. Each call to
//! [`pull`](Mixer::pull) runs one production pass:
//!
//! 1. drop finished inputs, apply input messages, re-evaluate liveness
//! 2. find the slowest live input and steer every input's queue toward it
//! 3. read the same number of frames from every live input and sum them
//! 4. duplicate the occasional output frame if the consumer pulls faster
//!    than the nominal rate
//!
//! Nothing blocks. When no live input has data the pass reports
//! [`Pull::Starved`] with the delay after which trying again makes sense.

use alloc::boxed::Box;
use alloc::vec::Vec;
use std::time::{Duration, Instant};

use crate::config::{resolve_volume, InputConfig, MixerConfig};
use crate::control::{Dampener, PiController, RateEstimator};
use crate::format::AudioFormat;
use crate::input::{InputChannel, InputId, InputWriter};
use crate::level::LevelMeter;
use crate::sink::PcmSink;

/// How long to wait before retrying a pass that found nothing to mix.
pub const STARVATION_RETRY: Duration = Duration::from_millis(20);

/// Floor for the shared buffer set point, in frames.
const MIN_WORKING_SAMPLES: usize = 1024;
const SET_POINT_DAMP_SECS: f64 = 1.0;

// output rate controller tuning
const RATE_DAMP_SECS: f64 = 5.0;
const RATE_P: f64 = 0.1;
const RATE_I: f64 = 0.01;

/// Result of one production pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pull {
    /// Mixed, frame-aligned PCM in the mixer's output format.
    Chunk(Vec<u8>),
    /// No live input had data. Try again after `retry_after`.
    Starved { retry_after: Duration },
    /// The mixer is stopped.
    Stopped,
}

/// Result of [`Mixer::process`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// This many frames were handed to the output.
    Produced(usize),
    Starved { retry_after: Duration },
    Stopped,
}

/// Mixes any number of independently clocked PCM inputs into one stream.
///
/// ```no_run
/// use driftmix::{InputConfig, Mixer, MixerConfig, Pull};
///
/// let mut mixer = Mixer::new(MixerConfig::default());
/// let mut input = mixer.add_input(InputConfig::new().with_channels(1));
/// mixer.start();
///
/// input.write(&[0u8; 4096]);
/// if let Pull::Chunk(pcm) = mixer.pull() {
///     // hand `pcm` to a device
/// }
/// ```
pub struct Mixer {
    format: AudioFormat,
    chunk_size: usize,
    input_chunk_size: usize,
    volume: f64,

    inputs: Vec<InputChannel>,
    next_id: u32,
    epoch: Instant,
    running: bool,

    set_point: Dampener,
    rate: RateEstimator,
    rate_controller: PiController,
    insert_interval: Option<usize>,
    /// Frames still to emit before the next one is duplicated.
    insert_counter: usize,
    inserted: u64,
    last_emitted: usize,

    meter: LevelMeter,
    mix: Vec<i64>,
    output: Option<Box<dyn PcmSink>>,
}

impl Mixer {
    /// Create a stopped mixer. Invalid config values are replaced by their
    /// defaults with a warning.
    pub fn new(config: MixerConfig) -> Self {
        let format = config.format();
        let sample_rate = format.sample_rate() as f64;

        let rate_controller = PiController::new(RATE_P, RATE_I)
            .with_set_point(sample_rate)
            .with_output_limits(0.0, sample_rate / 10.0);

        Self {
            format,
            chunk_size: config.resolved_chunk_size(),
            input_chunk_size: config.resolved_input_chunk_size(),
            volume: config.resolved_volume(),
            inputs: Vec::new(),
            next_id: 0,
            epoch: Instant::now(),
            running: false,
            set_point: Dampener::new(SET_POINT_DAMP_SECS),
            rate: RateEstimator::new(sample_rate, RATE_DAMP_SECS),
            rate_controller,
            insert_interval: None,
            insert_counter: 0,
            inserted: 0,
            last_emitted: 0,
            meter: LevelMeter::new(format.sample_format(), format.sample_rate()),
            mix: Vec::new(),
            output: None,
        }
    }

    /// Send every chunk produced by [`process`](Self::process) to `sink`.
    pub fn with_output<S: PcmSink + 'static>(mut self, sink: S) -> Self {
        self.output = Some(Box::new(sink));
        self
    }

    /// Output format.
    #[inline]
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Register a new input and return its writing half.
    ///
    /// The input joins the mix once it has been written to.
    pub fn add_input(&mut self, config: InputConfig) -> InputWriter {
        let id = InputId(self.next_id);
        self.next_id += 1;

        let format = config.format(&self.format);
        let chunk = config.resolved_chunk_size(self.input_chunk_size);
        let (channel, writer) =
            InputChannel::new(id, format, config.resolved_volume(), chunk, self.epoch);
        self.inputs.push(channel);

        tracing::debug!(
            input = id.0,
            channels = format.channels(),
            bit_depth = format.bit_depth(),
            sample_rate = format.sample_rate(),
            "input added"
        );
        writer
    }

    /// Unregister an input. Returns `false` if it was already gone.
    pub fn remove_input(&mut self, id: InputId) -> bool {
        match self.inputs.iter().position(|i| i.id() == id) {
            Some(index) => {
                self.inputs.remove(index);
                tracing::debug!(input = id.0, "input removed");
                true
            }
            None => false,
        }
    }

    pub fn input(&self, id: InputId) -> Option<&InputChannel> {
        self.inputs.iter().find(|i| i.id() == id)
    }

    pub fn input_mut(&mut self, id: InputId) -> Option<&mut InputChannel> {
        self.inputs.iter_mut().find(|i| i.id() == id)
    }

    /// Registered inputs in registration order.
    pub fn inputs(&self) -> impl Iterator<Item = &InputChannel> {
        self.inputs.iter()
    }

    #[inline]
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Start producing. Calling it on a running mixer does nothing.
    pub fn start(&mut self) {
        if !self.running {
            self.running = true;
            tracing::debug!("mixer started");
        }
    }

    /// Stop producing. Calling it on a stopped mixer does nothing.
    pub fn stop(&mut self) {
        if self.running {
            self.running = false;
            tracing::debug!("mixer stopped");
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[inline]
    pub fn volume(&self) -> f64 {
        self.volume
    }

    /// Set the master volume applied on top of each input's volume.
    pub fn set_volume(&mut self, volume: f64) {
        self.volume = resolve_volume(volume);
    }

    /// Meter fed with every output sample.
    #[inline]
    pub fn meter(&self) -> &LevelMeter {
        &self.meter
    }

    #[inline]
    pub fn meter_mut(&mut self) -> &mut LevelMeter {
        &mut self.meter
    }

    /// Current frame duplication schedule, `None` while none are inserted.
    #[inline]
    pub fn insert_interval(&self) -> Option<usize> {
        self.insert_interval
    }

    /// Total frames duplicated by output rate correction so far.
    #[inline]
    pub fn inserted_frames(&self) -> u64 {
        self.inserted
    }

    /// Smoothed rate at which output frames are being pulled.
    #[inline]
    pub fn estimated_rate(&self) -> f64 {
        self.rate.rate()
    }

    /// Run one production pass and hand the chunk to the configured output.
    ///
    /// Without an output the chunk is discarded.
    pub fn process(&mut self) -> Status {
        self.process_at(Instant::now())
    }

    pub fn process_at(&mut self, now: Instant) -> Status {
        match self.pull_at(now) {
            Pull::Chunk(pcm) => {
                if let Some(output) = self.output.as_mut() {
                    output.write_pcm(&pcm);
                }
                Status::Produced(self.format.frames_in(pcm.len()))
            }
            Pull::Starved { retry_after } => Status::Starved { retry_after },
            Pull::Stopped => Status::Stopped,
        }
    }

    /// Run one production pass and return the mixed PCM.
    pub fn pull(&mut self) -> Pull {
        self.pull_at(Instant::now())
    }

    /// Like [`pull`](Self::pull), evaluating timers and controllers at `now`.
    pub fn pull_at(&mut self, now: Instant) -> Pull {
        if !self.running {
            return Pull::Stopped;
        }

        self.inputs.retain(|input| {
            let finished = input.is_finished();
            if finished {
                tracing::debug!(input = input.id().0, "finished input pruned");
            }
            !finished
        });
        for input in self.inputs.iter_mut() {
            input.update(now);
        }

        let live: Vec<usize> = (0..self.inputs.len())
            .filter(|&i| self.inputs[i].is_alive())
            .collect();
        let Some(min_available) = live
            .iter()
            .map(|&i| self.inputs[i].available_samples_after_drop())
            .min()
        else {
            tracing::trace!("no live inputs");
            return self.starved();
        };

        // couple every queue to the slowest one
        self.set_point
            .feed_at(min_available.max(MIN_WORKING_SAMPLES) as f64, now);
        if let Some(set_point) = self.set_point.output() {
            for &i in live.iter() {
                self.inputs[i].set_buffer_set_point(set_point);
            }
        }

        let samples = min_available.min(self.chunk_size);
        if samples == 0 {
            tracing::trace!(live = live.len(), "live inputs are empty");
            return self.starved();
        }

        self.rate.feed_at(self.last_emitted, now);
        self.rate_controller.set_process_variable(self.rate.rate());
        let cv = self.rate_controller.output_at(now);
        self.set_insert_rate(cv);

        self.mix_inputs(&live, samples, now);
        let pcm = self.encode();

        let emitted = self.format.frames_in(pcm.len());
        self.last_emitted = emitted;
        tracing::trace!(
            live = live.len(),
            samples,
            emitted,
            rate = self.rate.rate(),
            cv,
            "mixed chunk"
        );

        Pull::Chunk(pcm)
    }

    fn starved(&self) -> Pull {
        Pull::Starved {
            retry_after: STARVATION_RETRY,
        }
    }

    /// Sum `samples` frames from every live input into the mix buffer.
    fn mix_inputs(&mut self, live: &[usize], samples: usize, now: Instant) {
        let out_format = self.format.sample_format();
        let channels = self.format.channels();
        let live_count = live.len() as f64;

        self.mix.clear();
        self.mix.resize(samples * channels as usize, 0);

        for &i in live {
            let input = &mut self.inputs[i];
            let in_format = input.format().sample_format();
            let width = in_format.byte_width();
            let volume = input.volume();

            let pcm = input.read_as_at(samples, channels, now);
            for (k, acc) in self.mix.iter_mut().enumerate().take(pcm.len() / width) {
                let native = in_format.read(&pcm, k * width);
                let share = (native as f64 * volume / live_count).round();
                input.meter_mut().calc(in_format.clamp(share as i64));

                let wide = in_format.rescale(native, out_format) as f64;
                let contribution = ((wide * volume / live_count).round() * self.volume).round();
                // float to int casts saturate, so only the sum can overflow
                *acc = out_format.clamp(acc.saturating_add(contribution as i64)) as i64;
            }
        }
    }

    /// Encode the mix buffer, duplicating frames on the insert schedule.
    fn encode(&mut self) -> Vec<u8> {
        let format = self.format.sample_format();
        let width = format.byte_width();
        let channels = self.format.channels() as usize;
        let frame_len = self.format.frame_byte_len();

        let samples = self.mix.len() / channels;
        let frames = samples + self.inserts_within(samples);
        let mut out = vec![0u8; frames * frame_len];

        let mut pos = 0;
        for frame in self.mix.chunks_exact(channels) {
            for (c, &sample) in frame.iter().enumerate() {
                let sample = sample as i32;
                format.write(&mut out, pos + c * width, sample);
                self.meter.calc(sample);
            }
            pos += frame_len;

            if let Some(interval) = self.insert_interval {
                if self.insert_counter == 0 {
                    out.copy_within(pos - frame_len..pos, pos);
                    pos += frame_len;
                    self.inserted += 1;
                    self.insert_counter = interval - 1;
                } else {
                    self.insert_counter -= 1;
                }
            }
        }

        out
    }

    /// Frames the insert schedule duplicates among the next `samples`.
    fn inserts_within(&self, samples: usize) -> usize {
        match self.insert_interval {
            Some(interval) if samples > self.insert_counter => {
                1 + (samples - 1 - self.insert_counter) / interval
            }
            _ => 0,
        }
    }

    fn set_insert_rate(&mut self, cv: f64) {
        let interval = if cv > 0.0 {
            Some(((self.format.sample_rate() as f64 / cv).round() as usize).max(1))
        } else {
            None
        };
        if interval == self.insert_interval {
            return;
        }

        self.insert_counter = match (self.insert_interval, interval) {
            (None, Some(interval)) => interval,
            (Some(_), Some(interval)) => self.insert_counter.min(interval),
            (_, None) => 0,
        };
        tracing::trace!(cv, ?interval, "insert interval changed");
        self.insert_interval = interval;
    }
}
