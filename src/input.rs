//! Mixer inputs.
//!
//! Each input is split in two halves joined by lock-free ring buffers:
//!
//! - [`InputWriter`] lives with the producer (a decoder thread, a network
//!   receiver, ...) and pushes raw PCM bytes.
//! - [`InputChannel`] lives inside the [`Mixer`](crate::Mixer) and reads
//!   those bytes back out, dropping the occasional frame so that its queue
//!   settles at the depth the mixer asks for.
//!
//! The byte queue only ever holds whole frames. A write ending in a partial
//! frame keeps the tail in the writer until the rest of the frame arrives.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rtrb::{Consumer, Producer, RingBuffer};

use crate::config::resolve_volume;
use crate::control::{Dampener, PiController};
use crate::format::AudioFormat;
use crate::level::LevelMeter;

/// An input with no write for this long stops holding back the mix.
pub const DEAD_INPUT_TIMEOUT: Duration = Duration::from_millis(50);

const MESSAGE_QUEUE_SIZE: usize = 16;

// buffer-depth controller tuning
const BUFFER_P: f64 = 0.5;
const BUFFER_I: f64 = 0.05;
const BUFFER_DAMP_SECS: f64 = 1.0;

/// Identifies an input within its mixer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct InputId(pub(crate) u32);

/// Parameter updates sent from an [`InputWriter`] to its channel.
///
/// Messages are applied at the start of the mixer's next pass.
pub enum InputMessage {
    /// Set the input's volume factor (1.0 = unity).
    SetVolume(f64),
    /// Run the callback once the queue has drained back under its
    /// watermark. Replaces any request that has not fired yet.
    NotifyWhenReady(Box<dyn FnOnce() + Send>),
}

impl core::fmt::Debug for InputMessage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            InputMessage::SetVolume(v) => f.debug_tuple("SetVolume").field(v).finish(),
            InputMessage::NotifyWhenReady(_) => f.write_str("NotifyWhenReady(..)"),
        }
    }
}

/// Queue state after a write.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WriteStatus {
    /// Keep writing.
    Ready,
    /// The queue holds more than two chunks. Stop writing until notified
    /// (see [`InputWriter::notify_when_ready`]) or until
    /// [`InputWriter::is_backpressured`] clears.
    Backpressure,
    /// The mixer side is gone; nothing will be read again.
    Closed,
}

/// Result of [`InputWriter::write`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Written {
    /// Bytes taken from the front of the slice. The remainder did not fit
    /// and should be offered again later.
    pub accepted: usize,
    pub status: WriteStatus,
}

/// Last-write timestamp shared by both halves, in nanoseconds after the
/// mixer's epoch plus one (zero means never written).
struct Shared {
    epoch: Instant,
    last_write: AtomicU64,
}

impl Shared {
    fn stamp(&self, now: Instant) {
        let nanos = now.saturating_duration_since(self.epoch).as_nanos() as u64;
        self.last_write.store(nanos.saturating_add(1), Ordering::Release);
    }

    fn last_write(&self) -> Option<Instant> {
        match self.last_write.load(Ordering::Acquire) {
            0 => None,
            n => Some(self.epoch + Duration::from_nanos(n - 1)),
        }
    }
}

/// Producer half of a mixer input.
///
/// `InputWriter` is `Send`, so it can be moved to whichever thread delivers
/// the input's PCM. Dropping it (or calling [`finish`](Self::finish)) tells
/// the mixer no more data will arrive; the input is removed once drained.
pub struct InputWriter {
    id: InputId,
    format: AudioFormat,
    queue: Producer<u8>,
    messages: Producer<InputMessage>,
    shared: Arc<Shared>,
    partial: Vec<u8>,
    watermark: usize,
}

impl InputWriter {
    #[inline]
    pub fn id(&self) -> InputId {
        self.id
    }

    /// Format the written bytes must be in.
    #[inline]
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Append interleaved PCM bytes to the input's queue.
    ///
    /// As many bytes as fit are taken; a trailing partial frame is held
    /// back and completed by the next write. Every call also marks the input
    /// as alive.
    pub fn write(&mut self, bytes: &[u8]) -> Written {
        if self.queue.is_abandoned() {
            return Written {
                accepted: 0,
                status: WriteStatus::Closed,
            };
        }
        self.shared.stamp(Instant::now());

        let frame = self.format.frame_byte_len();
        let mut rest = bytes;
        let mut accepted = 0;

        if !self.partial.is_empty() {
            let need = frame - self.partial.len();
            if rest.len() < need {
                self.partial.extend_from_slice(rest);
                return Written {
                    accepted: rest.len(),
                    status: self.status(),
                };
            }
            if self.queue.slots() < frame {
                return Written {
                    accepted: 0,
                    status: self.status(),
                };
            }

            let mut completed = core::mem::take(&mut self.partial);
            completed.extend_from_slice(&rest[..need]);
            self.push(&completed);
            completed.clear();
            self.partial = completed;

            accepted += need;
            rest = &rest[need..];
        }

        let whole = rest.len() / frame;
        let frames = whole.min(self.queue.slots() / frame);
        if frames > 0 {
            self.push(&rest[..frames * frame]);
            accepted += frames * frame;
            rest = &rest[frames * frame..];
        }

        if frames == whole && !rest.is_empty() {
            self.partial.extend_from_slice(rest);
            accepted += rest.len();
        }

        Written {
            accepted,
            status: self.status(),
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        // callers only push whole frames that fit
        if let Ok(mut chunk) = self.queue.write_chunk(bytes.len()) {
            let (first, second) = chunk.as_mut_slices();
            let mid = first.len();
            first.copy_from_slice(&bytes[..mid]);
            second.copy_from_slice(&bytes[mid..]);
            chunk.commit_all();
        }
    }

    fn status(&self) -> WriteStatus {
        if self.queue.is_abandoned() {
            WriteStatus::Closed
        } else if self.is_backpressured() {
            WriteStatus::Backpressure
        } else {
            WriteStatus::Ready
        }
    }

    /// Whole frames waiting in the queue.
    pub fn queued_frames(&self) -> usize {
        let queued = self.queue.buffer().capacity() - self.queue.slots();
        self.format.frames_in(queued)
    }

    /// Whether the queue is above its watermark of two chunks.
    pub fn is_backpressured(&self) -> bool {
        self.queued_frames() > self.watermark
    }

    /// Whether the mixer side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.queue.is_abandoned()
    }

    /// Send a parameter message to the mixer side.
    ///
    /// Returns the message back if the message queue is full.
    pub fn send(&mut self, msg: InputMessage) -> Result<(), InputMessage> {
        self.messages.push(msg).map_err(|rtrb::PushError::Full(m)| m)
    }

    /// Change the input's volume, applied on the next mixer pass.
    pub fn set_volume(&mut self, volume: f64) -> Result<(), InputMessage> {
        self.send(InputMessage::SetVolume(volume))
    }

    /// Ask to be called back once the queue drains under its watermark.
    ///
    /// At most one request is outstanding: a newer request replaces an
    /// older one that has not fired. The callback runs on the mixer's thread.
    pub fn notify_when_ready(
        &mut self,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), InputMessage> {
        self.send(InputMessage::NotifyWhenReady(Box::new(f)))
    }

    /// Signal that no more data will be written.
    pub fn finish(self) {
        if !self.partial.is_empty() {
            tracing::debug!(
                input = self.id.0,
                bytes = self.partial.len(),
                "discarding incomplete trailing frame"
            );
        }
        tracing::debug!(input = self.id.0, "input finished");
    }
}

/// Mixer-side half of an input: queue reader, drift control and metering.
pub struct InputChannel {
    id: InputId,
    format: AudioFormat,
    volume: f64,
    queue: Consumer<u8>,
    messages: Consumer<InputMessage>,
    shared: Arc<Shared>,
    watermark: usize,

    /// Frames still to pass through before the next one is dropped.
    drop_counter: usize,
    /// One frame is dropped after every `drop_interval` kept frames.
    drop_interval: Option<usize>,
    dropped: u64,
    controller: PiController,
    dampener: Dampener,

    meter: LevelMeter,
    pending_request: Option<Box<dyn FnOnce() + Send>>,
    alive: bool,
}

impl InputChannel {
    /// Create both halves of an input. `chunk` is in frames; the queue holds
    /// four chunks and asserts backpressure above two.
    pub(crate) fn new(
        id: InputId,
        format: AudioFormat,
        volume: f64,
        chunk: usize,
        epoch: Instant,
    ) -> (InputChannel, InputWriter) {
        let chunk = chunk.max(1);
        let (producer, consumer) = RingBuffer::<u8>::new(4 * chunk * format.frame_byte_len());
        let (msg_producer, msg_consumer) = RingBuffer::new(MESSAGE_QUEUE_SIZE);
        let shared = Arc::new(Shared {
            epoch,
            last_write: AtomicU64::new(0),
        });

        let sample_rate = format.sample_rate() as f64;
        let controller = PiController::new(BUFFER_P, BUFFER_I)
            .inverted()
            .with_output_limits(0.0, sample_rate / 10.0);

        let channel = InputChannel {
            id,
            format,
            volume,
            queue: consumer,
            messages: msg_consumer,
            shared: shared.clone(),
            watermark: 2 * chunk,
            drop_counter: 0,
            drop_interval: None,
            dropped: 0,
            controller,
            dampener: Dampener::new(BUFFER_DAMP_SECS),
            meter: LevelMeter::new(format.sample_format(), format.sample_rate()),
            pending_request: None,
            alive: false,
        };

        let writer = InputWriter {
            id,
            format,
            queue: producer,
            messages: msg_producer,
            shared,
            partial: Vec::new(),
            watermark: 2 * chunk,
        };

        (channel, writer)
    }

    #[inline]
    pub fn id(&self) -> InputId {
        self.id
    }

    #[inline]
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    #[inline]
    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn set_volume(&mut self, volume: f64) {
        self.volume = resolve_volume(volume);
    }

    /// Whether this input currently takes part in the mix.
    ///
    /// Updated at the start of each mixer pass. An input is alive if it was
    /// written to within [`DEAD_INPUT_TIMEOUT`], if its producer is held back
    /// by backpressure, or if it has finished but still holds data.
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Whole frames waiting in the queue.
    #[inline]
    pub fn available_samples(&self) -> usize {
        self.format.frames_in(self.queue.slots())
    }

    /// Frames a read can return right now, once the frames the current drop
    /// schedule would discard are taken out.
    pub fn available_samples_after_drop(&self) -> usize {
        let raw = self.available_samples();
        raw - self.drops_within(raw)
    }

    /// Target queue depth in frames for the drift controller.
    pub fn set_buffer_set_point(&mut self, frames: f64) {
        self.controller.set_set_point(frames);
    }

    #[inline]
    pub fn buffer_set_point(&self) -> f64 {
        self.controller.set_point()
    }

    /// Current drop schedule, `None` while no frames are being dropped.
    #[inline]
    pub fn drop_interval(&self) -> Option<usize> {
        self.drop_interval
    }

    /// Total frames dropped by drift correction so far.
    #[inline]
    pub fn dropped_frames(&self) -> u64 {
        self.dropped
    }

    #[inline]
    pub fn meter(&self) -> &LevelMeter {
        &self.meter
    }

    #[inline]
    pub fn meter_mut(&mut self) -> &mut LevelMeter {
        &mut self.meter
    }

    /// Read up to `frames` frames in the input's own format.
    ///
    /// Returns fewer frames only if the queue runs short.
    pub fn read(&mut self, frames: usize) -> Vec<u8> {
        self.read_at(frames, Instant::now())
    }

    /// Read like [`read`](Self::read), converted to `channels` channels.
    pub fn read_as(&mut self, frames: usize, channels: u16) -> Vec<u8> {
        self.read_as_at(frames, channels, Instant::now())
    }

    pub fn read_mono(&mut self, frames: usize) -> Vec<u8> {
        self.read_as(frames, 1)
    }

    pub fn read_stereo(&mut self, frames: usize) -> Vec<u8> {
        self.read_as(frames, 2)
    }

    pub(crate) fn read_as_at(&mut self, frames: usize, channels: u16, now: Instant) -> Vec<u8> {
        let native = self.read_at(frames, now);
        match (self.format.channels(), channels) {
            (2, 1) => self.downmix(&native),
            (1, 2) => self.upmix(&native),
            _ => native,
        }
    }

    pub(crate) fn read_at(&mut self, frames: usize, now: Instant) -> Vec<u8> {
        self.drain_messages();

        self.dampener.feed_at(self.available_samples() as f64, now);
        if let Some(depth) = self.dampener.output() {
            self.controller.set_process_variable(depth);
        }
        let cv = self.controller.output_at(now);

        let out = self.take_frames(frames);

        // the schedule changes between reads, so availability checks made
        // before this read stay valid for it
        self.set_drop_rate(cv);
        self.fire_pending_request();
        out
    }

    fn take_frames(&mut self, frames: usize) -> Vec<u8> {
        let frame = self.format.frame_byte_len();
        let wanted = frames + self.extra_frames(frames);
        let raw = wanted.min(self.available_samples());

        let mut out = Vec::with_capacity(frames * frame);
        if raw == 0 {
            return out;
        }
        let chunk = match self.queue.read_chunk(raw * frame) {
            Ok(chunk) => chunk,
            Err(_) => return out,
        };

        let mut consumed = 0;
        let (first, second) = chunk.as_slices();
        for src in first.chunks_exact(frame).chain(second.chunks_exact(frame)) {
            if out.len() == frames * frame {
                break;
            }
            consumed += 1;
            if let Some(interval) = self.drop_interval {
                if self.drop_counter == 0 {
                    self.drop_counter = interval;
                    self.dropped += 1;
                    continue;
                }
                self.drop_counter -= 1;
            }
            out.extend_from_slice(src);
        }
        chunk.commit(consumed * frame);

        out
    }

    /// Frames the drop schedule discards while `frames` frames are kept.
    fn extra_frames(&self, frames: usize) -> usize {
        match self.drop_interval {
            Some(interval) if frames > self.drop_counter => {
                (frames - self.drop_counter + interval - 1) / interval
            }
            _ => 0,
        }
    }

    /// Frames the drop schedule discards among the next `raw` queued frames.
    fn drops_within(&self, raw: usize) -> usize {
        match self.drop_interval {
            Some(interval) if raw > self.drop_counter => {
                1 + (raw - self.drop_counter - 1) / (interval + 1)
            }
            _ => 0,
        }
    }

    /// Turn the controller's drops-per-second into a drop interval.
    fn set_drop_rate(&mut self, cv: f64) {
        let interval = if cv > 0.0 {
            Some(((self.format.sample_rate() as f64 / cv).round() as usize).max(1))
        } else {
            None
        };
        if interval == self.drop_interval {
            return;
        }

        self.drop_counter = match (self.drop_interval, interval) {
            (None, Some(interval)) => interval,
            (Some(_), Some(interval)) => self.drop_counter.min(interval),
            (_, None) => 0,
        };
        tracing::trace!(input = self.id.0, cv, ?interval, "drop interval changed");
        self.drop_interval = interval;
    }

    fn downmix(&self, stereo: &[u8]) -> Vec<u8> {
        let format = self.format.sample_format();
        let width = format.byte_width();
        let mut mono = vec![0u8; stereo.len() / 2];
        for (i, frame) in stereo.chunks_exact(2 * width).enumerate() {
            let l = format.read(frame, 0) as f64;
            let r = format.read(frame, width) as f64;
            format.write(&mut mono, i * width, ((l + r) / 2.0).round() as i32);
        }
        mono
    }

    fn upmix(&self, mono: &[u8]) -> Vec<u8> {
        let width = self.format.sample_byte_len();
        let mut stereo = Vec::with_capacity(mono.len() * 2);
        for sample in mono.chunks_exact(width) {
            stereo.extend_from_slice(sample);
            stereo.extend_from_slice(sample);
        }
        stereo
    }

    fn drain_messages(&mut self) {
        while let Ok(msg) = self.messages.pop() {
            match msg {
                InputMessage::SetVolume(volume) => self.set_volume(volume),
                InputMessage::NotifyWhenReady(f) => self.pending_request = Some(f),
            }
        }
    }

    fn fire_pending_request(&mut self) {
        if self.available_samples() > self.watermark {
            return;
        }
        if let Some(f) = self.pending_request.take() {
            f();
        }
    }

    /// Apply pending messages and re-evaluate liveness.
    pub(crate) fn update(&mut self, now: Instant) {
        self.drain_messages();

        let recent = self
            .shared
            .last_write()
            .is_some_and(|t| now.saturating_duration_since(t) <= DEAD_INPUT_TIMEOUT);
        let waiting = self.available_samples() > self.watermark;
        let draining = self.queue.is_abandoned() && !self.queue.is_empty();

        let alive = recent || waiting || draining;
        if alive != self.alive {
            tracing::debug!(input = self.id.0, alive, "input liveness changed");
            self.alive = alive;
        }

        self.fire_pending_request();
    }

    /// The writer is gone and everything it wrote has been read.
    pub(crate) fn is_finished(&self) -> bool {
        self.queue.is_abandoned() && self.queue.is_empty()
    }
}
