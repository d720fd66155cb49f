//! A real-time PCM mixer for independently clocked inputs.
//!
//! No two producers deliver audio at exactly their nominal rate. `driftmix`
//! keeps them together without resampling: each input watches its own queue
//! depth and drops the occasional frame when it runs ahead of the slowest
//! input, while the mixer duplicates the occasional output frame when it is
//! pulled faster than its nominal rate.
//!
//! - [`Mixer`] owns the engine and produces mixed chunks via [`Mixer::pull`]
//!   or pushes them to a [`PcmSink`] via [`Mixer::process`].
//! - [`InputWriter`] is the producer side of an input, safe to move to
//!   another thread. Writes are lock-free.
//! - [`LevelMeter`] publishes level and peak events for every input and for
//!   the output.
//!
//! All PCM is signed, little-endian and interleaved, 8/16/24/32 bit, mono or
//! stereo.

extern crate alloc;

pub mod config;
pub mod control;
pub mod error;
pub mod format;
pub mod input;
pub mod level;
pub mod mixer;
pub mod sink;

pub use config::{InputConfig, MixerConfig};
pub use error::ConfigError;
pub use format::{AudioFormat, SampleFormat};
pub use input::{InputChannel, InputId, InputMessage, InputWriter, WriteStatus, Written};
pub use level::{LevelMeter, MeterEvent};
pub use mixer::{Mixer, Pull, Status};
pub use sink::{PcmSink, RtrbSink};
