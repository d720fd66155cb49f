use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};

use approx::assert_relative_eq;
use driftmix::{
    InputConfig, LevelMeter, MeterEvent, Mixer, MixerConfig, Pull, SampleFormat, Status,
    WriteStatus,
};

fn mono_mixer() -> Mixer {
    let mut mixer = Mixer::new(MixerConfig::new().with_channels(1));
    mixer.start();
    mixer
}

fn pcm16(samples: impl IntoIterator<Item = i16>) -> Vec<u8> {
    samples.into_iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn decode16(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

fn chunk(pull: Pull) -> Vec<u8> {
    match pull {
        Pull::Chunk(pcm) => pcm,
        other => panic!("expected a chunk, got {:?}", other),
    }
}

#[test]
fn volumes_are_split_across_live_inputs() {
    let mut mixer = mono_mixer();
    let mut a = mixer.add_input(InputConfig::new().with_channels(1));
    let mut b = mixer.add_input(InputConfig::new().with_channels(1).with_volume(0.5));

    let frames: Vec<u8> = [0x00, 0x01].repeat(256);
    assert_eq!(a.write(&frames).accepted, 512);
    assert_eq!(b.write(&frames).accepted, 512);

    let out = decode16(&chunk(mixer.pull_at(Instant::now())));
    assert_eq!(out.len(), 256);
    assert!(out.iter().all(|&s| s == 192));
}

#[test]
fn output_is_clamped() {
    let mut mixer = mono_mixer();
    let mut a = mixer.add_input(InputConfig::new().with_volume(4.0).with_channels(1));
    let mut b = mixer.add_input(InputConfig::new().with_volume(4.0).with_channels(1));

    a.write(&pcm16([i16::MAX, i16::MIN, 1000]));
    b.write(&pcm16([i16::MAX, i16::MIN, -1000]));

    let out = decode16(&chunk(mixer.pull_at(Instant::now())));
    assert_eq!(out, vec![i16::MAX, i16::MIN, 0]);
}

#[test]
fn huge_volumes_saturate_instead_of_wrapping() {
    let mut mixer = mono_mixer();
    let mut a = mixer.add_input(InputConfig::new().with_volume(1e300).with_channels(1));
    let mut b = mixer.add_input(InputConfig::new().with_volume(1e300).with_channels(1));

    a.write(&pcm16([1000, 1000, -1000]));
    b.write(&pcm16([1000, 1000, -1000]));

    let out = decode16(&chunk(mixer.pull()));
    assert_eq!(out, vec![i16::MAX, i16::MAX, i16::MIN]);
}

#[test]
fn mixed_formats_are_converted_and_frame_aligned() {
    let mut mixer = Mixer::new(MixerConfig::new().with_channels(2).with_bit_depth(24));
    mixer.start();
    let mut mono16 = mixer.add_input(InputConfig::new().with_channels(1).with_bit_depth(16));
    let mut stereo8 = mixer.add_input(InputConfig::new().with_channels(2).with_bit_depth(8));

    let mut bytes = pcm16(core::iter::repeat(256).take(100));
    bytes.push(0x7f); // half a frame, held back by the writer
    assert_eq!(mono16.write(&bytes).accepted, 201);
    stereo8.write(&[1u8; 200]);

    let pcm = chunk(mixer.pull_at(Instant::now()));
    assert_eq!(pcm.len(), 100 * 6);

    let format = SampleFormat::I24;
    for offset in (0..pcm.len()).step_by(3) {
        // both inputs widen to 65536, halved by the live count
        assert_eq!(format.read(&pcm, offset), 65536);
    }
}

#[test]
fn stopped_mixer_produces_nothing() {
    let mut mixer = Mixer::new(MixerConfig::default());
    let mut input = mixer.add_input(InputConfig::new());
    input.write(&[0u8; 64]);
    assert!(!mixer.is_running());
    assert_eq!(mixer.pull(), Pull::Stopped);

    mixer.start();
    mixer.start();
    assert!(mixer.is_running());
    assert!(matches!(mixer.pull(), Pull::Chunk(_)));

    mixer.stop();
    mixer.stop();
    assert_eq!(mixer.pull(), Pull::Stopped);
}

#[test]
fn starvation_asks_for_a_retry() {
    let mut mixer = mono_mixer();
    let starved = Pull::Starved {
        retry_after: Duration::from_millis(20),
    };
    assert_eq!(mixer.pull(), starved);

    // registered but never written: not live yet
    let mut input = mixer.add_input(InputConfig::new());
    assert_eq!(mixer.pull(), starved);

    input.write(&pcm16([5, 5]));
    assert_eq!(decode16(&chunk(mixer.pull())), vec![5, 5]);
    assert_eq!(mixer.pull(), starved);
}

#[test]
fn dead_inputs_are_excluded_until_written_again() {
    let mut mixer = mono_mixer();
    let mut a = mixer.add_input(InputConfig::new().with_channels(1));
    let mut b = mixer.add_input(InputConfig::new().with_channels(1));

    b.write(&pcm16(core::iter::repeat(100).take(10)));
    a.write(&pcm16(core::iter::repeat(100).take(10)));
    assert_eq!(decode16(&chunk(mixer.pull())), vec![100; 10]);

    sleep(Duration::from_millis(60));
    a.write(&pcm16(core::iter::repeat(300).take(300)));

    // b is silent and stale, a alone sets the pace at full volume
    let out = decode16(&chunk(mixer.pull()));
    assert_eq!(out, vec![300; 300]);
    assert!(!mixer.input(b.id()).unwrap().is_alive());

    b.write(&pcm16(core::iter::repeat(100).take(50)));
    a.write(&pcm16(core::iter::repeat(300).take(80)));
    let out = decode16(&chunk(mixer.pull()));
    assert_eq!(out, vec![200; 50]);
    assert!(mixer.input(b.id()).unwrap().is_alive());
}

#[test]
fn faster_input_is_steered_toward_the_slowest() {
    let mut mixer = mono_mixer();
    let mut fast = mixer.add_input(InputConfig::new().with_channels(1));
    let mut slow = mixer.add_input(InputConfig::new().with_channels(1));

    fast.write(&pcm16(core::iter::repeat(0).take(3000)));
    slow.write(&pcm16(core::iter::repeat(0).take(500)));

    let out = chunk(mixer.pull_at(Instant::now()));
    assert_eq!(out.len(), 500 * 2);

    let fast = mixer.input(fast.id()).unwrap();
    let slow = mixer.input(slow.id()).unwrap();
    assert_relative_eq!(fast.buffer_set_point(), 1024.0);
    assert_relative_eq!(slow.buffer_set_point(), 1024.0);
    assert!(fast.drop_interval().is_some());
    assert_eq!(slow.drop_interval(), None);
}

#[test]
fn remove_is_idempotent_and_closes_the_writer() {
    let mut mixer = mono_mixer();
    let mut input = mixer.add_input(InputConfig::new());
    let id = input.id();
    assert_eq!(mixer.input_count(), 1);

    assert!(mixer.remove_input(id));
    assert!(!mixer.remove_input(id));
    assert_eq!(mixer.input_count(), 0);

    assert!(input.is_closed());
    assert_eq!(input.write(&[0u8; 4]).status, WriteStatus::Closed);
}

#[test]
fn finished_inputs_drain_then_disappear() {
    let mut mixer = mono_mixer();
    let mut input = mixer.add_input(InputConfig::new().with_channels(1));
    input.write(&pcm16([1, 2, 3]));
    input.finish();

    let later = Instant::now() + Duration::from_secs(1);
    assert_eq!(decode16(&chunk(mixer.pull_at(later))), vec![1, 2, 3]);
    assert_eq!(mixer.input_count(), 1);

    assert!(matches!(mixer.pull_at(later), Pull::Starved { .. }));
    assert_eq!(mixer.input_count(), 0);
}

#[test]
fn backpressure_clears_with_one_notification() {
    let mut mixer = mono_mixer();
    let mut input = mixer.add_input(InputConfig::new().with_channels(1).with_chunk_size(64));

    let written = input.write(&pcm16(core::iter::repeat(1).take(300)));
    assert_eq!(written.status, WriteStatus::Backpressure);
    assert_eq!(written.accepted, 256 * 2);
    assert!(input.is_backpressured());

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    input
        .notify_when_ready(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert_eq!(chunk(mixer.pull()).len(), 256 * 2);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!input.is_backpressured());
    assert_eq!(input.write(&pcm16([1])).status, WriteStatus::Ready);

    mixer.pull();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn volume_messages_apply_on_next_pass() {
    let mut mixer = mono_mixer();
    let mut input = mixer.add_input(InputConfig::new().with_channels(1));
    input.set_volume(0.5).unwrap();
    input.write(&pcm16([1000, 1000]));

    assert_eq!(decode16(&chunk(mixer.pull())), vec![500, 500]);
    assert_eq!(mixer.input(input.id()).unwrap().volume(), 0.5);
}

#[test]
fn master_volume_scales_the_mix() {
    let mut mixer = mono_mixer();
    mixer.set_volume(0.25);
    let mut input = mixer.add_input(InputConfig::new().with_channels(1));
    input.write(&pcm16([1000, -1000]));

    assert_eq!(decode16(&chunk(mixer.pull())), vec![250, -250]);

    mixer.set_volume(f64::NAN);
    assert_eq!(mixer.volume(), 1.0);
}

#[test]
fn process_hands_chunks_to_the_output() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let mut mixer = Mixer::new(MixerConfig::new().with_channels(1))
        .with_output(move |pcm: &[u8]| sink.lock().unwrap().extend_from_slice(pcm));
    mixer.start();

    let mut input = mixer.add_input(InputConfig::new().with_channels(1));
    input.write(&pcm16([7, 8, 9]));

    assert_eq!(mixer.process(), Status::Produced(3));
    assert_eq!(decode16(&received.lock().unwrap()), vec![7, 8, 9]);
    assert_eq!(
        mixer.process(),
        Status::Starved {
            retry_after: Duration::from_millis(20)
        }
    );
}

#[test]
fn constant_signal_reports_its_peak() {
    let mut meter = LevelMeter::new(SampleFormat::I16, 1000);
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    meter.subscribe(move |e| sink.lock().unwrap().push(e));

    // one full 3 s window at 1000 Hz
    for _ in 0..3000 {
        meter.calc(16384);
    }

    let expected = 16384.0 / 32767.0;
    let last_peak = events
        .lock()
        .unwrap()
        .iter()
        .rev()
        .find_map(|e| match e {
            MeterEvent::Peak(p) => Some(*p),
            _ => None,
        })
        .unwrap();
    assert_relative_eq!(last_peak, expected);
    assert_relative_eq!(meter.peak(), expected);
    assert_relative_eq!(meter.level(), expected);
}

#[test]
fn mixing_feeds_input_and_output_meters() {
    let mut mixer = Mixer::new(MixerConfig::new().with_channels(1).with_sample_rate(1000));
    mixer.start();
    let mut loud = mixer.add_input(InputConfig::new().with_channels(1).with_volume(0.5));
    let mut silent = mixer.add_input(InputConfig::new().with_channels(1));

    let levels = Arc::new(Mutex::new(Vec::new()));
    let sink = levels.clone();
    mixer
        .input_mut(loud.id())
        .unwrap()
        .meter_mut()
        .subscribe(move |e| sink.lock().unwrap().push(e));

    // one level window at 1000 Hz is 200 samples
    loud.write(&pcm16(core::iter::repeat(20000).take(200)));
    silent.write(&pcm16(core::iter::repeat(0).take(200)));
    chunk(mixer.pull());

    // the input meter sees its share of the mix: 20000 * 0.5 / 2 live inputs
    let share = 5000.0 / 32767.0;
    assert_eq!(
        *levels.lock().unwrap(),
        vec![MeterEvent::Level(share), MeterEvent::Peak(share)]
    );
    assert_relative_eq!(mixer.meter().level(), share);
    assert_relative_eq!(mixer.input(silent.id()).unwrap().meter().level(), 0.0);
}

/// Feed `frames` frames then pull, `passes` times, sleeping `gap` before each
/// pull. Returns the total number of frames emitted.
fn pull_paced(mixer: &mut Mixer, frames: usize, gap: Duration, passes: usize) -> usize {
    let mut input = mixer.add_input(InputConfig::new().with_channels(1));
    let mut emitted = 0;
    for _ in 0..passes {
        sleep(gap);
        input.write(&pcm16(core::iter::repeat(42).take(frames)));
        let out = decode16(&chunk(mixer.pull()));
        assert!(out.iter().all(|&s| s == 42));
        emitted += out.len();
    }
    emitted
}

#[test]
fn slow_consumer_gets_duplicated_frames() {
    // 20 frames every 40 ms or longer is at most 500 Hz against 1000 Hz nominal
    let mut mixer = Mixer::new(MixerConfig::new().with_channels(1).with_sample_rate(1000));
    mixer.start();
    let emitted = pull_paced(&mut mixer, 20, Duration::from_millis(40), 50);

    assert!(mixer.estimated_rate() < 1000.0);
    assert!(mixer.insert_interval().is_some());
    assert!(mixer.inserted_frames() > 0);
    assert_eq!(emitted as u64, 50 * 20 + mixer.inserted_frames());
}

#[test]
fn fast_consumer_gets_no_duplicates() {
    // 100 frames per pass stays above 1000 Hz unless a 10 ms sleep takes 100 ms
    let mut mixer = Mixer::new(MixerConfig::new().with_channels(1).with_sample_rate(1000));
    mixer.start();
    let emitted = pull_paced(&mut mixer, 100, Duration::from_millis(10), 30);

    assert!(mixer.estimated_rate() >= 1000.0);
    assert_eq!(mixer.insert_interval(), None);
    assert_eq!(mixer.inserted_frames(), 0);
    assert_eq!(emitted, 30 * 100);
}
