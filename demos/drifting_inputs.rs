use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, sleep};
use std::time::{Duration, Instant};

use driftmix::{InputConfig, InputWriter, MeterEvent, Mixer, MixerConfig, Status, WriteStatus};
use tracing::{info, trace_span, Level};

const SAMPLE_RATE: f64 = 44100.0;
const RUN_FOR: Duration = Duration::from_secs(5);

/// Write a mono sine wave at `SAMPLE_RATE * (1 + drift)` real frames per second.
fn spawn_producer(mut writer: InputWriter, hz: f64, drift: f64, done: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let _span = trace_span!("producer", input = ?writer.id()).entered();
        let real_rate = SAMPLE_RATE * (1.0 + drift);
        let started = Instant::now();
        let mut written = 0usize;
        let mut phase = 0.0f64;

        while !done.load(Ordering::Relaxed) {
            let due = (started.elapsed().as_secs_f64() * real_rate) as usize;
            let mut pcm = Vec::with_capacity((due - written) * 2);
            for _ in written..due {
                let sample = (phase.sin() * 8000.0) as i16;
                pcm.extend_from_slice(&sample.to_le_bytes());
                phase = (phase + TAU * hz / SAMPLE_RATE) % TAU;
            }

            let result = writer.write(&pcm);
            written += result.accepted / 2;
            match result.status {
                WriteStatus::Closed => break,
                WriteStatus::Backpressure => sleep(Duration::from_millis(20)),
                WriteStatus::Ready => sleep(Duration::from_millis(5)),
            }
        }
        writer.finish();
    })
}

fn main() {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let emitted = Arc::new(AtomicUsize::new(0));
    let counter = emitted.clone();
    let mut mixer = Mixer::new(
        MixerConfig::new()
            .with_channels(2)
            .with_chunk_size(2048)
            .with_input_chunk_size(4096),
    )
    .with_output(move |pcm: &[u8]| {
        counter.fetch_add(pcm.len() / 4, Ordering::Relaxed);
    });

    mixer.meter_mut().subscribe(|event| match event {
        MeterEvent::Level(level) => info!(level, "output level"),
        MeterEvent::Peak(peak) => info!(peak, "output peak"),
    });

    let done = Arc::new(AtomicBool::new(false));
    let fast = mixer.add_input(InputConfig::new().with_channels(1));
    let slow = mixer.add_input(InputConfig::new().with_channels(1).with_volume(0.8));
    let producers = [
        spawn_producer(fast, 440.0, 0.002, done.clone()),
        spawn_producer(slow, 554.37, -0.002, done.clone()),
    ];

    mixer.start();
    let started = Instant::now();
    while started.elapsed() < RUN_FOR {
        match mixer.process() {
            Status::Produced(_) => sleep(Duration::from_millis(10)),
            Status::Starved { retry_after } => sleep(retry_after),
            Status::Stopped => break,
        }
    }

    done.store(true, Ordering::Relaxed);
    for producer in producers {
        let _ = producer.join();
    }
    mixer.stop();

    for input in mixer.inputs() {
        info!(input = ?input.id(), dropped = input.dropped_frames(), "input drift correction");
    }
    info!(
        emitted = emitted.load(Ordering::Relaxed),
        inserted = mixer.inserted_frames(),
        rate = mixer.estimated_rate(),
        "done"
    );
}
