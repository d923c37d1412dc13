//! End-to-end pipeline tests: frames produced into the queue come out of the
//! worker as valid archive files, and every frame returns to the pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use aircheck::archive::{ArchiveConfig, ArchivePolicy};
use aircheck::clock::{PtpClock, PtpClockConfig};
use aircheck::frame::{queue::FrameQueue, FramePool};
use aircheck::meter::{LevelMeter, MeterConfig};
use aircheck::sink::{SinkFormat, SinkParams};
use aircheck::worker::{Worker, WorkerConfig, WorkerParts};

const SPF: usize = 480;

fn temp_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("aircheck-pipeline-{}-{}", std::process::id(), name))
}

fn sink_params(format: SinkFormat, channels: u16) -> SinkParams {
    SinkParams {
        format,
        sample_rate: 48000,
        channels,
        bitrate: 0,
        vbr: true,
        complexity: 10,
        fsync: false,
    }
}

fn single_file_policy(path: &PathBuf) -> ArchivePolicy {
    ArchivePolicy::new(ArchiveConfig {
        single_file: Some(path.clone()),
        create_dirs: false,
        ..Default::default()
    })
    .unwrap()
}

fn start_worker(
    queue: &Arc<FrameQueue>,
    path: &PathBuf,
    format: SinkFormat,
    channels: u16,
) -> Worker {
    Worker::start(WorkerParts {
        queue: Arc::clone(queue),
        clock: Arc::new(PtpClock::new(&PtpClockConfig::default()).unwrap()),
        policy: single_file_policy(path),
        sink_params: sink_params(format, channels),
        meter: LevelMeter::new(&MeterConfig {
            sample_rate: 48000,
            channels,
            interval_ms: 1000,
        }),
        vox: None,
        config: WorkerConfig::default(),
    })
    .unwrap()
}

fn produce(pool: &Arc<FramePool>, queue: &Arc<FrameQueue>, frames: usize, channels: u16) {
    let mut ts = 1_000_000_000u64;
    for i in 0..frames {
        let mut frame = loop {
            match pool.acquire() {
                Some(frame) => break frame,
                None => thread::sleep(Duration::from_millis(1)),
            }
        };
        let amplitude = 0.1 + 0.001 * (i % 100) as f32;
        for sample in frame.buffer_mut().iter_mut() {
            *sample = amplitude;
        }
        frame.set_sample_frames(SPF);
        frame.set_timestamp_ns(ts);
        ts += 10_000_000;

        let mut pending = frame;
        loop {
            match queue.push(pending) {
                Ok(()) => break,
                Err(rejected) => {
                    pending = rejected;
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }
}

fn wait_drained(queue: &FrameQueue) {
    for _ in 0..1000 {
        if queue.is_empty() {
            thread::sleep(Duration::from_millis(10));
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("queue never drained");
}

#[test]
fn wav_pipeline_end_to_end() {
    let path = temp_file("e2e.wav");
    let pool = FramePool::new(8, SPF, 2);
    let queue = FrameQueue::new(8);
    let mut worker = start_worker(&queue, &path, SinkFormat::Wav, 2);

    produce(&pool, &queue, 100, 2);
    wait_drained(&queue);
    worker.stop();

    assert_eq!(worker.frames_written(), 100);
    assert!(worker.last_error().is_none());
    // Frame ownership conservation after a clean stop.
    assert_eq!(pool.frames_in_flight(), 0);

    let reader = hound::WavReader::open(&path).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 2);
    assert_eq!(spec.sample_rate, 48000);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(reader.len() as usize, 100 * SPF * 2);

    std::fs::remove_file(&path).ok();
}

#[test]
fn opus_pipeline_end_to_end() {
    let path = temp_file("e2e.opus");
    let pool = FramePool::new(8, SPF, 2);
    let queue = FrameQueue::new(8);
    let mut worker = start_worker(&queue, &path, SinkFormat::Opus, 2);

    // 100 frames of 10 ms = 1 s = 50 opus packets, frame-aligned.
    produce(&pool, &queue, 100, 2);
    wait_drained(&queue);
    worker.stop();

    assert_eq!(worker.frames_written(), 100);
    assert_eq!(pool.frames_in_flight(), 0);

    let file = std::fs::File::open(&path).unwrap();
    let mut reader = ogg::PacketReader::new(file);
    let head = reader.read_packet().unwrap().expect("OpusHead");
    assert_eq!(&head.data[0..8], b"OpusHead");
    let tags = reader.read_packet().unwrap().expect("OpusTags");
    assert_eq!(&tags.data[0..8], b"OpusTags");

    let mut audio_packets = 0u32;
    let mut saw_eos = false;
    let mut last_granule = 0u64;
    while let Some(packet) = reader.read_packet().unwrap() {
        if !packet.data.is_empty() {
            audio_packets += 1;
        }
        if packet.last_in_stream() {
            saw_eos = true;
            last_granule = packet.absgp_page();
        }
    }
    assert_eq!(audio_packets, 50);
    assert!(saw_eos);
    // 48000 samples - 312 pre-skip.
    assert_eq!(last_granule, 48_000 - 312);

    std::fs::remove_file(&path).ok();
}

#[test]
fn pool_exhaustion_is_backpressure_not_failure() {
    let pool = FramePool::new(4, SPF, 1);
    let held: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
    assert!(pool.acquire().is_none());
    drop(held);
    assert_eq!(pool.free_frames(), 4);
}
