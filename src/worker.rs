//! Non-RT worker thread.
//!
//! Drains the frame queue into the active sink: rotation decisions, level
//! metering, VOX gating, encoding and frame release all happen here, off the
//! capture path. A sink failure ends the recording session; the error is
//! recorded for the control thread and the running flag flips.

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::archive::{ArchiveClock, ArchivePolicy};
use crate::clock::{system_now_ns, PtpClock};
use crate::error::Result;
use crate::frame::{queue::FrameQueue, FrameHandle};
use crate::meter::{LevelMeter, LevelsReport};
use crate::sink::{open_sink, Sink, SinkParams};
use crate::vox::VoxDetector;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep when the queue is empty, in microseconds
    pub idle_sleep_us: u64,
    /// Write out whatever is still queued when stopping
    pub drain_on_stop: bool,
    /// Emit level reports on stdout
    pub levels_enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_sleep_us: 1000,
            drain_on_stop: true,
            levels_enabled: false,
        }
    }
}

/// Everything the worker thread owns.
pub struct WorkerParts {
    pub queue: Arc<FrameQueue>,
    pub clock: Arc<PtpClock>,
    pub policy: ArchivePolicy,
    pub sink_params: SinkParams,
    pub meter: LevelMeter,
    pub vox: Option<VoxDetector>,
    pub config: WorkerConfig,
}

/// State shared with the control thread.
struct WorkerShared {
    running: AtomicBool,
    failed: AtomicBool,
    last_error: Mutex<Option<String>>,
    frames_processed: AtomicU64,
    frames_written: AtomicU64,
    files_opened: AtomicU64,
}

/// Consumer thread draining the queue into the active sink.
pub struct Worker {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Open the initial sink and start the consumer thread. Sink open
    /// failures surface here, on the caller's thread, as startup errors.
    pub fn start(mut parts: WorkerParts) -> Result<Self> {
        let shared = Arc::new(WorkerShared {
            running: AtomicBool::new(true),
            failed: AtomicBool::new(false),
            last_error: Mutex::new(None),
            frames_processed: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            files_opened: AtomicU64::new(0),
        });

        let now_ns = rotation_now(parts.policy.clock_source(), &parts.clock, None);
        let path = parts.policy.next_path(now_ns)?;
        let sink = open_sink(&path, &parts.sink_params)?;
        parts.policy.advance();
        shared.files_opened.store(1, Ordering::Relaxed);
        log::info!("worker: recording to {}", path.display());

        let mut state = WorkerState {
            queue: parts.queue,
            clock: parts.clock,
            policy: parts.policy,
            sink_params: parts.sink_params,
            meter: parts.meter,
            vox: parts.vox,
            config: parts.config,
            sink: Some(sink),
        };

        let thread_shared = Arc::clone(&shared);
        let thread = thread::spawn(move || {
            if let Err(e) = state.run(&thread_shared) {
                log::error!("worker: recording session failed: {}", e);
                *thread_shared.last_error.lock() = Some(e.to_string());
                thread_shared.failed.store(true, Ordering::Release);
            }
            state.teardown(&thread_shared);
            thread_shared.running.store(false, Ordering::Release);
        });

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Cooperative stop: flip the flag and join.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.shared.running.load(Ordering::Acquire) && !self.shared.failed.load(Ordering::Acquire)
    }

    /// Snapshot of the first fatal error, if any.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    pub fn frames_written(&self) -> u64 {
        self.shared.frames_written.load(Ordering::Relaxed)
    }

    pub fn files_opened(&self) -> u64 {
        self.shared.files_opened.load(Ordering::Relaxed)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Rotation decisions follow the archive clock: the frame's PTP timestamp
/// when filing by PTP time, the system wall clock otherwise.
fn rotation_now(clock_source: ArchiveClock, clock: &PtpClock, frame_ts_ns: Option<u64>) -> u64 {
    match clock_source {
        ArchiveClock::Ptp => frame_ts_ns.unwrap_or_else(|| {
            let now = clock.now_ns();
            if now != 0 {
                now
            } else {
                system_now_ns()
            }
        }),
        _ => system_now_ns(),
    }
}

struct WorkerState {
    queue: Arc<FrameQueue>,
    clock: Arc<PtpClock>,
    policy: ArchivePolicy,
    sink_params: SinkParams,
    meter: LevelMeter,
    vox: Option<VoxDetector>,
    config: WorkerConfig,
    sink: Option<Box<dyn Sink>>,
}

impl WorkerState {
    fn run(&mut self, shared: &WorkerShared) -> Result<()> {
        let idle = Duration::from_micros(self.config.idle_sleep_us.max(1));
        while shared.running.load(Ordering::Acquire) {
            let Some(frame) = self.queue.pop() else {
                thread::sleep(idle);
                continue;
            };
            shared.frames_processed.fetch_add(1, Ordering::Relaxed);
            self.handle_frame(frame, shared)?;
        }
        Ok(())
    }

    fn handle_frame(&mut self, frame: FrameHandle, shared: &WorkerShared) -> Result<()> {
        let now_ns = rotation_now(
            self.policy.clock_source(),
            &self.clock,
            Some(frame.timestamp_ns()),
        );

        // Boundary rotation. While VOX holds the sink closed the boundary is
        // left pending; the next VOX open lands in the current period.
        if self.sink.is_some() && self.policy.should_rotate(now_ns) {
            self.close_sink()?;
            self.open_sink(now_ns, shared)?;
        }

        let (levels, report) = self.meter.process(frame.samples(), frame.channels());
        if self.config.levels_enabled {
            if let Some(report) = report {
                emit_levels(&report);
            }
        }

        // Both latches are set inside process(); reading them here keeps the
        // detector borrow short.
        let (to_write, vox_opened, vox_closed) = match self.vox.as_mut() {
            Some(vox) => {
                let frames = vox.process(frame, &levels);
                (frames, vox.should_open_file(), vox.should_close_file())
            }
            None => (vec![frame], false, false),
        };

        if vox_opened {
            // A fresh take gets a fresh file regardless of boundary.
            self.close_sink()?;
            self.open_sink(now_ns, shared)?;
        }
        for out_frame in &to_write {
            self.write_frame(out_frame, shared)?;
        }
        drop(to_write);
        if vox_closed {
            self.close_sink()?;
        }
        Ok(())
    }

    fn write_frame(&mut self, frame: &FrameHandle, shared: &WorkerShared) -> Result<()> {
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        sink.write(frame.samples(), frame.channels())?;
        shared.frames_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn open_sink(&mut self, now_ns: u64, shared: &WorkerShared) -> Result<()> {
        let path = self.policy.next_path(now_ns)?;
        self.sink = Some(open_sink(&path, &self.sink_params)?);
        self.policy.advance();
        shared.files_opened.fetch_add(1, Ordering::Relaxed);
        log::info!("worker: recording to {}", path.display());
        Ok(())
    }

    fn close_sink(&mut self) -> Result<()> {
        if let Some(mut sink) = self.sink.take() {
            sink.finish()?;
            log::debug!("worker: closed {}", sink.path().display());
        }
        Ok(())
    }

    fn teardown(&mut self, shared: &WorkerShared) {
        if self.config.drain_on_stop && !shared.failed.load(Ordering::Acquire) {
            while let Some(frame) = self.queue.pop() {
                shared.frames_processed.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.handle_frame(frame, shared) {
                    log::warn!("worker: drain aborted: {}", e);
                    break;
                }
            }
        }
        if let Err(e) = self.close_sink() {
            log::error!("worker: final close failed: {}", e);
            let mut last_error = shared.last_error.lock();
            if last_error.is_none() {
                *last_error = Some(e.to_string());
            }
            shared.failed.store(true, Ordering::Release);
        }
        log::info!(
            "worker: stopped ({} frames processed, {} written, {} files)",
            shared.frames_processed.load(Ordering::Relaxed),
            shared.frames_written.load(Ordering::Relaxed),
            shared.files_opened.load(Ordering::Relaxed),
        );
    }
}

fn emit_levels(report: &LevelsReport) {
    if let Some(line) = report.to_json_line() {
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}", line);
        let _ = stdout.flush();
    }
}
