//! Orchestrator: owns every component and the process lifecycle.
//!
//! Construction wires pool, queue, clock, input driver and worker from a
//! validated configuration. `run` installs the signal-to-flag bridge, starts
//! capture, then parks the control thread until a signal arrives or a
//! component dies, and tears everything down in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::archive::ArchivePolicy;
use crate::clock::PtpClock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame::{queue::FrameQueue, FramePool};
use crate::input::{InputDriver, RtpInput};
use crate::meter::LevelMeter;
use crate::vox::VoxDetector;
use crate::worker::{Worker, WorkerParts};

/// Control-thread poll interval while the pipeline runs.
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(100);

/// Wires and supervises the capture pipeline.
pub struct Engine {
    input: Box<dyn InputDriver>,
    worker: Worker,
    shutdown: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        let clock = Arc::new(PtpClock::new(&config.ptp)?);
        if !clock.health_check() {
            log::warn!("ptp clock not readable yet; falling back to arrival timestamps");
        }

        let pool = FramePool::new(
            config.pool_frames,
            config.rtp.samples_per_frame as usize,
            config.rtp.output_channels,
        );
        let queue = FrameQueue::new(config.queue_frames);
        let policy = ArchivePolicy::new(config.archive.clone())?;
        let meter = LevelMeter::new(&config.meter);
        let vox = config.vox.as_ref().map(VoxDetector::new);

        let worker = Worker::start(WorkerParts {
            queue: Arc::clone(&queue),
            clock: Arc::clone(&clock),
            policy,
            sink_params: config.sink.clone(),
            meter,
            vox,
            config: config.worker.clone(),
        })?;

        let input = RtpInput::new(config.rtp.clone(), clock, pool, queue)?;

        Ok(Self {
            input: Box::new(input),
            worker,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Run until a termination signal or a fatal component error.
    pub fn run(&mut self) -> Result<()> {
        register_signals(&self.shutdown)?;

        if let Err(e) = self.input.start() {
            self.worker.stop();
            return Err(e);
        }
        log::info!("aircheck: capture running");

        while !self.shutdown.load(Ordering::Acquire)
            && self.worker.is_healthy()
            && self.input.is_healthy()
        {
            thread::sleep(SUPERVISE_INTERVAL);
        }

        if self.shutdown.load(Ordering::Acquire) {
            log::info!("aircheck: shutdown signal received");
        }

        // Stop the producer first so the worker can drain what remains.
        self.input.stop();
        self.worker.stop();

        if let Some(message) = self.worker.last_error() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                message,
            )));
        }
        log::info!("aircheck: stopped cleanly");
        Ok(())
    }
}

/// Thin signal-to-flag bridge: SIGINT and SIGTERM request shutdown, SIGHUP
/// is parked on a dead-end flag so it does nothing.
fn register_signals(shutdown: &Arc<AtomicBool>) -> Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGHUP, Arc::new(AtomicBool::new(false)))?;
    Ok(())
}
