//! Voice-activity gated recording.
//!
//! A four-state machine driven by the per-frame levels the meter computes.
//! While idle it keeps a bounded pre-roll ring of recent frames so the
//! beginning of a detected event is not lost; entering ACTIVE flushes the
//! ring ahead of the triggering frame. File open/close requests are latched
//! and cleared when the worker reads them.

use std::collections::VecDeque;

use crate::frame::FrameHandle;
use crate::meter::FrameLevels;

/// How the per-channel levels collapse into one gate level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoxLevelMode {
    /// Average RMS across channels
    Rms,
    /// Average peak across channels
    Peak,
    /// Maximum RMS of any channel
    Any,
}

#[derive(Debug, Clone)]
pub struct VoxConfig {
    /// Open threshold in dB
    pub threshold_db: f32,
    /// Close threshold in dB; 0.0 selects threshold - 5 dB
    pub release_db: f32,
    /// Audio must stay above threshold this long before opening
    pub detection_ms: u32,
    /// Audio must stay below release this long before closing
    pub hangover_ms: u32,
    /// Audio kept from before the trigger
    pub preroll_ms: u32,
    pub level_mode: VoxLevelMode,
    pub sample_rate: u32,
    /// Nominal samples per frame, used to size the pre-roll ring
    pub samples_per_frame: u32,
}

/// Lowest allowed effective release threshold.
const RELEASE_FLOOR_DB: f32 = -60.0;
/// Auto release offset below the open threshold.
const AUTO_RELEASE_OFFSET_DB: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoxState {
    Idle,
    Detecting,
    Active,
    Hangover,
}

/// Level-gated state machine with pre-roll.
pub struct VoxDetector {
    threshold_db: f32,
    effective_release_db: f32,
    detection_samples: u64,
    hangover_samples: u64,
    level_mode: VoxLevelMode,
    state: VoxState,
    state_enter_sample: u64,
    samples_processed: u64,
    preroll: VecDeque<FrameHandle>,
    preroll_capacity: usize,
    should_open: bool,
    should_close: bool,
}

impl VoxDetector {
    pub fn new(config: &VoxConfig) -> Self {
        let rate = config.sample_rate as u64;
        let spf = config.samples_per_frame.max(1) as u64;
        let effective_release_db = if config.release_db == 0.0 {
            (config.threshold_db - AUTO_RELEASE_OFFSET_DB).max(RELEASE_FLOOR_DB)
        } else {
            config.release_db.min(config.threshold_db).max(RELEASE_FLOOR_DB)
        };
        // ceil(preroll_ms * rate / (1000 * spf)) + 1
        let preroll_frames = config.preroll_ms as u64 * rate;
        let preroll_capacity = (preroll_frames.div_ceil(1000 * spf) + 1) as usize;

        Self {
            threshold_db: config.threshold_db,
            effective_release_db,
            detection_samples: config.detection_ms as u64 * rate / 1000,
            hangover_samples: config.hangover_ms as u64 * rate / 1000,
            level_mode: config.level_mode,
            state: VoxState::Idle,
            state_enter_sample: 0,
            samples_processed: 0,
            preroll: VecDeque::with_capacity(preroll_capacity),
            preroll_capacity,
            should_open: false,
            should_close: false,
        }
    }

    pub fn state(&self) -> VoxState {
        self.state
    }

    pub fn effective_release_db(&self) -> f32 {
        self.effective_release_db
    }

    /// Latched open request; reading clears it.
    pub fn should_open_file(&mut self) -> bool {
        std::mem::take(&mut self.should_open)
    }

    /// Latched close request; reading clears it.
    pub fn should_close_file(&mut self) -> bool {
        std::mem::take(&mut self.should_close)
    }

    /// Run one frame through the gate. The returned frames (possibly
    /// including flushed pre-roll) are the ones to write; everything else is
    /// either retained in the pre-roll ring or released.
    pub fn process(&mut self, frame: FrameHandle, levels: &FrameLevels) -> Vec<FrameHandle> {
        let level = self.effective_level(levels);
        let enter_mark = self.samples_processed;
        self.samples_processed += frame.sample_frames() as u64;
        let samples_in_state = self.samples_processed - self.state_enter_sample;

        let mut output = Vec::new();
        match self.state {
            VoxState::Idle => {
                if level > self.threshold_db {
                    self.enter(VoxState::Detecting, enter_mark);
                }
                self.push_preroll(frame);
            }
            VoxState::Detecting => {
                if level <= self.threshold_db {
                    self.enter(VoxState::Idle, enter_mark);
                    self.push_preroll(frame);
                } else if samples_in_state >= self.detection_samples {
                    self.enter(VoxState::Active, enter_mark);
                    output.extend(self.preroll.drain(..));
                    output.push(frame);
                    self.should_open = true;
                } else {
                    self.push_preroll(frame);
                }
            }
            VoxState::Active => {
                if level < self.effective_release_db {
                    self.enter(VoxState::Hangover, enter_mark);
                }
                output.push(frame);
            }
            VoxState::Hangover => {
                if level > self.threshold_db {
                    self.enter(VoxState::Active, enter_mark);
                    output.push(frame);
                } else if samples_in_state >= self.hangover_samples {
                    self.enter(VoxState::Idle, enter_mark);
                    self.should_close = true;
                    // The transition frame is dropped; releasing the handle
                    // returns it to the pool.
                } else {
                    output.push(frame);
                }
            }
        }
        output
    }

    fn enter(&mut self, state: VoxState, enter_mark: u64) {
        self.state = state;
        self.state_enter_sample = enter_mark;
    }

    fn push_preroll(&mut self, frame: FrameHandle) {
        if self.preroll.len() >= self.preroll_capacity {
            // Overwrite-oldest; the popped handle releases its frame.
            self.preroll.pop_front();
        }
        self.preroll.push_back(frame);
    }

    fn effective_level(&self, levels: &FrameLevels) -> f32 {
        let n = levels.channels.max(1);
        match self.level_mode {
            VoxLevelMode::Any => levels.rms_db[..n]
                .iter()
                .fold(f32::NEG_INFINITY, |a, &b| a.max(b)),
            VoxLevelMode::Rms => levels.rms_db[..n].iter().sum::<f32>() / n as f32,
            VoxLevelMode::Peak => levels.peak_db[..n].iter().sum::<f32>() / n as f32,
        }
    }
}
