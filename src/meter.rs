//! Per-channel RMS and peak metering.
//!
//! The meter serves two consumers: the VOX detector wants per-frame levels,
//! and the `--levels` emission wants interval reports. Both come out of one
//! pass over the samples. Levels are clamped to a -60 dB silence floor.

use serde::Serialize;

/// Metering covers at most two channels; wider frames meter their first two.
pub const METER_MAX_CHANNELS: usize = 2;
/// Silence floor for all reported levels.
pub const SILENCE_FLOOR_DB: f32 = -60.0;
/// Absolute sample value treated as clipping.
pub const CLIP_THRESHOLD: f32 = 0.99;
/// Peak-hold decay window.
pub const PEAK_HOLD_SECS: f32 = 1.5;

#[derive(Debug, Clone)]
pub struct MeterConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Report emission interval in milliseconds
    pub interval_ms: u32,
}

/// Levels of a single processed frame, for the VOX detector.
#[derive(Debug, Clone, Copy)]
pub struct FrameLevels {
    pub channels: usize,
    pub rms_db: [f32; METER_MAX_CHANNELS],
    pub peak_db: [f32; METER_MAX_CHANNELS],
}

/// One channel of an interval report.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChannelLevel {
    pub rms_db: f32,
    pub peak_db: f32,
    pub clipping: bool,
}

/// Interval report emitted on stdout when `--levels` is enabled.
#[derive(Debug, Clone)]
pub struct LevelsReport {
    pub channels: usize,
    pub left: ChannelLevel,
    pub right: Option<ChannelLevel>,
}

#[derive(Serialize)]
struct LevelsLine {
    #[serde(rename = "type")]
    kind: &'static str,
    channels: usize,
    left: ChannelLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    right: Option<ChannelLevel>,
}

impl LevelsReport {
    /// Serialize to the single-line JSON shape, all dB values one-decimal.
    pub fn to_json_line(&self) -> Option<String> {
        let line = LevelsLine {
            kind: "levels",
            channels: self.channels,
            left: round_channel(self.left),
            right: self.right.map(round_channel),
        };
        serde_json::to_string(&line).ok()
    }
}

fn round_channel(level: ChannelLevel) -> ChannelLevel {
    ChannelLevel {
        rms_db: round1(level.rms_db),
        peak_db: round1(level.peak_db),
        clipping: level.clipping,
    }
}

fn round1(x: f32) -> f32 {
    (x * 10.0).round() / 10.0
}

/// Amplitude (0..1) to clamped decibels.
fn amplitude_to_db(amplitude: f32) -> f32 {
    if amplitude <= 0.0 {
        return SILENCE_FLOOR_DB;
    }
    (20.0 * amplitude.log10()).clamp(SILENCE_FLOOR_DB, 0.0)
}

/// RMS + peak detector with interval reporting and peak hold.
pub struct LevelMeter {
    channels: usize,
    interval_samples: u64,
    samples_accumulated: u64,
    sum_squares: [f64; METER_MAX_CHANNELS],
    peak: [f32; METER_MAX_CHANNELS],
    peak_hold_db: [f32; METER_MAX_CHANNELS],
    hold_decay_db: f32,
}

impl LevelMeter {
    pub fn new(config: &MeterConfig) -> Self {
        let interval_samples =
            (config.sample_rate as u64 * config.interval_ms.max(1) as u64) / 1000;
        let interval_secs = config.interval_ms.max(1) as f32 / 1000.0;
        Self {
            channels: (config.channels as usize).min(METER_MAX_CHANNELS),
            interval_samples: interval_samples.max(1),
            samples_accumulated: 0,
            sum_squares: [0.0; METER_MAX_CHANNELS],
            peak: [0.0; METER_MAX_CHANNELS],
            peak_hold_db: [SILENCE_FLOOR_DB; METER_MAX_CHANNELS],
            hold_decay_db: -SILENCE_FLOOR_DB * interval_secs / PEAK_HOLD_SECS,
        }
    }

    /// Measure one frame of interleaved samples. Returns the frame's own
    /// levels and, when an emission interval has elapsed, an interval report.
    pub fn process(
        &mut self,
        samples: &[f32],
        frame_channels: u16,
    ) -> (FrameLevels, Option<LevelsReport>) {
        let stride = frame_channels.max(1) as usize;
        let sample_frames = samples.len() / stride;

        let mut frame_sum_squares = [0.0f64; METER_MAX_CHANNELS];
        let mut frame_peak = [0.0f32; METER_MAX_CHANNELS];

        for frame in 0..sample_frames {
            for ch in 0..self.channels.min(stride) {
                let sample = samples[frame * stride + ch];
                frame_sum_squares[ch] += (sample as f64) * (sample as f64);
                let magnitude = sample.abs();
                if magnitude > frame_peak[ch] {
                    frame_peak[ch] = magnitude;
                }
            }
        }

        let mut levels = FrameLevels {
            channels: self.channels,
            rms_db: [SILENCE_FLOOR_DB; METER_MAX_CHANNELS],
            peak_db: [SILENCE_FLOOR_DB; METER_MAX_CHANNELS],
        };
        for ch in 0..self.channels {
            if sample_frames > 0 {
                let rms = (frame_sum_squares[ch] / sample_frames as f64).sqrt() as f32;
                levels.rms_db[ch] = amplitude_to_db(rms);
                levels.peak_db[ch] = amplitude_to_db(frame_peak[ch]);
            }
            self.sum_squares[ch] += frame_sum_squares[ch];
            if frame_peak[ch] > self.peak[ch] {
                self.peak[ch] = frame_peak[ch];
            }
        }
        self.samples_accumulated += sample_frames as u64;

        let report = if self.samples_accumulated >= self.interval_samples {
            Some(self.emit_interval())
        } else {
            None
        };
        (levels, report)
    }

    fn emit_interval(&mut self) -> LevelsReport {
        let n = self.samples_accumulated.max(1);
        let mut channel_levels = [ChannelLevel {
            rms_db: SILENCE_FLOOR_DB,
            peak_db: SILENCE_FLOOR_DB,
            clipping: false,
        }; METER_MAX_CHANNELS];

        for ch in 0..self.channels {
            let rms = (self.sum_squares[ch] / n as f64).sqrt() as f32;
            let peak_db = amplitude_to_db(self.peak[ch]);
            channel_levels[ch] = ChannelLevel {
                rms_db: amplitude_to_db(rms),
                peak_db,
                clipping: self.peak[ch] >= CLIP_THRESHOLD,
            };
            // Linear peak-hold decay, refreshed by louder intervals.
            let decayed = self.peak_hold_db[ch] - self.hold_decay_db;
            self.peak_hold_db[ch] = peak_db.max(decayed).max(SILENCE_FLOOR_DB);

            self.sum_squares[ch] = 0.0;
            self.peak[ch] = 0.0;
        }
        self.samples_accumulated = 0;

        LevelsReport {
            channels: self.channels,
            left: channel_levels[0],
            right: (self.channels > 1).then_some(channel_levels[1]),
        }
    }

    /// Decayed peak-hold level per channel.
    pub fn peak_hold_db(&self, channel: usize) -> f32 {
        self.peak_hold_db[channel.min(METER_MAX_CHANNELS - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meter(channels: u16, interval_ms: u32) -> LevelMeter {
        LevelMeter::new(&MeterConfig {
            sample_rate: 48000,
            channels,
            interval_ms,
        })
    }

    /// Generate a full-scale-relative sine at the given amplitude.
    fn sine(amplitude: f32, samples: usize) -> Vec<f32> {
        (0..samples)
            .map(|i| amplitude * (i as f32 * 0.1).sin())
            .collect()
    }

    #[test]
    fn test_silence_is_floored() {
        let mut m = meter(1, 10);
        let silence = vec![0.0f32; 480];
        let (levels, report) = m.process(&silence, 1);
        assert_eq!(levels.rms_db[0], SILENCE_FLOOR_DB);
        assert_eq!(levels.peak_db[0], SILENCE_FLOOR_DB);
        let report = report.expect("480 samples is one 10ms interval");
        assert_eq!(report.left.rms_db, SILENCE_FLOOR_DB);
        assert!(!report.left.clipping);
    }

    #[test]
    fn test_full_scale_sine_levels() {
        let mut m = meter(1, 10);
        let (levels, _) = m.process(&sine(1.0, 480), 1);
        // Full-scale sine: peak 0 dB, RMS about -3 dB.
        assert!(levels.peak_db[0] > -0.1);
        assert!((levels.rms_db[0] + 3.0).abs() < 0.5);
    }

    /// Levels stay within [-60, 0] and rms <= peak.
    #[test]
    fn test_level_ranges() {
        let mut m = meter(1, 1000);
        for amplitude in [0.0f32, 1e-6, 0.001, 0.1, 0.5, 1.0, 2.0] {
            let (levels, _) = m.process(&sine(amplitude, 480), 1);
            assert!(levels.rms_db[0] >= SILENCE_FLOOR_DB);
            assert!(levels.rms_db[0] <= 0.0);
            assert!(levels.peak_db[0] >= SILENCE_FLOOR_DB);
            assert!(levels.peak_db[0] <= 0.0);
            assert!(levels.rms_db[0] <= levels.peak_db[0] + 1e-3);
        }
    }

    #[test]
    fn test_clipping_flag() {
        let mut m = meter(1, 10);
        let loud = vec![0.995f32; 480];
        let (_, report) = m.process(&loud, 1);
        assert!(report.unwrap().left.clipping);

        let quiet = vec![0.5f32; 480];
        let (_, report) = m.process(&quiet, 1);
        assert!(!report.unwrap().left.clipping);
    }

    #[test]
    fn test_stereo_channels_independent() {
        let mut m = meter(2, 10);
        // Left silent, right loud.
        let mut samples = vec![0.0f32; 480 * 2];
        for frame in 0..480 {
            samples[frame * 2 + 1] = 0.5;
        }
        let (levels, report) = m.process(&samples, 2);
        assert_eq!(levels.rms_db[0], SILENCE_FLOOR_DB);
        assert!((levels.rms_db[1] - 20.0 * 0.5f32.log10()).abs() < 0.1);

        let report = report.unwrap();
        assert_eq!(report.channels, 2);
        assert!(report.right.is_some());
    }

    #[test]
    fn test_json_shape() {
        let report = LevelsReport {
            channels: 1,
            left: ChannelLevel {
                rms_db: -18.34,
                peak_db: -6.04,
                clipping: false,
            },
            right: None,
        };
        let line = report.to_json_line().unwrap();
        assert_eq!(
            line,
            r#"{"type":"levels","channels":1,"left":{"rms_db":-18.3,"peak_db":-6.0,"clipping":false}}"#
        );

        let stereo = LevelsReport {
            channels: 2,
            left: ChannelLevel {
                rms_db: -18.3,
                peak_db: -6.0,
                clipping: false,
            },
            right: Some(ChannelLevel {
                rms_db: -20.0,
                peak_db: -8.5,
                clipping: true,
            }),
        };
        let line = stereo.to_json_line().unwrap();
        assert!(line.contains(r#""channels":2"#));
        assert!(line.contains(r#""right":{"rms_db":-20.0,"peak_db":-8.5,"clipping":true}"#));
    }

    #[test]
    fn test_interval_accumulates_across_frames() {
        let mut m = meter(1, 10); // 480 samples
        let chunk = vec![0.1f32; 100];
        for _ in 0..4 {
            let (_, report) = m.process(&chunk, 1);
            assert!(report.is_none());
        }
        let (_, report) = m.process(&chunk, 1);
        assert!(report.is_some());
    }

    #[test]
    fn test_peak_hold_decays() {
        let mut m = meter(1, 100);
        let loud = vec![1.0f32; 4800];
        m.process(&loud, 1);
        let held = m.peak_hold_db(0);
        assert!(held > -0.1);

        let silence = vec![0.0f32; 4800];
        for _ in 0..3 {
            m.process(&silence, 1);
        }
        // 0.1s intervals decay 4 dB each (60 dB / 1.5 s).
        let decayed = m.peak_hold_db(0);
        assert!(decayed < held - 10.0);
        assert!(decayed >= SILENCE_FLOOR_DB);
    }
}
