//! Archive sinks.
//! A sink owns one open archive file; the worker writes interleaved float32
//! frames into it and closes it on rotation or shutdown.

pub mod opus;
pub mod wav;

use std::path::Path;

pub use opus::OpusSink;
pub use wav::WavSink;

use crate::error::{Error, Result};

/// Selected archive encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFormat {
    Wav,
    Opus,
}

impl SinkFormat {
    /// Map an archive suffix / file extension to a sink format.
    pub fn from_suffix(suffix: &str) -> Result<Self> {
        match suffix.to_ascii_lowercase().as_str() {
            "wav" => Ok(SinkFormat::Wav),
            "opus" | "ogg" => Ok(SinkFormat::Opus),
            other => Err(Error::InvalidConfig(format!(
                "unsupported archive format '{}' (expected wav, opus or ogg)",
                other
            ))),
        }
    }
}

/// Everything needed to open a new archive file.
#[derive(Debug, Clone)]
pub struct SinkParams {
    pub format: SinkFormat,
    pub sample_rate: u32,
    pub channels: u16,
    /// Opus bitrate in bits/s; 0 selects the per-channel-count default
    pub bitrate: u32,
    pub vbr: bool,
    pub complexity: u8,
    /// Sync file contents after writes and on close
    pub fsync: bool,
}

/// One open archive file.
pub trait Sink: Send {
    /// Append interleaved float32 samples. `channels` must match the count
    /// the sink was opened with.
    fn write(&mut self, samples: &[f32], channels: u16) -> Result<()>;

    /// Finalize the file (patch headers / write EOS). The sink must not be
    /// used afterwards.
    fn finish(&mut self) -> Result<()>;

    fn path(&self) -> &Path;
}

/// Open a sink of the configured format at `path`.
pub fn open_sink(path: &Path, params: &SinkParams) -> Result<Box<dyn Sink>> {
    match params.format {
        SinkFormat::Wav => Ok(Box::new(WavSink::create(
            path,
            params.sample_rate,
            params.channels,
            params.fsync,
        )?)),
        SinkFormat::Opus => Ok(Box::new(OpusSink::create(path, params)?)),
    }
}

/// Float sample to PCM16 with saturation.
pub(crate) fn f32_to_pcm16(sample: f32) -> i16 {
    let scaled = (sample.clamp(-1.0, 1.0) * 32767.0).round();
    scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}
