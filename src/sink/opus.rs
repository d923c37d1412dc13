//! Ogg Opus sink.
//!
//! Encodes 20 ms frames with libopus and muxes them into an Ogg stream:
//! OpusHead and OpusTags each on their own flushed page, audio packets with
//! a granule position tracked in 48 kHz units starting at -pre-skip, and an
//! e_o_s-marked final page on close.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use audiopus::{coder::Encoder, Application, Bitrate, Channels, SampleRate};
use ogg::{PacketWriteEndInfo, PacketWriter};
use rand::Rng;

use crate::error::{Error, Result};

use super::{Sink, SinkParams};

/// Samples a decoder discards at stream start, in 48 kHz units.
pub const PRE_SKIP: u16 = 312;

const BITRATE_MIN: i32 = 6_000;
const BITRATE_MAX: i32 = 510_000;
const DEFAULT_BITRATE_MONO: i32 = 64_000;
const DEFAULT_BITRATE_STEREO: i32 = 96_000;

/// Encoder frame duration is fixed at 20 ms (rate / 50).
const FRAMES_PER_SEC: u32 = 50;
/// Input FIFO hard cap in seconds of audio.
const FIFO_LIMIT_SECS: usize = 10;
/// Recommended maximum Opus packet size.
const MAX_PACKET_BYTES: usize = 4000;

/// Ogg Opus encoder sink.
pub struct OpusSink {
    writer: Option<PacketWriter<'static, BufWriter<File>>>,
    encoder: Encoder,
    path: PathBuf,
    sample_rate: u32,
    channels: u16,
    /// Samples per encoder frame, per channel
    frame_size: usize,
    /// Granule advance of one full frame, in 48 kHz units
    granule_per_frame: i64,
    granulepos: i64,
    packet_count: u64,
    serial: u32,
    fifo: VecDeque<f32>,
    fifo_limit: usize,
    frame_scratch: Vec<f32>,
    packet_scratch: Vec<u8>,
    wrote_audio: bool,
    fsync: bool,
}

impl OpusSink {
    pub fn create(path: &Path, params: &SinkParams) -> Result<Self> {
        let opus_rate = match params.sample_rate {
            8_000 => SampleRate::Hz8000,
            12_000 => SampleRate::Hz12000,
            16_000 => SampleRate::Hz16000,
            24_000 => SampleRate::Hz24000,
            48_000 => SampleRate::Hz48000,
            other => {
                return Err(Error::InvalidConfig(format!(
                    "opus requires a sample rate of 8/12/16/24/48 kHz, got {}",
                    other
                )))
            }
        };
        let opus_channels = match params.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => {
                return Err(Error::InvalidConfig(format!(
                    "opus requires 1 or 2 channels, got {}",
                    other
                )))
            }
        };

        let bitrate = if params.bitrate == 0 {
            match params.channels {
                1 => DEFAULT_BITRATE_MONO,
                _ => DEFAULT_BITRATE_STEREO,
            }
        } else {
            (params.bitrate as i32).clamp(BITRATE_MIN, BITRATE_MAX)
        };

        let mut encoder = Encoder::new(opus_rate, opus_channels, Application::Audio)
            .map_err(|e| Error::Encode(format!("failed to create opus encoder: {}", e)))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(bitrate))
            .map_err(|e| Error::Encode(format!("failed to set bitrate: {}", e)))?;
        encoder
            .set_vbr(params.vbr)
            .map_err(|e| Error::Encode(format!("failed to set vbr: {}", e)))?;
        encoder
            .set_complexity(params.complexity.min(10))
            .map_err(|e| Error::Encode(format!("failed to set complexity: {}", e)))?;

        let frame_size = (params.sample_rate / FRAMES_PER_SEC) as usize;
        let granule_per_frame = (frame_size as u64 * 48_000 / params.sample_rate as u64) as i64;

        // Nonzero serial so readers can tell streams apart.
        let mut rng = rand::thread_rng();
        let serial = loop {
            let serial: u32 = rng.gen();
            if serial != 0 {
                break serial;
            }
        };

        let file = File::create(path)?;
        let mut writer = PacketWriter::new(BufWriter::new(file));

        // OpusHead and OpusTags each end their own page ahead of any audio.
        writer
            .write_packet(
                opus_head(params.channels, params.sample_rate).to_vec(),
                serial,
                PacketWriteEndInfo::EndPage,
                0,
            )
            .map_err(Error::Io)?;
        writer
            .write_packet(opus_tags(), serial, PacketWriteEndInfo::EndPage, 0)
            .map_err(Error::Io)?;

        Ok(Self {
            writer: Some(writer),
            encoder,
            path: path.to_path_buf(),
            sample_rate: params.sample_rate,
            channels: params.channels,
            frame_size,
            granule_per_frame,
            granulepos: -(PRE_SKIP as i64),
            packet_count: 2,
            serial,
            fifo: VecDeque::new(),
            fifo_limit: FIFO_LIMIT_SECS * params.sample_rate as usize * params.channels as usize,
            frame_scratch: vec![0.0; frame_size * params.channels as usize],
            packet_scratch: vec![0u8; MAX_PACKET_BYTES],
            wrote_audio: false,
            fsync: params.fsync,
        })
    }

    fn granule_u64(&self) -> u64 {
        self.granulepos.max(0) as u64
    }

    /// Encode the scratch frame and hand the packet to the muxer.
    fn encode_frame(&mut self, granule_advance: i64, end_info: PacketWriteEndInfo) -> Result<()> {
        let encoded = self
            .encoder
            .encode_float(&self.frame_scratch[..], &mut self.packet_scratch)
            .map_err(|e| Error::Encode(format!("opus encode failed: {}", e)))?;

        self.granulepos += granule_advance;
        let Some(writer) = self.writer.as_mut() else {
            return Err(Error::Encode("opus sink already closed".into()));
        };
        writer
            .write_packet(
                self.packet_scratch[..encoded].to_vec(),
                self.serial,
                end_info,
                self.granulepos.max(0) as u64,
            )
            .map_err(Error::Io)?;
        self.packet_count += 1;
        self.wrote_audio = true;
        Ok(())
    }

    /// Encode every full frame buffered in the FIFO.
    fn drain_full_frames(&mut self) -> Result<()> {
        let frame_samples = self.frame_size * self.channels as usize;
        while self.fifo.len() >= frame_samples {
            self.frame_scratch.clear();
            self.frame_scratch.extend(self.fifo.drain(..frame_samples));
            self.encode_frame(self.granule_per_frame, PacketWriteEndInfo::NormalPacket)?;
        }
        Ok(())
    }
}

impl Sink for OpusSink {
    fn write(&mut self, samples: &[f32], channels: u16) -> Result<()> {
        if self.writer.is_none() {
            return Err(Error::Encode("opus sink already closed".into()));
        }
        if channels != self.channels {
            return Err(Error::InvalidConfig(format!(
                "opus sink opened with {} channels, write supplied {}",
                self.channels, channels
            )));
        }
        if self.fifo.len() + samples.len() > self.fifo_limit {
            log::warn!(
                "opus sink: sample fifo overflow ({} queued), rejecting write",
                self.fifo.len()
            );
            return Err(Error::Encode("sample fifo overflow".into()));
        }

        self.fifo.extend(samples.iter().copied());
        self.drain_full_frames()
    }

    fn finish(&mut self) -> Result<()> {
        if self.writer.is_none() {
            return Ok(());
        }

        if !self.fifo.is_empty() {
            // Zero-pad the partial frame; the granule advances only by the
            // real samples so decoders trim the padding.
            let remaining_frames = self.fifo.len() / self.channels as usize;
            let frame_samples = self.frame_size * self.channels as usize;
            self.frame_scratch.clear();
            self.frame_scratch.extend(self.fifo.drain(..));
            self.frame_scratch.resize(frame_samples, 0.0);
            let advance = remaining_frames as u64 * 48_000 / self.sample_rate as u64;
            self.encode_frame(advance as i64, PacketWriteEndInfo::EndStream)?;
        } else {
            // All frames aligned (or no audio): an empty packet carries the
            // end-of-stream marker at the final granule position.
            let granule = self.granule_u64();
            let Some(writer) = self.writer.as_mut() else {
                return Ok(());
            };
            writer
                .write_packet(Vec::new(), self.serial, PacketWriteEndInfo::EndStream, granule)
                .map_err(Error::Io)?;
            self.packet_count += 1;
        }

        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let mut file_writer = writer.into_inner();
        file_writer.flush()?;
        if self.fsync {
            file_writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OpusSink {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(e) = self.finish() {
                log::error!("opus sink: close of {} failed: {}", self.path.display(), e);
            }
        }
    }
}

/// Serialize the 19-byte OpusHead packet (RFC 7845).
fn opus_head(channels: u16, sample_rate: u32) -> [u8; 19] {
    let mut head = [0u8; 19];
    head[0..8].copy_from_slice(b"OpusHead");
    head[8] = 1; // version
    head[9] = channels as u8;
    head[10..12].copy_from_slice(&PRE_SKIP.to_le_bytes());
    head[12..16].copy_from_slice(&sample_rate.to_le_bytes());
    head[16..18].copy_from_slice(&0i16.to_le_bytes()); // output gain
    head[18] = 0; // channel mapping family
    head
}

/// Version string of the linked Opus library, for the OpusTags vendor
/// field (e.g. "libopus 1.4").
fn vendor_string() -> &'static str {
    // SAFETY: opus_get_version_string returns a static NUL-terminated
    // string owned by the library.
    unsafe { std::ffi::CStr::from_ptr(audiopus_sys::opus_get_version_string()) }
        .to_str()
        .unwrap_or("libopus")
}

/// Serialize the OpusTags packet: library vendor string plus a single
/// ENCODER comment.
fn opus_tags() -> Vec<u8> {
    let vendor = vendor_string();
    let comment = concat!("ENCODER=aircheck ", env!("CARGO_PKG_VERSION"));

    let mut tags = Vec::with_capacity(8 + 4 + vendor.len() + 4 + 4 + comment.len());
    tags.extend_from_slice(b"OpusTags");
    tags.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    tags.extend_from_slice(vendor.as_bytes());
    tags.extend_from_slice(&1u32.to_le_bytes()); // one user comment
    tags.extend_from_slice(&(comment.len() as u32).to_le_bytes());
    tags.extend_from_slice(comment.as_bytes());
    tags
}
