//! aircheck: 24/7 AES67/RTP audio capture and archival engine.
//!
//! AES67 multicast audio is received and reordered, timestamped against a
//! PTP clock, assembled into pooled float32 PCM frames, optionally gated by
//! a voice-activity detector, and written to a rotated archive as WAV or
//! Ogg Opus.
//!
//! Audio format notes:
//! - AES67 carries 48 kHz linear PCM over RTP, 16- or 24-bit big-endian
//! - The pipeline works in 32-bit float throughout
//! - WAV archives are PCM16 little-endian; Opus archives are standard
//!   Ogg Opus at 20 ms framing

pub mod archive;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod frame;
pub mod input;
pub mod meter;
pub mod sink;
pub mod vox;
pub mod worker;

pub use config::{Cli, Config};
pub use engine::Engine;
pub use error::{Error, Result};
