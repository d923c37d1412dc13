//! Error taxonomy shared by all components.
//!
//! Pool exhaustion and queue saturation are deliberately not errors: they are
//! back-pressure, reported as `None` / a rejected push and counted by the
//! producer. Malformed RTP packets likewise never surface as errors; the
//! parser returns `None` and the input driver counts them.

use thiserror::Error;

/// Errors surfaced across component boundaries.
#[derive(Debug, Error)]
pub enum Error {
    /// The caller supplied an impossible configuration. Fatal at
    /// construct/open time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// File open/read/write/sync/mkdir failure. Sinks and the archive policy
    /// do not retry.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Socket create/bind/recv failure.
    #[error("network error: {0}")]
    Network(String),

    /// The Opus encoder rejected input. Fatal for the sink.
    #[error("encode error: {0}")]
    Encode(String),

    /// The selected PTP source is not readable.
    #[error("clock unavailable: {0}")]
    ClockUnavailable(String),

    /// A write would push a WAV file past the 32-bit RIFF size limit.
    #[error("file size limit reached")]
    SizeLimit,
}

pub type Result<T> = std::result::Result<T, Error>;
