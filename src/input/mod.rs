//! AES67 input module.
//! Receives and decodes AES67 RTP multicast streams into pooled PCM frames.

pub mod jitter;
pub mod rtp;
pub mod stream;

pub use stream::{InputDriver, InputStats, RtpInput, RtpInputConfig};
