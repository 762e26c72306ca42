//! headunit-sink - real-time media sink for automotive head-units
//!
//! Renders projection PCM audio and H.264 video to hardware with minimal
//! latency, captures microphone audio, and plays local music files through
//! the same output negotiation.

pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod player;
pub mod video;

#[cfg(test)]
mod testing;

pub use error::{Result, SinkError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
