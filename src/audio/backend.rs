//! Hardware audio subsystem seam
//!
//! Device enumeration, capability probing and stream creation sit behind
//! [`AudioHost`] so the sink logic runs the same against ALSA (through cpal)
//! or an in-process host in tests.

use crate::audio::{AudioFormat, SampleFormat};
use crate::error::Result;
use std::fmt;

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Output,
    Input,
}

/// Information about an audio device
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Backend-unique device id
    pub id: String,
    /// Human-readable device name (what configuration refers to)
    pub name: String,
    pub direction: Direction,
    /// Whether this is the system default for its direction
    pub is_default: bool,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let default_marker = if self.is_default { " (default)" } else { "" };
        write!(f, "{}{}", self.name, default_marker)
    }
}

impl fmt::Debug for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("is_default", &self.is_default)
            .finish()
    }
}

/// What a device accepts, as reported by its hardware parameter space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub min_rate: u32,
    pub max_rate: u32,
    pub max_channels: u16,
    pub formats: Vec<SampleFormat>,
}

impl DeviceCapabilities {
    pub fn supports_rate(&self, rate: u32) -> bool {
        rate >= self.min_rate && rate <= self.max_rate
    }

    pub fn supports_format(&self, format: SampleFormat) -> bool {
        self.formats.contains(&format)
    }
}

/// Parameters a stream is opened with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub device: DeviceInfo,
    pub format: AudioFormat,
    /// Frames per hardware callback
    pub buffer_frames: u32,
    /// Frames per period
    pub period_frames: u32,
    /// Number of periods the backend keeps queued
    pub buffers: u32,
}

/// Real-time output callback: fill the slice with interleaved PCM
///
/// Runs on the hardware thread. Must not block, allocate or panic.
pub type OutputCallback = Box<dyn FnMut(&mut [u8]) + Send + 'static>;

/// Real-time input callback: consume captured interleaved PCM
pub type InputCallback = Box<dyn FnMut(&[u8]) + Send + 'static>;

/// An opened hardware stream
///
/// Dropping the stream closes it and drops its callback.
pub trait AudioStream: Send {
    fn start(&mut self) -> Result<()>;

    /// Stop delivering callbacks; buffered hardware data is discarded
    fn stop(&mut self) -> Result<()>;

    fn is_running(&self) -> bool;
}

/// Audio subsystem: enumeration, probing, stream creation
pub trait AudioHost: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    fn devices(&self, direction: Direction) -> Result<Vec<DeviceInfo>>;

    fn default_device(&self, direction: Direction) -> Result<Option<DeviceInfo>>;

    fn capabilities(&self, device: &DeviceInfo) -> Result<DeviceCapabilities>;

    /// Open (but do not start) a playback stream
    fn open_output(
        &self,
        request: &StreamRequest,
        callback: OutputCallback,
    ) -> Result<Box<dyn AudioStream>>;

    /// Open (but do not start) a capture stream
    fn open_input(
        &self,
        request: &StreamRequest,
        callback: InputCallback,
    ) -> Result<Box<dyn AudioStream>>;
}
