//! Hardware audio output/input and the ring buffer between them
//!
//! Both directions follow the same shape: negotiate once at open time, then
//! move bytes between an application thread and a real-time hardware
//! callback through a lock-free [`RingBuffer`].

pub mod backend;
mod buffer;
pub mod hardware;
mod input;
mod output;

#[cfg(feature = "cpal")]
pub mod cpal_host;

pub use backend::{
    AudioHost, AudioStream, DeviceCapabilities, DeviceInfo, Direction, InputCallback,
    OutputCallback, StreamRequest,
};
pub use buffer::{Consumer, Producer, RingBuffer};
pub use hardware::{LatencyProfile, StreamNegotiation};
pub use input::{
    read_promise, HardwareAudioInput, ReadFuture, ReadPromise, ReadRejected,
    DEFAULT_READ_CHUNK_BYTES, INPUT_RING_CAPACITY,
};
pub use output::{HardwareAudioOutput, OUTPUT_RING_CAPACITY};

/// PCM sample representation on the wire to the DAC/ADC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    /// Signed 16-bit little endian
    S16Le,
    /// Signed 24-bit little endian packed in 3 bytes
    S24Le3,
    /// Signed 32-bit little endian
    S32Le,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::S16Le => 2,
            SampleFormat::S24Le3 => 3,
            SampleFormat::S32Le => 4,
        }
    }

    /// Significant bits per sample
    pub fn bits(&self) -> u32 {
        match self {
            SampleFormat::S16Le => 16,
            SampleFormat::S24Le3 => 24,
            SampleFormat::S32Le => 32,
        }
    }
}

impl std::fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SampleFormat::S16Le => "S16_LE",
            SampleFormat::S24Le3 => "S24_3LE",
            SampleFormat::S32Le => "S32_LE",
        };
        f.write_str(name)
    }
}

/// Audio format information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    /// Interleaved 16-bit PCM, the projection session format
    pub fn s16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format: SampleFormat::S16Le,
        }
    }

    /// Bytes per interleaved frame
    pub fn block_align(&self) -> usize {
        self.channels as usize * self.sample_format.bytes_per_sample()
    }

    /// Calculate bytes per second
    pub fn bytes_per_second(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }

    /// Calculate buffer size in bytes for given milliseconds
    pub fn buffer_size_for_ms(&self, ms: u32) -> usize {
        ((self.bytes_per_second() as u64 * ms as u64) / 1000) as usize
    }

    /// Calculate number of frames for given bytes
    pub fn bytes_to_frames(&self, bytes: usize) -> u32 {
        (bytes / self.block_align()) as u32
    }

    /// Calculate bytes for given number of frames
    pub fn frames_to_bytes(&self, frames: u32) -> usize {
        frames as usize * self.block_align()
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Hz {}ch {}",
            self.sample_rate, self.channels, self.sample_format
        )
    }
}
