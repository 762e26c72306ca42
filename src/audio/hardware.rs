//! Hardware capability negotiation for sample rate, format and buffer sizes

use crate::audio::backend::{DeviceCapabilities, DeviceInfo};
use crate::audio::{AudioFormat, SampleFormat};
use crate::error::{Result, SinkError};
use tracing::{debug, info};

/// Standard rates tried, highest first, when the DAC cannot take the source rate
pub const STANDARD_RATES: [u32; 6] = [192_000, 176_400, 96_000, 88_200, 48_000, 44_100];

/// Highest rate ever passed through unmodified
pub const NATIVE_OFFLOAD_CEILING: u32 = 192_000;

/// Rate used when no ladder rate fits the device range
pub const FALLBACK_RATE: u32 = 44_100;

/// Buffer sizing policy, chosen by who feeds the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyProfile {
    /// Projection audio: small fixed format, latency matters
    Projection,
    /// Local file playback: hi-res formats, underruns matter more than latency
    LocalPlayback,
}

impl LatencyProfile {
    /// Frames per hardware callback at the given rate
    ///
    /// Scaled with the rate so the buffered time stays about the same.
    pub fn buffer_frames(&self, rate: u32) -> u32 {
        match self {
            LatencyProfile::Projection => {
                let scaled = (4096u64 * rate as u64 / 48_000) as u32;
                scaled.max(256).next_power_of_two()
            }
            LatencyProfile::LocalPlayback => 8192 * rate_multiplier(rate),
        }
    }

    /// Frames per period at the given rate
    pub fn period_frames(&self, rate: u32) -> u32 {
        match self {
            LatencyProfile::Projection => self.buffer_frames(rate),
            LatencyProfile::LocalPlayback => 2048 * rate_multiplier(rate),
        }
    }

    /// Number of periods queued in hardware
    pub fn buffers(&self) -> u32 {
        match self {
            LatencyProfile::Projection => 4,
            LatencyProfile::LocalPlayback => 4,
        }
    }
}

/// Multiple of 44.1 kHz, rounded up; 1 at 44.1/48 kHz, 5 at 192 kHz
pub fn rate_multiplier(rate: u32) -> u32 {
    rate.div_ceil(44_100).max(1)
}

/// Decide the output rate for a source rate
///
/// Returns `(rate, native_offload)`. The source rate is passed through when
/// it is at or below the offload ceiling and inside the device range.
/// Otherwise the highest standard rate the device takes that does not exceed
/// the (capped) source rate is used; sources below the device minimum go up
/// to the lowest standard rate it takes. 44.1 kHz is the last resort.
pub fn negotiate_rate(source_rate: u32, caps: &DeviceCapabilities) -> (u32, bool) {
    if source_rate <= NATIVE_OFFLOAD_CEILING && caps.supports_rate(source_rate) {
        return (source_rate, true);
    }

    let target = source_rate.min(NATIVE_OFFLOAD_CEILING);
    let rate = STANDARD_RATES
        .iter()
        .copied()
        .find(|&rate| rate <= target && caps.supports_rate(rate))
        .or_else(|| {
            STANDARD_RATES
                .iter()
                .rev()
                .copied()
                .find(|&rate| caps.supports_rate(rate))
        })
        .unwrap_or(FALLBACK_RATE);

    (rate, false)
}

/// Pick the widest sample representation worth using
///
/// Hi-res material (more than 16 significant bits or above 48 kHz) prefers
/// S32, then packed S24. Everything else, and any DAC without those, gets S16.
pub fn negotiate_format(source_bits: u32, rate: u32, caps: &DeviceCapabilities) -> SampleFormat {
    if source_bits > 16 || rate > 48_000 {
        if caps.supports_format(SampleFormat::S32Le) {
            return SampleFormat::S32Le;
        }
        if caps.supports_format(SampleFormat::S24Le3) {
            return SampleFormat::S24Le3;
        }
    }
    SampleFormat::S16Le
}

/// Outcome of opening a stream: what the hardware accepted
///
/// Computed once per open and kept for reporting until the next open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamNegotiation {
    pub device: DeviceInfo,
    pub format: AudioFormat,
    /// Source rate passed through without resampling
    pub native_offload: bool,
    pub buffer_frames: u32,
    pub period_frames: u32,
    pub buffers: u32,
}

impl StreamNegotiation {
    /// Negotiate a fixed session format (projection audio)
    ///
    /// The projection session dictates rate and channel count, so the device
    /// either takes them or the open fails.
    pub fn for_session(
        device: DeviceInfo,
        requested: AudioFormat,
        caps: &DeviceCapabilities,
    ) -> Result<Self> {
        if !caps.supports_rate(requested.sample_rate) {
            return Err(SinkError::Negotiation(format!(
                "{} does not support {}Hz (range {}-{}Hz)",
                device.name, requested.sample_rate, caps.min_rate, caps.max_rate
            )));
        }
        if !caps.supports_format(requested.sample_format) {
            return Err(SinkError::Negotiation(format!(
                "{} does not support {}",
                device.name, requested.sample_format
            )));
        }
        if requested.channels > caps.max_channels {
            return Err(SinkError::Negotiation(format!(
                "{} supports at most {} channels, {} requested",
                device.name, caps.max_channels, requested.channels
            )));
        }

        let profile = LatencyProfile::Projection;
        let negotiation = Self {
            device,
            format: requested,
            native_offload: true,
            buffer_frames: profile.buffer_frames(requested.sample_rate),
            period_frames: profile.period_frames(requested.sample_rate),
            buffers: profile.buffers(),
        };

        debug!(
            "Session stream: {} on {} ({} frames x {} buffers)",
            negotiation.format,
            negotiation.device.name,
            negotiation.buffer_frames,
            negotiation.buffers
        );

        Ok(negotiation)
    }

    /// Negotiate for local playback of a source with the given rate/depth
    ///
    /// Output is always stereo; the decode loop maps channels.
    pub fn for_playback(
        device: DeviceInfo,
        source_rate: u32,
        source_bits: u32,
        caps: &DeviceCapabilities,
    ) -> Self {
        info!(
            "DAC rate range: {} - {} Hz",
            caps.min_rate, caps.max_rate
        );

        let (rate, native_offload) = negotiate_rate(source_rate, caps);
        if native_offload {
            info!("DAC supports {}Hz - native offload active", rate);
        } else {
            info!(
                "Source {}Hz not playable natively (DAC max {}Hz), resampling to {}Hz",
                source_rate, caps.max_rate, rate
            );
        }

        let sample_format = negotiate_format(source_bits, rate, caps);
        let profile = LatencyProfile::LocalPlayback;

        Self {
            device,
            format: AudioFormat {
                sample_rate: rate,
                channels: 2,
                sample_format,
            },
            native_offload,
            buffer_frames: profile.buffer_frames(rate),
            period_frames: profile.period_frames(rate),
            buffers: profile.buffers(),
        }
    }

    /// Bit depth shown to the user
    pub fn bit_depth(&self) -> u32 {
        self.format.sample_format.bits()
    }
}
