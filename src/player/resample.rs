//! Rate conversion and sample packing for local playback
//!
//! Sources hand over interleaved samples left-justified in `i32` (a 16-bit
//! sample occupies the top 16 bits). The resampler folds them down to
//! stereo, converts to the negotiated rate through a band-limited FFT
//! resampler and [`pack`] writes the negotiated wire format.

use crate::audio::SampleFormat;
use crate::error::{Result, SinkError};
use rubato::{FftFixedIn, Resampler as _};
use std::f64::consts::FRAC_1_SQRT_2;

/// Stereo frame, left-justified samples
pub type StereoFrame = [i32; 2];

/// Input frames per FFT resampler call
const CHUNK_FRAMES: usize = 1024;

/// FFT sub-chunks per call; fewer means a longer, steeper filter
const SUB_CHUNKS: usize = 2;

const FULL_SCALE: f64 = 2_147_483_648.0;

/// Left-justify an integer sample of `bits` significant bits
pub fn justify(sample: i32, bits: u32) -> i32 {
    if bits == 0 || bits >= 32 {
        sample
    } else {
        sample << (32 - bits)
    }
}

/// Full-scale float to a left-justified sample
pub fn justify_float(sample: f32) -> i32 {
    (sample.clamp(-1.0, 1.0) as f64 * i32::MAX as f64) as i32
}

fn to_unit(sample: i32) -> f64 {
    sample as f64 / FULL_SCALE
}

fn from_unit(sample: f64) -> i32 {
    (sample * FULL_SCALE)
        .round()
        .clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

/// Fold any channel count down to stereo
///
/// Layouts beyond stereo are taken in the usual WAV/FFmpeg order
/// (FL FR FC LFE BL BR SL SR). Centre and surrounds enter at -3 dB, LFE is
/// left out, and each side is scaled so a full-scale input cannot clip.
#[derive(Debug, Clone, PartialEq)]
pub enum Downmix {
    Mono,
    Stereo,
    Matrix(Vec<[f64; 2]>),
}

impl Downmix {
    pub fn for_channels(channels: u16) -> Self {
        const L: [f64; 2] = [1.0, 0.0];
        const R: [f64; 2] = [0.0, 1.0];
        const C: [f64; 2] = [FRAC_1_SQRT_2, FRAC_1_SQRT_2];
        const LFE: [f64; 2] = [0.0, 0.0];
        const SL: [f64; 2] = [FRAC_1_SQRT_2, 0.0];
        const SR: [f64; 2] = [0.0, FRAC_1_SQRT_2];
        const BC: [f64; 2] = [0.5, 0.5];

        let mut gains = match channels {
            0 | 1 => return Downmix::Mono,
            2 => return Downmix::Stereo,
            3 => vec![L, R, C],
            4 => vec![L, R, SL, SR],
            5 => vec![L, R, C, SL, SR],
            6 => vec![L, R, C, LFE, SL, SR],
            7 => vec![L, R, C, LFE, BC, SL, SR],
            n => {
                let mut gains = vec![L, R, C, LFE, SL, SR, SL, SR];
                gains.resize(n as usize, LFE);
                gains
            }
        };

        let left: f64 = gains.iter().map(|g| g[0]).sum();
        let right: f64 = gains.iter().map(|g| g[1]).sum();
        let scale = 1.0 / left.max(right);
        for gain in &mut gains {
            gain[0] *= scale;
            gain[1] *= scale;
        }
        Downmix::Matrix(gains)
    }

    pub fn apply(&self, frame: &[i32]) -> StereoFrame {
        match (self, frame) {
            (_, []) => [0, 0],
            (Downmix::Mono, [mono, ..]) => [*mono, *mono],
            (Downmix::Stereo, [left, right, ..]) => [*left, *right],
            (Downmix::Stereo, [mono]) => [*mono, *mono],
            (Downmix::Matrix(gains), _) => {
                let (left, right) = frame
                    .iter()
                    .zip(gains)
                    .fold((0.0, 0.0), |(l, r), (&sample, gain)| {
                        (l + sample as f64 * gain[0], r + sample as f64 * gain[1])
                    });
                [
                    left.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32,
                    right.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32,
                ]
            }
        }
    }
}

/// Band-limited conversion state, absent when the rates match
struct Engine {
    fft: FftFixedIn<f64>,
    input_rate: u64,
    output_rate: u64,
    /// Planar input not yet consumed by the FFT
    pending: [Vec<f64>; 2],
    output: Vec<Vec<f64>>,
    /// Leading output frames that are filter delay, not signal
    skip: usize,
    frames_in: u64,
    frames_out: u64,
}

impl Engine {
    fn emit(&mut self, produced: usize, limit: Option<u64>, out: &mut Vec<StereoFrame>) {
        for i in 0..produced {
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            if limit.is_some_and(|limit| self.frames_out >= limit) {
                break;
            }
            out.push([from_unit(self.output[0][i]), from_unit(self.output[1][i])]);
            self.frames_out += 1;
        }
    }

    fn reset(&mut self) {
        self.fft.reset();
        self.pending[0].clear();
        self.pending[1].clear();
        self.skip = self.fft.output_delay();
        self.frames_in = 0;
        self.frames_out = 0;
    }
}

/// Streaming stereo resampler
///
/// Input is buffered until a full FFT chunk is available, so splitting it
/// into arbitrary pieces does not change the output. The filter delay is
/// trimmed from the front and [`flush`](Self::flush) plays out the tail, so
/// `n` input frames become `ceil(n * output_rate / input_rate)` output
/// frames. Equal rates pass frames through untouched.
pub struct Resampler {
    channels: usize,
    downmix: Downmix,
    engine: Option<Box<Engine>>,
}

impl Resampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: u16) -> Result<Self> {
        let input_rate = input_rate.max(1);
        let output_rate = output_rate.max(1);

        let engine = if input_rate == output_rate {
            None
        } else {
            let fft = FftFixedIn::<f64>::new(
                input_rate as usize,
                output_rate as usize,
                CHUNK_FRAMES,
                SUB_CHUNKS,
                2,
            )
            .map_err(|e| {
                SinkError::Backend(format!(
                    "resampler {} -> {} Hz: {}",
                    input_rate, output_rate, e
                ))
            })?;
            let output = fft.output_buffer_allocate(true);
            let skip = fft.output_delay();
            Some(Box::new(Engine {
                fft,
                input_rate: input_rate as u64,
                output_rate: output_rate as u64,
                pending: [Vec::new(), Vec::new()],
                output,
                skip,
                frames_in: 0,
                frames_out: 0,
            }))
        };

        Ok(Self {
            channels: channels.max(1) as usize,
            downmix: Downmix::for_channels(channels),
            engine,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.engine.is_none()
    }

    /// Forget carried state, e.g. after a seek
    pub fn reset(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.reset();
        }
    }

    /// Convert one chunk of interleaved input, appending to `out`
    pub fn process(&mut self, input: &[i32], out: &mut Vec<StereoFrame>) -> Result<()> {
        let frames = input.chunks_exact(self.channels);
        let Some(engine) = self.engine.as_deref_mut() else {
            out.extend(frames.map(|frame| self.downmix.apply(frame)));
            return Ok(());
        };

        for frame in frames {
            let [left, right] = self.downmix.apply(frame);
            engine.pending[0].push(to_unit(left));
            engine.pending[1].push(to_unit(right));
            engine.frames_in += 1;
        }

        let mut offset = 0;
        loop {
            let needed = engine.fft.input_frames_next();
            if engine.pending[0].len() - offset < needed {
                break;
            }
            let chunk = [
                &engine.pending[0][offset..offset + needed],
                &engine.pending[1][offset..offset + needed],
            ];
            let (consumed, produced) = engine
                .fft
                .process_into_buffer(&chunk[..], &mut engine.output[..], None)
                .map_err(|e| SinkError::Backend(format!("resample: {}", e)))?;
            offset += consumed;
            engine.emit(produced, None, out);
        }

        engine.pending[0].drain(..offset);
        engine.pending[1].drain(..offset);
        Ok(())
    }

    /// Play out buffered input at the end of a stream
    ///
    /// Leaves the resampler ready for a new stream.
    pub fn flush(&mut self, out: &mut Vec<StereoFrame>) -> Result<()> {
        let Some(engine) = self.engine.as_deref_mut() else {
            return Ok(());
        };

        let expected = (engine.frames_in * engine.output_rate).div_ceil(engine.input_rate);
        let mut tail = true;
        while engine.frames_out < expected {
            let result = if tail && !engine.pending[0].is_empty() {
                let chunk = [&engine.pending[0][..], &engine.pending[1][..]];
                engine
                    .fft
                    .process_partial_into_buffer(Some(&chunk[..]), &mut engine.output[..], None)
            } else {
                engine.fft.process_partial_into_buffer(
                    None::<&[&[f64]]>,
                    &mut engine.output[..],
                    None,
                )
            };
            let (_, produced) =
                result.map_err(|e| SinkError::Backend(format!("resample: {}", e)))?;
            tail = false;

            if produced == 0 {
                break;
            }
            engine.emit(produced, Some(expected), out);
        }

        engine.reset();
        Ok(())
    }
}

/// Append frames in the DAC's wire format
pub fn pack(frames: &[StereoFrame], format: SampleFormat, out: &mut Vec<u8>) {
    out.reserve(frames.len() * 2 * format.bytes_per_sample());
    for sample in frames.iter().flatten() {
        match format {
            SampleFormat::S16Le => out.extend_from_slice(&((sample >> 16) as i16).to_le_bytes()),
            SampleFormat::S24Le3 => out.extend_from_slice(&(sample >> 8).to_le_bytes()[..3]),
            SampleFormat::S32Le => out.extend_from_slice(&sample.to_le_bytes()),
        }
    }
}
