//! Track decoding into interleaved left-justified samples
//!
//! WAV files are read with hound. With the `ffmpeg` feature any container
//! FFmpeg can demux is accepted as well.

use crate::error::{Result, SinkError};
use crate::player::resample::{justify, justify_float};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

/// Stream properties reported by a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    pub sample_rate: u32,
    pub channels: u16,
    /// Significant bits of the source material (0 when unknown)
    pub bits_per_sample: u32,
    pub duration_ms: Option<u64>,
    pub codec: String,
}

/// A decodable track
pub trait TrackSource: Send {
    fn info(&self) -> &SourceInfo;

    /// Replace `out` with up to `max_frames` interleaved frames
    ///
    /// Returns the number of frames read; 0 at the end of the track.
    fn read(&mut self, out: &mut Vec<i32>, max_frames: usize) -> Result<usize>;

    /// Position of the next frame to be read
    fn position_ms(&self) -> u64;

    fn seek(&mut self, position_ms: u64) -> Result<()>;
}

/// Open a file with the first reader that accepts it
pub fn open_source(path: &Path) -> Result<Box<dyn TrackSource>> {
    let is_wav = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("wav"))
        .unwrap_or(false);

    if is_wav {
        return Ok(Box::new(WavSource::open(path)?));
    }

    #[cfg(feature = "ffmpeg")]
    {
        Ok(Box::new(ffmpeg_source::FfmpegSource::open(path)?))
    }

    #[cfg(not(feature = "ffmpeg"))]
    {
        Err(SinkError::Backend(format!(
            "{}: only WAV is supported without the ffmpeg feature",
            path.display()
        )))
    }
}

fn frames_to_ms(frames: u64, rate: u32) -> u64 {
    frames * 1000 / rate.max(1) as u64
}

fn ms_to_frames(ms: u64, rate: u32) -> u64 {
    ms * rate as u64 / 1000
}

/// PCM WAV through hound
pub struct WavSource {
    reader: hound::WavReader<BufReader<File>>,
    float: bool,
    bits: u32,
    info: SourceInfo,
    total_frames: u64,
    position_frames: u64,
}

impl WavSource {
    pub fn open(path: &Path) -> Result<Self> {
        let reader = hound::WavReader::open(path)
            .map_err(|e| SinkError::Backend(format!("{}: {}", path.display(), e)))?;
        let spec = reader.spec();
        if spec.channels == 0 || spec.sample_rate == 0 {
            return Err(SinkError::Backend(format!(
                "{}: invalid WAV header",
                path.display()
            )));
        }

        let total_frames = reader.duration() as u64;
        let float = spec.sample_format == hound::SampleFormat::Float;
        let info = SourceInfo {
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            bits_per_sample: spec.bits_per_sample as u32,
            duration_ms: Some(frames_to_ms(total_frames, spec.sample_rate)),
            codec: format!(
                "pcm_{}{}le",
                if float { 'f' } else { 's' },
                spec.bits_per_sample
            ),
        };
        debug!(
            "WAV {}: {}Hz {}ch {}-bit, {} frames",
            path.display(),
            info.sample_rate,
            info.channels,
            info.bits_per_sample,
            total_frames
        );

        Ok(Self {
            reader,
            float,
            bits: spec.bits_per_sample as u32,
            info,
            total_frames,
            position_frames: 0,
        })
    }
}

impl TrackSource for WavSource {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    fn read(&mut self, out: &mut Vec<i32>, max_frames: usize) -> Result<usize> {
        out.clear();
        let channels = self.info.channels as usize;
        let wanted = max_frames * channels;

        if self.float {
            for sample in self.reader.samples::<f32>().take(wanted) {
                let sample = sample.map_err(|e| SinkError::Backend(e.to_string()))?;
                out.push(justify_float(sample));
            }
        } else {
            for sample in self.reader.samples::<i32>().take(wanted) {
                let sample = sample.map_err(|e| SinkError::Backend(e.to_string()))?;
                out.push(justify(sample, self.bits));
            }
        }

        let frames = out.len() / channels;
        out.truncate(frames * channels);
        self.position_frames += frames as u64;
        Ok(frames)
    }

    fn position_ms(&self) -> u64 {
        frames_to_ms(self.position_frames, self.info.sample_rate)
    }

    fn seek(&mut self, position_ms: u64) -> Result<()> {
        let frame = ms_to_frames(position_ms, self.info.sample_rate).min(self.total_frames);
        self.reader.seek(frame as u32)?;
        self.position_frames = frame;
        Ok(())
    }
}

#[cfg(feature = "ffmpeg")]
mod ffmpeg_source {
    use super::{frames_to_ms, ms_to_frames, SourceInfo, TrackSource};
    use crate::error::{Result, SinkError};
    use crate::player::resample::{justify, justify_float};
    use ffmpeg::format::Sample;
    use ffmpeg_next as ffmpeg;
    use std::collections::VecDeque;
    use std::path::Path;
    use tracing::debug;

    fn backend(context: &str, e: ffmpeg::Error) -> SinkError {
        SinkError::Backend(format!("{}: {}", context, e))
    }

    /// Demux and decode the best audio stream of any container
    pub struct FfmpegSource {
        input: ffmpeg::format::context::Input,
        stream_index: usize,
        decoder: ffmpeg::decoder::Audio,
        info: SourceInfo,
        pending: VecDeque<i32>,
        position_frames: u64,
        eof_sent: bool,
        finished: bool,
    }

    // The demuxer and decoder are only touched from the owning decode thread
    unsafe impl Send for FfmpegSource {}

    impl FfmpegSource {
        pub fn open(path: &Path) -> Result<Self> {
            ffmpeg::init().map_err(|e| backend("FFmpeg init", e))?;

            let input = ffmpeg::format::input(&path)
                .map_err(|e| backend(&path.display().to_string(), e))?;
            let stream = input
                .streams()
                .best(ffmpeg::media::Type::Audio)
                .ok_or_else(|| SinkError::Backend(format!("{}: no audio stream", path.display())))?;
            let stream_index = stream.index();
            let parameters = stream.parameters();
            let codec = format!("{:?}", parameters.id()).to_lowercase();

            let decoder = ffmpeg::codec::context::Context::from_parameters(parameters)
                .and_then(|context| context.decoder().audio())
                .map_err(|e| backend("open audio decoder", e))?;

            let (raw_bits, channels) = unsafe {
                let ctx = decoder.as_ptr();
                ((*ctx).bits_per_raw_sample, (*ctx).ch_layout.nb_channels)
            };
            let bits_per_sample = if raw_bits > 0 {
                raw_bits as u32
            } else {
                match decoder.format() {
                    Sample::U8(_) => 8,
                    _ => 16,
                }
            };

            let duration = input.duration();
            let info = SourceInfo {
                sample_rate: decoder.rate(),
                channels: channels.max(1) as u16,
                bits_per_sample,
                duration_ms: (duration > 0).then(|| duration as u64 / 1000),
                codec,
            };
            debug!(
                "{}: {} {}Hz {}ch {}-bit",
                path.display(),
                info.codec,
                info.sample_rate,
                info.channels,
                info.bits_per_sample
            );

            Ok(Self {
                input,
                stream_index,
                decoder,
                info,
                pending: VecDeque::new(),
                position_frames: 0,
                eof_sent: false,
                finished: false,
            })
        }

        /// Pull one decoded frame, feeding packets as needed
        fn decode_more(&mut self) -> Result<()> {
            let mut frame = ffmpeg::frame::Audio::empty();
            if self.decoder.receive_frame(&mut frame).is_ok() {
                self.append(&frame);
                return Ok(());
            }
            if self.eof_sent {
                self.finished = true;
                return Ok(());
            }

            loop {
                match self.input.packets().next() {
                    Some((stream, packet)) => {
                        if stream.index() != self.stream_index {
                            continue;
                        }
                        // Corrupt packets are skipped like the demuxer skips garbage
                        if let Err(e) = self.decoder.send_packet(&packet) {
                            debug!("Audio packet rejected: {}", e);
                        }
                        return Ok(());
                    }
                    None => {
                        self.decoder
                            .send_eof()
                            .map_err(|e| backend("flush audio decoder", e))?;
                        self.eof_sent = true;
                        return Ok(());
                    }
                }
            }
        }

        fn append(&mut self, frame: &ffmpeg::frame::Audio) {
            let channels = self.info.channels as usize;
            let format = frame.format();
            let samples = frame.samples();
            let planar = frame.is_planar();

            for i in 0..samples {
                for c in 0..channels {
                    let (plane, index) = if planar { (c, i) } else { (0, i * channels + c) };
                    self.pending
                        .push_back(sample_at(frame.data(plane), format, index));
                }
            }
        }
    }

    fn sample_at(data: &[u8], format: Sample, index: usize) -> i32 {
        fn bytes<const N: usize>(data: &[u8], index: usize) -> [u8; N] {
            let mut out = [0u8; N];
            if let Some(src) = data.get(index * N..index * N + N) {
                out.copy_from_slice(src);
            }
            out
        }

        match format {
            Sample::U8(_) => justify(bytes::<1>(data, index)[0] as i32 - 128, 8),
            Sample::I16(_) => justify(i16::from_ne_bytes(bytes(data, index)) as i32, 16),
            Sample::I32(_) => i32::from_ne_bytes(bytes(data, index)),
            Sample::F32(_) => justify_float(f32::from_ne_bytes(bytes(data, index))),
            Sample::F64(_) => justify_float(f64::from_ne_bytes(bytes(data, index)) as f32),
            _ => 0,
        }
    }

    impl TrackSource for FfmpegSource {
        fn info(&self) -> &SourceInfo {
            &self.info
        }

        fn read(&mut self, out: &mut Vec<i32>, max_frames: usize) -> Result<usize> {
            out.clear();
            let channels = self.info.channels as usize;
            let wanted = max_frames * channels;
            while self.pending.len() < wanted && !self.finished {
                self.decode_more()?;
            }

            let take = self.pending.len().min(wanted) / channels * channels;
            out.extend(self.pending.drain(..take));
            let frames = take / channels;
            self.position_frames += frames as u64;
            Ok(frames)
        }

        fn position_ms(&self) -> u64 {
            frames_to_ms(self.position_frames, self.info.sample_rate)
        }

        fn seek(&mut self, position_ms: u64) -> Result<()> {
            // AV_TIME_BASE is microseconds
            let target = (position_ms * 1000) as i64;
            self.input
                .seek(target, ..target)
                .map_err(|e| backend("seek", e))?;
            self.decoder.flush();
            self.pending.clear();
            self.eof_sent = false;
            self.finished = false;
            self.position_frames = ms_to_frames(position_ms, self.info.sample_rate);
            Ok(())
        }
    }
}
