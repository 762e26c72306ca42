//! Per-track decode-and-render worker

use crate::audio::{AudioHost, Direction, HardwareAudioOutput, SampleFormat, StreamNegotiation};
use crate::config::MediaConfig;
use crate::device::DeviceEnumerator;
use crate::error::Result;
use crate::player::audio_player::PlayerEvent;
use crate::player::resample::{pack, Resampler, StereoFrame};
use crate::player::source::{open_source, TrackSource};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Source frames decoded per iteration
const CHUNK_FRAMES: usize = 4096;

/// Sleep between pause checks
const PAUSE_POLL: Duration = Duration::from_millis(50);

/// Longest wait for buffered audio to play out at the end of a track
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const NO_SEEK: u64 = u64::MAX;

/// Flags shared between the player and one track's worker
pub(crate) struct TrackControl {
    stop: AtomicBool,
    paused: AtomicBool,
    position_ms: AtomicU64,
    seek_to: AtomicU64,
    stream: Mutex<Option<StreamNegotiation>>,
}

impl TrackControl {
    pub(crate) fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            position_ms: AtomicU64::new(0),
            seek_to: AtomicU64::new(NO_SEEK),
            stream: Mutex::new(None),
        }
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub(crate) fn request_seek(&self, position_ms: u64) {
        self.position_ms.store(position_ms, Ordering::Release);
        self.seek_to.store(position_ms, Ordering::Release);
    }

    pub(crate) fn position_ms(&self) -> u64 {
        self.position_ms.load(Ordering::Acquire)
    }

    /// Negotiation of the running stream, once opened
    pub(crate) fn stream(&self) -> Option<StreamNegotiation> {
        self.stream.lock().clone()
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    fn take_seek(&self) -> Option<u64> {
        match self.seek_to.swap(NO_SEEK, Ordering::AcqRel) {
            NO_SEEK => None,
            position => Some(position),
        }
    }
}

/// How a track's worker ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackOutcome {
    /// Played to the end
    Finished,
    /// Stopped by the player
    Stopped,
    /// Could not be opened or played; already reported as an event
    Failed,
}

/// Play one file to the end or until stopped
pub(crate) fn run_track(
    path: &Path,
    host: &Arc<dyn AudioHost>,
    config: &Arc<dyn MediaConfig>,
    control: &TrackControl,
    events: &Sender<PlayerEvent>,
) -> TrackOutcome {
    let mut source = match open_source(path) {
        Ok(source) => source,
        Err(e) => {
            error!("Failed to open {}: {}", path.display(), e);
            let _ = events.send(PlayerEvent::PlaybackError(format!(
                "Failed to open file: {}",
                e
            )));
            return TrackOutcome::Failed;
        }
    };

    let output = match open_output(source.as_ref(), host, config) {
        Ok(output) => output,
        Err(e) => {
            error!("Failed to open audio output: {}", e);
            let _ = events.send(PlayerEvent::PlaybackError(format!(
                "Failed to open audio output: {}",
                e
            )));
            return TrackOutcome::Failed;
        }
    };

    if let Some(negotiation) = output.negotiation() {
        let source_info = source.info();
        info!(
            "Playing: {} (source: {}Hz, output: {}Hz, {}-bit, codec: {}, offload: {})",
            path.display(),
            source_info.sample_rate,
            negotiation.format.sample_rate,
            negotiation.bit_depth(),
            source_info.codec,
            if negotiation.native_offload { "yes" } else { "no" }
        );
        *control.stream.lock() = Some(negotiation.clone());
        let _ = events.send(PlayerEvent::StreamInfo(negotiation));
    }

    let outcome = render(source.as_mut(), &output, control, events);
    output.stop();
    debug!("Track ended: {} ({:?})", path.display(), outcome);
    outcome
}

/// Negotiate against the configured DAC and open a stream for the source
fn open_output(
    source: &dyn TrackSource,
    host: &Arc<dyn AudioHost>,
    config: &Arc<dyn MediaConfig>,
) -> Result<HardwareAudioOutput> {
    let enumerator = DeviceEnumerator::new(Arc::clone(host));
    let device = enumerator.select(Direction::Output, &config.audio_output_device_name())?;
    let caps = host.capabilities(&device)?;

    let info = source.info();
    let negotiation =
        StreamNegotiation::for_playback(device, info.sample_rate, info.bits_per_sample, &caps);

    let output = HardwareAudioOutput::new(Arc::clone(host), Arc::clone(config), negotiation.format);
    output.open_with(negotiation)?;
    output.start()?;
    Ok(output)
}

fn render(
    source: &mut dyn TrackSource,
    output: &HardwareAudioOutput,
    control: &TrackControl,
    events: &Sender<PlayerEvent>,
) -> TrackOutcome {
    let Some(negotiation) = output.negotiation() else {
        return TrackOutcome::Failed;
    };
    let info = source.info().clone();
    let mut resampler = match Resampler::new(
        info.sample_rate,
        negotiation.format.sample_rate,
        info.channels,
    ) {
        Ok(resampler) => resampler,
        Err(e) => {
            error!(
                "Cannot convert {} Hz to {} Hz: {}",
                info.sample_rate, negotiation.format.sample_rate, e
            );
            let _ = events.send(PlayerEvent::PlaybackError(e.to_string()));
            return TrackOutcome::Failed;
        }
    };

    let format = negotiation.format.sample_format;
    let mut samples = Vec::with_capacity(CHUNK_FRAMES * info.channels as usize);
    let mut frames = Vec::new();
    let mut bytes = Vec::new();
    let mut last_second = None;

    loop {
        if control.stop_requested() {
            return TrackOutcome::Stopped;
        }
        if !hold_while_paused(output, control) {
            return TrackOutcome::Stopped;
        }

        if let Some(target) = control.take_seek() {
            match source.seek(target) {
                Ok(()) => resampler.reset(),
                Err(e) => warn!("Seek to {} ms failed: {}", target, e),
            }
        }

        let position = source.position_ms();
        let read = match source.read(&mut samples, CHUNK_FRAMES) {
            Ok(read) => read,
            Err(e) => {
                // A damaged tail ends the track like EOF does
                warn!("Decode error, ending track: {}", e);
                break;
            }
        };
        if read == 0 {
            break;
        }

        control.position_ms.store(position, Ordering::Release);
        let second = position / 1000;
        if last_second != Some(second) {
            last_second = Some(second);
            let _ = events.send(PlayerEvent::PositionChanged(position));
        }

        frames.clear();
        if let Err(e) = resampler.process(&samples, &mut frames) {
            warn!("Resampling failed, ending track: {}", e);
            break;
        }
        if !write_frames(output, format, &frames, &mut bytes, control) {
            return TrackOutcome::Stopped;
        }
    }

    frames.clear();
    match resampler.flush(&mut frames) {
        Ok(()) => {
            if !write_frames(output, format, &frames, &mut bytes, control) {
                return TrackOutcome::Stopped;
            }
        }
        Err(e) => warn!("Resampler tail dropped: {}", e),
    }

    drain(output, control)
}

/// Pack and queue converted frames; false when a stop cut the write short
fn write_frames(
    output: &HardwareAudioOutput,
    format: SampleFormat,
    frames: &[StereoFrame],
    bytes: &mut Vec<u8>,
    control: &TrackControl,
) -> bool {
    bytes.clear();
    pack(frames, format, bytes);
    output.write_blocking(bytes, &control.stop) == bytes.len()
}

/// Park while paused, with the hardware stream suspended
///
/// Returns false when a stop arrived meanwhile.
fn hold_while_paused(output: &HardwareAudioOutput, control: &TrackControl) -> bool {
    if !control.is_paused() {
        return true;
    }

    if let Err(e) = output.suspend() {
        warn!("Failed to suspend output: {}", e);
    }
    while control.is_paused() {
        if control.stop_requested() {
            return false;
        }
        thread::sleep(PAUSE_POLL);
    }
    if control.stop_requested() {
        return false;
    }
    if let Err(e) = output.start() {
        warn!("Failed to resume output: {}", e);
    }
    true
}

/// Let queued audio play out before the stream closes
fn drain(output: &HardwareAudioOutput, control: &TrackControl) -> TrackOutcome {
    let mut deadline = Instant::now() + DRAIN_TIMEOUT;
    while output.buffered() > 0 {
        if control.stop_requested() {
            return TrackOutcome::Stopped;
        }
        if control.is_paused() {
            if !hold_while_paused(output, control) {
                return TrackOutcome::Stopped;
            }
            deadline = Instant::now() + DRAIN_TIMEOUT;
        }
        if Instant::now() >= deadline {
            warn!("Output did not drain, {} bytes left", output.buffered());
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    TrackOutcome::Finished
}
