//! H.264 projection video presented on a DRM/KMS plane
//!
//! Bytes written by the projection session are framed into access units,
//! decoded, and put on the video plane. Hardware decoders hand out DRM PRIME
//! frames that are scanned out directly; anything else is converted into a
//! persistent dumb buffer.

use crate::config::MediaConfig;
use crate::error::{Result, SinkError};
use crate::video::cursor::CursorSession;
use crate::video::decoder::{DecodeMode, DecodedFrame, FrameMemory, PrimeDescriptor, VideoDecoder};
use crate::video::display::{
    DisplayDevice, DisplaySession, DumbBuffer, FramebufferId, FramebufferLayout, GemHandle,
    FOURCC_XRGB8888,
};
use crate::video::emergency::{BufferSlot, EmergencyCleanup};
use crate::video::parser::AccessUnitParser;
use crate::video::retention::FrameRetention;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Frames whose failures are logged; later ones are dropped silently
const LOGGED_FRAMES: u64 = 5;

/// Writes between progress messages
const PROGRESS_INTERVAL: u64 = 300;

/// Scanout row alignment of the software buffer, in pixels (64 bytes)
const SOFTWARE_ALIGN: u32 = 16;

/// Source of the display device and decoder for a video session
pub trait VideoBackend: Send + Sync {
    type Display: DisplayDevice + 'static;
    type Decoder: VideoDecoder;

    fn open_display(&self, config: &dyn MediaConfig) -> Result<Arc<Self::Display>>;
    fn open_decoder(&self, config: &dyn MediaConfig) -> Result<Self::Decoder>;
}

type FrameOf<B> = <<B as VideoBackend>::Decoder as VideoDecoder>::Frame;

/// Lifecycle of the output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Closed,
    Opened,
    Active,
    Stopped,
}

/// Counters reported by [`HardwareVideoOutput::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoStats {
    pub writes: u64,
    pub access_units: u64,
    pub frames_shown: u64,
    pub frames_dropped: u64,
    pub mode: Option<DecodeMode>,
}

/// A presented zero-copy buffer and everything keeping it alive
struct RetainedBuffer<F> {
    framebuffer: FramebufferId,
    handles: SmallVec<[GemHandle; 4]>,
    frame: Option<F>,
}

#[derive(Debug, Clone, Copy)]
struct SoftwareTarget {
    buffer: DumbBuffer,
    framebuffer: FramebufferId,
    width: u32,
    height: u32,
}

struct Pipeline<B: VideoBackend> {
    session: DisplaySession<B::Display>,
    decoder: B::Decoder,
    parser: AccessUnitParser,
    software: Option<SoftwareTarget>,
}

struct Inner<B: VideoBackend> {
    state: OutputState,
    pipeline: Option<Pipeline<B>>,
    cursor: Option<Arc<CursorSession<B::Display>>>,
    stats: VideoStats,
}

type Retention<F> = Arc<Mutex<FrameRetention<RetainedBuffer<F>>>>;

/// Decode-and-present pipeline for the projection video channel
///
/// All transitions and writes serialize on one lock. The retained buffers
/// live behind their own lock so the termination path can reach them
/// without waiting for a write in progress.
pub struct HardwareVideoOutput<B: VideoBackend> {
    backend: B,
    config: Arc<dyn MediaConfig>,
    inner: Mutex<Inner<B>>,
    retention: Retention<FrameOf<B>>,
    emergency: Arc<EmergencyCleanup>,
}

impl<B: VideoBackend> HardwareVideoOutput<B> {
    pub fn new(backend: B, config: Arc<dyn MediaConfig>) -> Self {
        Self {
            backend,
            config,
            inner: Mutex::new(Inner {
                state: OutputState::Closed,
                pipeline: None,
                cursor: None,
                stats: VideoStats::default(),
            }),
            retention: Arc::new(Mutex::new(FrameRetention::new())),
            emergency: Arc::new(EmergencyCleanup::new(
                <B::Display as DisplayDevice>::raw_release(),
            )),
        }
    }

    /// Open the display session, then the decoder
    pub fn open(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if matches!(inner.state, OutputState::Opened | OutputState::Active) {
            debug!("Video output already open");
            return Ok(());
        }

        info!(
            "Opening video pipeline ({} @ {} fps)",
            self.config.video_resolution(),
            self.config.video_fps().fps()
        );

        let display = self.backend.open_display(self.config.as_ref())?;
        let session = DisplaySession::open(display, self.config.as_ref()).map_err(|e| {
            error!("Failed to initialize display: {}", e);
            e
        })?;

        // Dropping the session on failure releases the display
        let decoder = self.backend.open_decoder(self.config.as_ref()).map_err(|e| {
            error!("Failed to initialize decoder: {}", e);
            e
        })?;

        let mode = decoder.mode();
        self.emergency
            .arm(session.device().raw_fd(), self.frame_release());

        inner.stats = VideoStats {
            mode: Some(mode),
            ..VideoStats::default()
        };
        inner.pipeline = Some(Pipeline {
            session,
            decoder,
            parser: AccessUnitParser::new(),
            software: None,
        });
        inner.state = OutputState::Opened;

        info!("Video pipeline created, decode mode: {}", mode);
        Ok(())
    }

    /// Start accepting video; attaches the cursor when configured
    pub fn init(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match inner.state {
            OutputState::Active => {
                warn!("Video output already active");
                return Ok(());
            }
            OutputState::Opened => {}
            _ => {
                error!("Cannot init video output: not opened");
                return Err(SinkError::NotOpened);
            }
        }
        let Some(pipeline) = inner.pipeline.as_ref() else {
            return Err(SinkError::NotOpened);
        };

        inner.state = OutputState::Active;
        inner.stats.writes = 0;

        if self.config.show_cursor() {
            let session = &pipeline.session;
            match session.cursor_plane {
                Some(plane) => {
                    match CursorSession::attach(Arc::clone(session.device()), plane, session.crtc)
                    {
                        Ok(cursor) => inner.cursor = Some(cursor),
                        Err(e) => warn!("Cursor unavailable: {}", e),
                    }
                }
                None => warn!("Cursor enabled but no cursor plane found"),
            }
        } else {
            info!("Cursor disabled in configuration");
        }

        info!("Video pipeline started");
        Ok(())
    }

    /// Feed Annex-B bytes; decoded frames are presented before returning
    ///
    /// Does nothing unless the output is active. The timestamp is passed
    /// through untouched by the decoder path.
    pub fn write(&self, _timestamp: u64, data: &[u8]) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.state != OutputState::Active {
            return;
        }
        let Some(pipeline) = inner.pipeline.as_mut() else {
            return;
        };
        if data.is_empty() {
            warn!("Received empty video buffer");
            return;
        }

        let count = inner.stats.writes;
        if count < LOGGED_FRAMES {
            info!("Frame {} - size: {} bytes", count, data.len());
        }

        for unit in pipeline.parser.push(data) {
            inner.stats.access_units += 1;
            if let Err(e) = pipeline.decoder.send(&unit) {
                if !e.is_recoverable() {
                    error!("Decoder rejected input: {}; flushing", e);
                    pipeline.decoder.flush();
                } else if count < LOGGED_FRAMES {
                    warn!("Send packet error: {}", e);
                }
                continue;
            }
            self.drain(pipeline, &mut inner.stats);
        }

        inner.stats.writes += 1;
        if inner.stats.writes % PROGRESS_INTERVAL == 0 {
            info!(
                "Processed {} writes ({} shown, {} dropped)",
                inner.stats.writes, inner.stats.frames_shown, inner.stats.frames_dropped
            );
        }
    }

    fn drain(&self, pipeline: &mut Pipeline<B>, stats: &mut VideoStats) {
        let count = stats.writes;
        loop {
            let frame = match pipeline.decoder.receive() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    if count < LOGGED_FRAMES {
                        warn!("Receive frame error: {}", e);
                    }
                    break;
                }
                // Frames still queued in a failed decoder are not trusted
                Err(e) => {
                    error!("Decoder failed: {}; flushing", e);
                    pipeline.decoder.flush();
                    break;
                }
            };

            if frame.width() == 0 || frame.height() == 0 {
                if count < LOGGED_FRAMES {
                    warn!(
                        "Invalid frame dimensions: {}x{}",
                        frame.width(),
                        frame.height()
                    );
                }
                stats.frames_dropped += 1;
                continue;
            }

            match self.display_frame(pipeline, frame) {
                Ok(()) => stats.frames_shown += 1,
                Err(e) => {
                    stats.frames_dropped += 1;
                    if !e.is_recoverable() {
                        error!("Failed to display frame {}: {}", count, e);
                    } else if count < LOGGED_FRAMES {
                        warn!("Failed to display frame {}: {}", count, e);
                    }
                }
            }
        }
    }

    fn display_frame(&self, pipeline: &mut Pipeline<B>, frame: FrameOf<B>) -> Result<()> {
        let descriptor = match frame.memory() {
            FrameMemory::Prime(descriptor) => descriptor,
            FrameMemory::Cpu => return self.present_software(pipeline, &frame),
            FrameMemory::Unsupported(format) => {
                return Err(SinkError::display(format!(
                    "cannot present pixel format {}",
                    format
                )))
            }
        };
        self.present_prime(pipeline, descriptor, frame)
    }

    fn present_prime(
        &self,
        pipeline: &Pipeline<B>,
        descriptor: PrimeDescriptor,
        frame: FrameOf<B>,
    ) -> Result<()> {
        if !descriptor.is_valid() {
            return Err(SinkError::display("invalid DRM PRIME descriptor"));
        }
        let device = pipeline.session.device().as_ref();
        let (width, height) = (frame.width(), frame.height());

        let mut handles: SmallVec<[GemHandle; 4]> = SmallVec::new();
        for object in descriptor.objects.iter().take(4) {
            match device.import_prime(object.fd) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    close_handles(device, &handles);
                    return Err(e);
                }
            }
        }

        let mut layout = FramebufferLayout {
            width,
            height,
            fourcc: descriptor.fourcc,
            handles: [None; 4],
            pitches: [0; 4],
            offsets: [0; 4],
            modifier: None,
        };
        for (i, plane) in descriptor.planes.iter().take(4).enumerate() {
            layout.handles[i] = handles.get(plane.object_index).copied();
            layout.pitches[i] = plane.pitch;
            layout.offsets[i] = plane.offset;
        }
        layout.modifier = descriptor
            .planes
            .first()
            .and_then(|plane| descriptor.objects.get(plane.object_index))
            .map(|object| object.modifier);

        let framebuffer = match device.add_framebuffer(&layout) {
            Ok(framebuffer) => framebuffer,
            Err(e) => {
                debug!("AddFB2 with modifiers failed ({}), retrying without", e);
                layout.modifier = None;
                match device.add_framebuffer(&layout) {
                    Ok(framebuffer) => framebuffer,
                    Err(e) => {
                        close_handles(device, &handles);
                        return Err(e);
                    }
                }
            }
        };

        if let Err(e) = pipeline.session.present(framebuffer, width, height) {
            if let Err(e) = device.remove_framebuffer(framebuffer) {
                debug!("Failed to remove framebuffer {}: {}", framebuffer, e);
            }
            close_handles(device, &handles);
            return Err(e);
        }

        let raw: SmallVec<[u32; 4]> = handles.iter().map(|handle| handle.0).collect();
        self.emergency.rotate(framebuffer.0, &raw);

        let released = self.retention.lock().rotate(RetainedBuffer {
            framebuffer,
            handles,
            frame: Some(frame),
        });
        if let Some(buffer) = released {
            release_buffer(device, buffer);
        }
        Ok(())
    }

    fn present_software(&self, pipeline: &mut Pipeline<B>, frame: &FrameOf<B>) -> Result<()> {
        let device = Arc::clone(pipeline.session.device());
        let (width, height) = (frame.width(), frame.height());

        if let Some(target) = pipeline.software {
            if target.width != width || target.height != height {
                info!(
                    "Frame size changed to {}x{}, recreating software buffer",
                    width, height
                );
                pipeline.software = None;
                self.release_software(device.as_ref(), target);
            }
        }
        let target = match pipeline.software {
            Some(target) => target,
            None => {
                let target = self.create_software_target(device.as_ref(), width, height)?;
                pipeline.software = Some(target);
                target
            }
        };

        let pitch = target.buffer.pitch as usize;
        let decoder = &mut pipeline.decoder;
        let mut converted = Ok(());
        device.write_dumb(&target.buffer, &mut |pixels| {
            converted = decoder.convert_to_xrgb(frame, pixels, pitch);
        })?;
        converted?;

        pipeline.session.present(target.framebuffer, width, height)
    }

    fn create_software_target(
        &self,
        device: &B::Display,
        width: u32,
        height: u32,
    ) -> Result<SoftwareTarget> {
        let aligned = (width + SOFTWARE_ALIGN - 1) & !(SOFTWARE_ALIGN - 1);
        let buffer = device.create_dumb(aligned, height, 32)?;
        if buffer.pitch % (SOFTWARE_ALIGN * 4) != 0 {
            warn!(
                "Dumb buffer pitch {} not {}-byte aligned",
                buffer.pitch,
                SOFTWARE_ALIGN * 4
            );
        }

        // The framebuffer covers the picture, not the padded rows
        let layout = FramebufferLayout::dumb(&buffer, width, height, FOURCC_XRGB8888);
        let framebuffer = match device.add_framebuffer(&layout) {
            Ok(framebuffer) => framebuffer,
            Err(e) => {
                if let Err(e) = device.destroy_dumb(buffer) {
                    debug!("Failed to destroy dumb buffer: {}", e);
                }
                return Err(e);
            }
        };
        self.emergency
            .track(BufferSlot::Software, framebuffer.0, &[buffer.handle.0]);

        info!(
            "Created software fallback buffer: {}x{} (pitch={})",
            width, height, buffer.pitch
        );
        Ok(SoftwareTarget {
            buffer,
            framebuffer,
            width,
            height,
        })
    }

    fn release_software(&self, device: &B::Display, target: SoftwareTarget) {
        if !self.emergency.untrack(BufferSlot::Software) {
            debug!("Software buffer already released by emergency cleanup");
            return;
        }
        if let Err(e) = device.remove_framebuffer(target.framebuffer) {
            debug!("Failed to remove software framebuffer: {}", e);
        }
        if let Err(e) = device.destroy_dumb(target.buffer) {
            debug!("Failed to destroy software buffer: {}", e);
        }
    }

    /// Drops retained frame references without waiting on a writer
    fn frame_release(&self) -> Box<dyn Fn() + Send + Sync> {
        let retention = Arc::clone(&self.retention);
        Box::new(move || {
            if let Some(mut retention) = retention.try_lock() {
                retention.drain().for_each(drop);
            }
        })
    }

    /// Flush the decoder and release every buffer, the cursor and the display
    ///
    /// Safe to call in any state and more than once.
    pub fn stop(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some(mut pipeline) = inner.pipeline.take() else {
            debug!("Video output already stopped");
            return;
        };
        info!("Stopping video output");
        inner.state = OutputState::Stopped;

        pipeline.decoder.flush();
        pipeline.parser.reset();

        // Claims the mirrored slot first, so an earlier emergency run wins
        let device = Arc::clone(pipeline.session.device());
        if let Some(target) = pipeline.software.take() {
            self.release_software(device.as_ref(), target);
        }

        // Everything below is released normally; stop mirroring it
        self.emergency.disarm();

        for buffer in self.retention.lock().drain() {
            release_buffer(device.as_ref(), buffer);
        }
        if let Some(cursor) = inner.cursor.take() {
            cursor.detach();
        }
        drop(pipeline);

        info!(
            "Video stopped. Writes: {}, frames shown: {}, dropped: {}",
            inner.stats.writes, inner.stats.frames_shown, inner.stats.frames_dropped
        );
    }

    /// Termination-path release; see [`EmergencyCleanup::run`]
    pub fn emergency_cleanup(&self) -> bool {
        self.emergency.run()
    }

    /// Handle for a termination handler registered outside the output
    pub fn emergency(&self) -> Arc<EmergencyCleanup> {
        Arc::clone(&self.emergency)
    }

    /// Cursor session while active with the cursor enabled
    pub fn cursor(&self) -> Option<Arc<CursorSession<B::Display>>> {
        self.inner.lock().cursor.clone()
    }

    pub fn state(&self) -> OutputState {
        self.inner.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == OutputState::Active
    }

    pub fn stats(&self) -> VideoStats {
        self.inner.lock().stats.clone()
    }

    /// Negotiated video size from configuration
    pub fn video_size(&self) -> (u32, u32) {
        let resolution = self.config.video_resolution();
        (resolution.width(), resolution.height())
    }

    /// Zero-copy buffers currently retained
    pub fn retained_buffers(&self) -> usize {
        self.retention.lock().len()
    }
}

impl<B: VideoBackend> Drop for HardwareVideoOutput<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Close each distinct handle once; planes may share an object
fn close_handles<D: DisplayDevice>(device: &D, handles: &[GemHandle]) {
    for (i, handle) in handles.iter().enumerate() {
        if handles[..i].contains(handle) {
            continue;
        }
        if let Err(e) = device.close_handle(*handle) {
            debug!("Failed to close GEM handle {}: {}", handle, e);
        }
    }
}

fn release_buffer<D: DisplayDevice, F>(device: &D, buffer: RetainedBuffer<F>) {
    if let Err(e) = device.remove_framebuffer(buffer.framebuffer) {
        debug!("Failed to remove framebuffer {}: {}", buffer.framebuffer, e);
    }
    close_handles(device, &buffer.handles);
    drop(buffer.frame);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{take_raw_releases, FakeBackend, TestConfig, FAKE_DISPLAY_FD};
    use crate::video::display::{FramebufferId, PlaneId, Rect};
    use serial_test::serial;

    /// One IDR picture per write, so write `i` completes access unit `i - 1`
    fn picture(i: u8) -> Vec<u8> {
        vec![0, 0, 0, 1, 0x65, 0x88, 0x80, i | 1]
    }

    fn output(backend: FakeBackend, show_cursor: bool) -> HardwareVideoOutput<FakeBackend> {
        let config = TestConfig {
            show_cursor,
            ..Default::default()
        };
        HardwareVideoOutput::new(backend, Arc::new(config))
    }

    fn active(mode: DecodeMode) -> HardwareVideoOutput<FakeBackend> {
        let out = output(FakeBackend::new(mode), false);
        out.open().unwrap();
        out.init().unwrap();
        out
    }

    #[test]
    fn test_state_machine() {
        let out = output(FakeBackend::new(DecodeMode::ZeroCopy), false);
        assert_eq!(out.state(), OutputState::Closed);
        assert!(matches!(out.init(), Err(SinkError::NotOpened)));

        out.open().unwrap();
        assert_eq!(out.state(), OutputState::Opened);
        out.init().unwrap();
        out.init().unwrap();
        assert!(out.is_active());

        out.stop();
        assert_eq!(out.state(), OutputState::Stopped);
        out.stop();
        assert_eq!(out.state(), OutputState::Stopped);

        // Stopped may reopen
        out.open().unwrap();
        out.init().unwrap();
        assert!(out.is_active());
    }

    #[test]
    fn test_write_requires_active() {
        let out = output(FakeBackend::new(DecodeMode::ZeroCopy), false);
        out.open().unwrap();
        out.write(0, &picture(0));
        out.write(0, &picture(1));
        assert_eq!(out.stats().writes, 0);
        assert!(out.backend.units().is_empty());
    }

    #[test]
    fn test_empty_write_ignored() {
        let out = active(DecodeMode::ZeroCopy);
        out.write(0, &[]);
        assert_eq!(out.stats().writes, 0);
    }

    #[test]
    fn test_decoder_failure_releases_display() {
        let backend = FakeBackend::new(DecodeMode::ZeroCopy);
        backend.set_fail_decoder(true);
        let display = Arc::clone(&backend.display);
        let out = output(backend, false);

        assert!(matches!(out.open(), Err(SinkError::Decoder(_))));
        assert_eq!(out.state(), OutputState::Closed);
        assert!(!out.emergency().is_armed());
        // Only the test's reference and the backend's remain
        assert_eq!(Arc::strong_count(&display), 2);
    }

    #[test]
    fn test_zero_copy_retains_two_generations() {
        let out = active(DecodeMode::ZeroCopy);
        let display = Arc::clone(&out.backend.display);

        for i in 0..8 {
            out.write(i as u64, &picture(i));
            assert!(out.retained_buffers() <= 2);
            assert!(out.backend.frames_alive() <= 2);
        }

        let stats = out.stats();
        assert_eq!(stats.writes, 8);
        assert_eq!(stats.access_units, 7);
        assert_eq!(stats.frames_shown, 7);
        assert_eq!(stats.mode, Some(DecodeMode::ZeroCopy));

        // Framebuffers 200..=206 shown; each removed only once two newer ones were shown
        assert_eq!(
            display.removed_framebuffers(),
            (200..205).map(FramebufferId).collect::<Vec<_>>()
        );
        assert_eq!(display.live_framebuffers(), 2);
        assert_eq!(display.live_handles(), 2);

        let (plane, fb, dst, src) = display.last_set_plane().unwrap();
        assert_eq!(plane, PlaneId(36));
        assert_eq!(fb, Some(FramebufferId(206)));
        assert_eq!(dst, Rect::new(0, 0, 800, 480));
        assert_eq!(src, Rect::source(640, 360));

        out.stop();
        assert_eq!(display.live_framebuffers(), 0);
        assert_eq!(display.live_handles(), 0);
        assert_eq!(out.backend.frames_alive(), 0);
        assert!(out.backend.was_flushed());
    }

    #[test]
    fn test_prime_layout_shares_object_handle() {
        let out = active(DecodeMode::ZeroCopy);
        let display = Arc::clone(&out.backend.display);
        out.write(0, &picture(0));
        out.write(1, &picture(1));

        let layout = display.framebuffer_layout(FramebufferId(200)).unwrap();
        assert_eq!(layout.fourcc, crate::video::display::FOURCC_NV12);
        assert_eq!(layout.handles[0], layout.handles[1]);
        assert!(layout.handles[0].is_some());
        assert_eq!(layout.pitches[..2], [640, 640]);
        assert_eq!(layout.offsets[..2], [0, 640 * 360]);
        assert_eq!(layout.modifier, Some(0));
    }

    #[test]
    fn test_modifier_rejection_falls_back() {
        let out = active(DecodeMode::ZeroCopy);
        let display = Arc::clone(&out.backend.display);
        display.set_reject_modifiers(true);

        out.write(0, &picture(0));
        out.write(1, &picture(1));
        assert_eq!(out.stats().frames_shown, 1);
        let layout = display.framebuffer_layout(FramebufferId(200)).unwrap();
        assert_eq!(layout.modifier, None);
    }

    #[test]
    fn test_failed_present_drops_frame_and_cleans_up() {
        let out = active(DecodeMode::ZeroCopy);
        let display = Arc::clone(&out.backend.display);
        display.set_fail_set_plane(true);

        for i in 0..4 {
            out.write(0, &picture(i));
        }
        let stats = out.stats();
        assert_eq!(stats.frames_shown, 0);
        assert_eq!(stats.frames_dropped, 3);
        assert_eq!(display.live_framebuffers(), 0);
        assert_eq!(display.live_handles(), 0);
        assert_eq!(out.retained_buffers(), 0);
        assert_eq!(out.backend.frames_alive(), 0);
    }

    #[test]
    fn test_invalid_dimensions_dropped() {
        let out = active(DecodeMode::ZeroCopy);
        out.backend.set_frame_size(0, 0);
        out.write(0, &picture(0));
        out.write(1, &picture(1));

        let stats = out.stats();
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.frames_shown, 0);
        assert_eq!(out.backend.display.live_framebuffers(), 0);
    }

    #[test]
    fn test_software_path_reuses_one_buffer() {
        let out = active(DecodeMode::Software);
        let display = Arc::clone(&out.backend.display);
        out.backend.set_frame_size(630, 360);

        for i in 0..5 {
            out.write(0, &picture(i));
        }
        assert_eq!(out.stats().frames_shown, 4);
        assert_eq!(display.dumb_buffers_created(), 1);
        assert_eq!(display.live_framebuffers(), 1);
        assert_eq!(out.retained_buffers(), 0);

        // Rows padded to 640 pixels, framebuffer at the picture width
        let buffer = display.dumb_buffers()[0];
        assert_eq!(buffer.width, 640);
        assert_eq!(buffer.pitch, 2560);
        let layout = display.framebuffer_layout(FramebufferId(200)).unwrap();
        assert_eq!(layout.width, 630);

        let pixels = display.dumb_contents().unwrap();
        assert_eq!(&pixels[..4], &0xFFFF_FFFFu32.to_le_bytes());

        let (_, fb, _, src) = display.last_set_plane().unwrap();
        assert_eq!(fb, Some(FramebufferId(200)));
        assert_eq!(src, Rect::source(630, 360));

        out.stop();
        assert_eq!(display.live_dumb_buffers(), 0);
        assert_eq!(display.live_framebuffers(), 0);
    }

    #[test]
    fn test_software_buffer_recreated_on_resize() {
        let out = active(DecodeMode::Software);
        let display = Arc::clone(&out.backend.display);

        out.write(0, &picture(0));
        out.write(0, &picture(1));
        out.backend.set_frame_size(1280, 720);
        out.write(0, &picture(2));
        out.write(0, &picture(3));

        assert_eq!(display.dumb_buffers_created(), 2);
        assert_eq!(display.live_dumb_buffers(), 1);
        assert_eq!(display.live_framebuffers(), 1);
    }

    #[test]
    fn test_recoverable_receive_error_keeps_queued_frames() {
        let out = active(DecodeMode::ZeroCopy);
        out.write(0, &picture(0));
        out.backend.fail_next_receive(SinkError::decoder("corrupt slice"));
        out.write(0, &picture(1));
        assert_eq!(out.stats().frames_shown, 0);
        assert!(!out.backend.was_flushed());

        // The held frame comes out with the next one
        out.write(0, &picture(2));
        assert_eq!(out.stats().frames_shown, 2);
    }

    #[test]
    fn test_fatal_receive_error_flushes_decoder() {
        let out = active(DecodeMode::ZeroCopy);
        out.write(0, &picture(0));
        out.backend.fail_next_receive(SinkError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "decoder device gone",
        )));
        out.write(0, &picture(1));
        assert!(out.backend.was_flushed());
        assert_eq!(out.backend.frames_alive(), 0);

        out.write(0, &picture(2));
        assert_eq!(out.stats().frames_shown, 1);
    }

    #[test]
    fn test_cursor_attached_when_configured() {
        let out = output(FakeBackend::new(DecodeMode::ZeroCopy), true);
        out.open().unwrap();
        assert!(out.cursor().is_none());
        out.init().unwrap();

        let cursor = out.cursor().unwrap();
        cursor.update_position(10, 20);
        assert!(cursor.is_visible());

        out.stop();
        assert!(!cursor.is_attached());
        assert!(out.cursor().is_none());
    }

    #[test]
    fn test_cursor_not_attached_when_disabled() {
        let out = active(DecodeMode::ZeroCopy);
        assert!(out.cursor().is_none());
        assert_eq!(out.backend.display.live_dumb_buffers(), 0);
    }

    #[test]
    #[serial]
    fn test_emergency_releases_retained_generations() {
        take_raw_releases();
        let out = active(DecodeMode::ZeroCopy);
        for i in 0..4 {
            out.write(0, &picture(i));
        }
        assert_eq!(out.backend.frames_alive(), 2);

        assert!(out.emergency_cleanup());
        assert_eq!(out.backend.frames_alive(), 0);
        assert_eq!(out.retained_buffers(), 0);

        let mut released = take_raw_releases();
        released.sort();
        // Frames 1 and 2 (fds 11, 12) are the retained pair
        assert_eq!(
            released,
            vec![
                (FAKE_DISPLAY_FD, 201, [1011, 0, 0, 0]),
                (FAKE_DISPLAY_FD, 202, [1012, 0, 0, 0]),
            ]
        );

        // Normal teardown afterwards finds nothing left to release twice
        out.stop();
        assert!(take_raw_releases().is_empty());
    }

    #[test]
    #[serial]
    fn test_stop_after_emergency_skips_released_software_buffer() {
        take_raw_releases();
        let out = active(DecodeMode::Software);
        let display = Arc::clone(&out.backend.display);
        out.write(0, &picture(0));
        out.write(0, &picture(1));
        assert_eq!(display.live_dumb_buffers(), 1);

        assert!(out.emergency_cleanup());
        let released = take_raw_releases();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].1, 200);

        // Raw release bypasses the fake's bookkeeping, so anything stop
        // frees here would be a second release of the same ids
        out.stop();
        assert_eq!(display.live_dumb_buffers(), 1);
        assert_eq!(display.live_framebuffers(), 1);
        assert!(take_raw_releases().is_empty());
    }

    #[test]
    #[serial]
    fn test_emergency_after_stop_is_noop() {
        take_raw_releases();
        let out = active(DecodeMode::ZeroCopy);
        out.write(0, &picture(0));
        out.write(0, &picture(1));
        out.stop();

        assert!(out.emergency_cleanup());
        assert!(take_raw_releases().is_empty());
    }
}
