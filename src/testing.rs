//! In-process hardware fakes shared by unit tests

use crate::audio::{
    AudioHost, AudioStream, DeviceCapabilities, DeviceInfo, Direction, InputCallback,
    OutputCallback, SampleFormat, StreamRequest,
};
use crate::config::{FrameRate, MediaConfig, VideoResolution};
use crate::error::{Result, SinkError};
use crate::video::{
    ConnectorId, ConnectorInfo, CrtcId, DecodeMode, DecodedFrame, DisplayDevice, DisplayMode,
    DumbBuffer, FrameMemory, FramebufferId, FramebufferLayout, GemHandle, PlaneId, PlaneInfo,
    PlaneKind, PrimeDescriptor, PrimeObject, PrimePlane, PropertyId, PropertyInfo, RawRelease,
    Rect, VideoBackend, VideoDecoder, FOURCC_NV12,
};
use crate::video::convert::{self, PlanarFormat, PlanarImage, PlaneData};
use parking_lot::Mutex;
use smallvec::smallvec;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Configuration with everything defaulted
#[derive(Debug, Clone, Default)]
pub struct TestConfig {
    pub output_device: String,
    pub input_device: String,
    pub show_cursor: bool,
    pub resolution: VideoResolution,
}

impl MediaConfig for TestConfig {
    fn audio_output_device_name(&self) -> String {
        self.output_device.clone()
    }

    fn audio_input_device_name(&self) -> String {
        self.input_device.clone()
    }

    fn video_resolution(&self) -> VideoResolution {
        self.resolution
    }

    fn video_fps(&self) -> FrameRate {
        FrameRate::Fps30
    }

    fn show_cursor(&self) -> bool {
        self.show_cursor
    }
}

fn device(id: &str, name: &str, direction: Direction, is_default: bool) -> DeviceInfo {
    DeviceInfo {
        id: id.into(),
        name: name.into(),
        direction,
        is_default,
    }
}

/// Audio host whose streams run a real callback thread
///
/// Output streams record every byte the callback produced; input streams
/// feed an incrementing byte pattern.
pub struct FakeHost {
    outputs: Vec<DeviceInfo>,
    inputs: Vec<DeviceInfo>,
    caps: Mutex<DeviceCapabilities>,
    requests: Mutex<Vec<StreamRequest>>,
    delivered: Arc<Mutex<Vec<u8>>>,
    callbacks: Arc<AtomicUsize>,
    period: Duration,
    fail_open: AtomicBool,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            outputs: vec![
                device("hw:0", "Onboard Codec", Direction::Output, true),
                device("hw:1", "USB DAC", Direction::Output, false),
            ],
            inputs: vec![device("hw:0,1", "Onboard Mic", Direction::Input, true)],
            caps: Mutex::new(DeviceCapabilities {
                min_rate: 8_000,
                max_rate: 48_000,
                max_channels: 2,
                formats: vec![SampleFormat::S16Le, SampleFormat::S32Le],
            }),
            requests: Mutex::new(Vec::new()),
            delivered: Arc::new(Mutex::new(Vec::new())),
            callbacks: Arc::new(AtomicUsize::new(0)),
            period: Duration::from_millis(1),
            fail_open: AtomicBool::new(false),
        }
    }

    pub fn empty() -> Self {
        Self {
            outputs: Vec::new(),
            inputs: Vec::new(),
            ..Self::new()
        }
    }

    pub fn set_caps(&self, caps: DeviceCapabilities) {
        *self.caps.lock() = caps;
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Every stream request seen so far
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }

    /// Bytes produced by output callbacks
    pub fn delivered(&self) -> Vec<u8> {
        self.delivered.lock().clone()
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.load(Ordering::SeqCst)
    }

    fn record(&self, request: &StreamRequest) -> Result<()> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(SinkError::device_error(&request.device.id, "open refused"));
        }
        self.requests.lock().push(request.clone());
        Ok(())
    }
}

impl Default for FakeHost {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHost for FakeHost {
    fn name(&self) -> &str {
        "fake"
    }

    fn devices(&self, direction: Direction) -> Result<Vec<DeviceInfo>> {
        Ok(match direction {
            Direction::Output => self.outputs.clone(),
            Direction::Input => self.inputs.clone(),
        })
    }

    fn default_device(&self, direction: Direction) -> Result<Option<DeviceInfo>> {
        Ok(self
            .devices(direction)?
            .into_iter()
            .find(|device| device.is_default))
    }

    fn capabilities(&self, _device: &DeviceInfo) -> Result<DeviceCapabilities> {
        Ok(self.caps.lock().clone())
    }

    fn open_output(
        &self,
        request: &StreamRequest,
        mut callback: OutputCallback,
    ) -> Result<Box<dyn AudioStream>> {
        self.record(request)?;
        let bytes = request.format.frames_to_bytes(request.buffer_frames.min(256));
        let delivered = Arc::clone(&self.delivered);
        let tick: Tick = Box::new(move |buf: &mut Vec<u8>| {
            buf.clear();
            buf.resize(bytes, 0xFF);
            callback(buf.as_mut_slice());
            delivered.lock().extend_from_slice(buf);
        });
        Ok(Box::new(FakeStream::new(tick, self.period, Arc::clone(&self.callbacks))))
    }

    fn open_input(
        &self,
        request: &StreamRequest,
        mut callback: InputCallback,
    ) -> Result<Box<dyn AudioStream>> {
        self.record(request)?;
        let bytes = request.format.frames_to_bytes(request.buffer_frames.min(256));
        let mut next: u8 = 0;
        let tick: Tick = Box::new(move |buf: &mut Vec<u8>| {
            buf.clear();
            for _ in 0..bytes {
                buf.push(next);
                next = next.wrapping_add(1);
            }
            callback(buf.as_slice());
        });
        Ok(Box::new(FakeStream::new(tick, self.period, Arc::clone(&self.callbacks))))
    }
}

type Tick = Box<dyn FnMut(&mut Vec<u8>) + Send>;

/// Stream driven by a thread calling the callback once per period
struct FakeStream {
    tick: Arc<Mutex<Tick>>,
    period: Duration,
    callbacks: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FakeStream {
    fn new(tick: Tick, period: Duration, callbacks: Arc<AtomicUsize>) -> Self {
        Self {
            tick: Arc::new(Mutex::new(tick)),
            period,
            callbacks,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl AudioStream for FakeStream {
    fn start(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let running = Arc::clone(&self.running);
        let tick = Arc::clone(&self.tick);
        let callbacks = Arc::clone(&self.callbacks);
        let period = self.period;
        self.thread = Some(thread::spawn(move || {
            let mut buf = Vec::new();
            while running.load(Ordering::SeqCst) {
                {
                    let mut tick = tick.lock();
                    (*tick)(&mut buf);
                }
                callbacks.fetch_add(1, Ordering::SeqCst);
                thread::sleep(period);
            }
        }));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Raw fd reported by [`FakeDisplay`]
pub const FAKE_DISPLAY_FD: RawFd = 7;

static RAW_RELEASES: Mutex<Vec<(RawFd, u32, [u32; 4])>> = parking_lot::const_mutex(Vec::new());

fn record_raw_release(fd: RawFd, framebuffer: u32, handles: &[u32]) {
    let mut copy = [0u32; 4];
    for (out, handle) in copy.iter_mut().zip(handles) {
        *out = *handle;
    }
    RAW_RELEASES.lock().push((fd, framebuffer, copy));
}

/// Releases made through [`FakeDisplay::raw_release`] since the last call
pub fn take_raw_releases() -> Vec<(RawFd, u32, [u32; 4])> {
    std::mem::take(&mut *RAW_RELEASES.lock())
}

type SetPlaneCall = (PlaneId, Option<FramebufferId>, Rect, Rect);

struct DisplayState {
    connectors: Vec<ConnectorInfo>,
    property_writes: Vec<(PlaneId, PropertyId, u64)>,
    set_planes: Vec<SetPlaneCall>,
    framebuffers: Vec<(FramebufferId, FramebufferLayout)>,
    removed: Vec<FramebufferId>,
    handles: Vec<GemHandle>,
    closed: Vec<GemHandle>,
    dumb: Vec<(DumbBuffer, Vec<u8>)>,
    dumb_writes: usize,
    last_written: Option<GemHandle>,
    next_framebuffer: u32,
    next_dumb: u32,
    fail_set_plane: bool,
    reject_modifiers: bool,
}

/// One connected 800x480 panel on CRTC 31 with overlay plane 36 and
/// cursor plane 41
pub struct FakeDisplay {
    state: Mutex<DisplayState>,
}

impl FakeDisplay {
    pub fn new() -> Self {
        let mode = |name: &str, width, height, preferred| DisplayMode {
            name: name.into(),
            width,
            height,
            refresh: 60,
            preferred,
        };
        Self {
            state: Mutex::new(DisplayState {
                connectors: vec![
                    ConnectorInfo {
                        id: ConnectorId(49),
                        connected: false,
                        modes: Vec::new(),
                        crtc: None,
                    },
                    ConnectorInfo {
                        id: ConnectorId(50),
                        connected: true,
                        modes: vec![
                            mode("1280x720", 1280, 720, false),
                            mode("800x480", 800, 480, true),
                        ],
                        crtc: Some(CrtcId(31)),
                    },
                ],
                property_writes: Vec::new(),
                set_planes: Vec::new(),
                framebuffers: Vec::new(),
                removed: Vec::new(),
                handles: Vec::new(),
                closed: Vec::new(),
                dumb: Vec::new(),
                dumb_writes: 0,
                last_written: None,
                next_framebuffer: 200,
                next_dumb: 500,
                fail_set_plane: false,
                reject_modifiers: false,
            }),
        }
    }

    pub fn disconnect_all(&self) {
        for connector in &mut self.state.lock().connectors {
            connector.connected = false;
        }
    }

    pub fn set_fail_set_plane(&self, fail: bool) {
        self.state.lock().fail_set_plane = fail;
    }

    /// Refuse framebuffers carrying a format modifier
    pub fn set_reject_modifiers(&self, reject: bool) {
        self.state.lock().reject_modifiers = reject;
    }

    pub fn property_writes(&self) -> Vec<(PlaneId, PropertyId, u64)> {
        self.state.lock().property_writes.clone()
    }

    pub fn last_set_plane(&self) -> Option<SetPlaneCall> {
        self.state.lock().set_planes.last().copied()
    }

    pub fn set_plane_calls(&self) -> usize {
        self.state.lock().set_planes.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.state.lock().framebuffers.len()
    }

    /// Layout of a framebuffer that is still registered
    pub fn framebuffer_layout(&self, framebuffer: FramebufferId) -> Option<FramebufferLayout> {
        self.state
            .lock()
            .framebuffers
            .iter()
            .find(|(id, _)| *id == framebuffer)
            .map(|(_, layout)| layout.clone())
    }

    /// Framebuffers removed so far, in removal order
    pub fn removed_framebuffers(&self) -> Vec<FramebufferId> {
        self.state.lock().removed.clone()
    }

    pub fn live_handles(&self) -> usize {
        self.state.lock().handles.len()
    }

    pub fn closed_handles(&self) -> Vec<GemHandle> {
        self.state.lock().closed.clone()
    }

    pub fn live_dumb_buffers(&self) -> usize {
        self.state.lock().dumb.len()
    }

    /// Dumb buffers created so far, live or destroyed
    pub fn dumb_buffers_created(&self) -> u32 {
        self.state.lock().next_dumb - 500
    }

    pub fn dumb_writes(&self) -> usize {
        self.state.lock().dumb_writes
    }

    /// Contents of the most recently written dumb buffer, if still live
    pub fn dumb_contents(&self) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let handle = state.last_written?;
        state
            .dumb
            .iter()
            .find(|(buffer, _)| buffer.handle == handle)
            .map(|(_, bytes)| bytes.clone())
    }

    /// Live dumb buffers as created
    pub fn dumb_buffers(&self) -> Vec<DumbBuffer> {
        self.state.lock().dumb.iter().map(|(buffer, _)| *buffer).collect()
    }
}

impl Default for FakeDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayDevice for FakeDisplay {
    fn connectors(&self) -> Result<Vec<ConnectorInfo>> {
        Ok(self.state.lock().connectors.clone())
    }

    fn crtcs(&self) -> Result<Vec<CrtcId>> {
        Ok(vec![CrtcId(31), CrtcId(32)])
    }

    fn planes(&self) -> Result<Vec<PlaneInfo>> {
        let on_first = vec![CrtcId(31)];
        Ok(vec![
            PlaneInfo {
                id: PlaneId(33),
                kind: PlaneKind::Primary,
                crtcs: on_first.clone(),
            },
            PlaneInfo {
                id: PlaneId(36),
                kind: PlaneKind::Overlay,
                crtcs: on_first.clone(),
            },
            PlaneInfo {
                id: PlaneId(41),
                kind: PlaneKind::Cursor,
                crtcs: on_first,
            },
        ])
    }

    fn plane_properties(&self, plane: PlaneId) -> Result<Vec<PropertyInfo>> {
        if plane != PlaneId(36) {
            return Ok(Vec::new());
        }
        Ok(vec![
            PropertyInfo {
                id: PropertyId(99),
                name: "zpos".into(),
                enums: Vec::new(),
            },
            PropertyInfo {
                id: PropertyId(100),
                name: "COLOR_ENCODING".into(),
                enums: vec![
                    ("ITU-R BT.601 YCbCr".into(), 0),
                    ("ITU-R BT.709 YCbCr".into(), 1),
                    ("ITU-R BT.2020 YCbCr".into(), 2),
                ],
            },
        ])
    }

    fn set_plane_property(&self, plane: PlaneId, property: PropertyId, value: u64) -> Result<()> {
        self.state
            .lock()
            .property_writes
            .push((plane, property, value));
        Ok(())
    }

    fn import_prime(&self, fd: RawFd) -> Result<GemHandle> {
        if fd < 0 {
            return Err(SinkError::display("bad dma-buf fd"));
        }
        let handle = GemHandle(1000 + fd as u32);
        let mut state = self.state.lock();
        if !state.handles.contains(&handle) {
            state.handles.push(handle);
        }
        Ok(handle)
    }

    fn close_handle(&self, handle: GemHandle) -> Result<()> {
        let mut state = self.state.lock();
        let index = state
            .handles
            .iter()
            .position(|h| *h == handle)
            .ok_or_else(|| SinkError::display(format!("unknown GEM handle {}", handle)))?;
        state.handles.remove(index);
        state.closed.push(handle);
        Ok(())
    }

    fn add_framebuffer(&self, layout: &FramebufferLayout) -> Result<FramebufferId> {
        let mut state = self.state.lock();
        if layout.modifier.is_some() && state.reject_modifiers {
            return Err(SinkError::display("modifiers not supported"));
        }
        if layout.handles[0].is_none() {
            return Err(SinkError::display("no handle for plane 0"));
        }
        let id = FramebufferId(state.next_framebuffer);
        state.next_framebuffer += 1;
        state.framebuffers.push((id, layout.clone()));
        Ok(id)
    }

    fn remove_framebuffer(&self, framebuffer: FramebufferId) -> Result<()> {
        let mut state = self.state.lock();
        let index = state
            .framebuffers
            .iter()
            .position(|(id, _)| *id == framebuffer)
            .ok_or_else(|| SinkError::display(format!("unknown framebuffer {}", framebuffer)))?;
        state.framebuffers.remove(index);
        state.removed.push(framebuffer);
        Ok(())
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer> {
        let mut state = self.state.lock();
        let pitch = (width * bpp / 8 + 63) & !63;
        let buffer = DumbBuffer {
            handle: GemHandle(state.next_dumb),
            width,
            height,
            pitch,
            size: pitch as u64 * height as u64,
        };
        state.next_dumb += 1;
        state.dumb.push((buffer, vec![0; buffer.size as usize]));
        Ok(buffer)
    }

    fn write_dumb(&self, buffer: &DumbBuffer, fill: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        let mut state = self.state.lock();
        let bytes = state
            .dumb
            .iter_mut()
            .find(|(b, _)| b.handle == buffer.handle)
            .map(|(_, bytes)| bytes)
            .ok_or_else(|| SinkError::display("unknown dumb buffer"))?;
        fill(bytes.as_mut_slice());
        state.dumb_writes += 1;
        state.last_written = Some(buffer.handle);
        Ok(())
    }

    fn destroy_dumb(&self, buffer: DumbBuffer) -> Result<()> {
        let mut state = self.state.lock();
        let index = state
            .dumb
            .iter()
            .position(|(b, _)| b.handle == buffer.handle)
            .ok_or_else(|| SinkError::display("unknown dumb buffer"))?;
        state.dumb.remove(index);
        Ok(())
    }

    fn set_plane(
        &self,
        plane: PlaneId,
        _crtc: CrtcId,
        framebuffer: Option<FramebufferId>,
        destination: Rect,
        source: Rect,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_set_plane {
            return Err(SinkError::display("SetPlane refused"));
        }
        state
            .set_planes
            .push((plane, framebuffer, destination, source));
        Ok(())
    }

    fn raw_fd(&self) -> RawFd {
        FAKE_DISPLAY_FD
    }

    fn raw_release() -> RawRelease {
        record_raw_release
    }
}

enum FakePixels {
    Prime(PrimeDescriptor),
    /// NV12 luma and chroma planes
    Nv12(Vec<u8>, Vec<u8>),
}

/// Decoded picture that counts itself while alive
pub struct FakeFrame {
    width: u32,
    height: u32,
    pixels: FakePixels,
    alive: Arc<AtomicUsize>,
}

impl Drop for FakeFrame {
    fn drop(&mut self) {
        self.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DecodedFrame for FakeFrame {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn memory(&self) -> FrameMemory {
        match &self.pixels {
            FakePixels::Prime(descriptor) => FrameMemory::Prime(descriptor.clone()),
            FakePixels::Nv12(..) => FrameMemory::Cpu,
        }
    }
}

/// Emits one frame per submitted access unit
///
/// Zero-copy frames carry one DMA-BUF (fd counting up from 10) holding
/// an NV12 picture; software frames are white NV12 images.
pub struct FakeDecoder {
    mode: DecodeMode,
    frame_size: Arc<Mutex<(u32, u32)>>,
    alive: Arc<AtomicUsize>,
    queued: VecDeque<FakeFrame>,
    next_fd: RawFd,
    units: Arc<Mutex<Vec<Vec<u8>>>>,
    flushed: Arc<AtomicBool>,
    receive_error: Arc<Mutex<Option<SinkError>>>,
}

impl FakeDecoder {
    fn frame(&mut self) -> FakeFrame {
        let (width, height) = *self.frame_size.lock();
        let pixels = match self.mode {
            DecodeMode::ZeroCopy => {
                let fd = self.next_fd;
                self.next_fd += 1;
                let luma = width * height;
                FakePixels::Prime(PrimeDescriptor {
                    objects: smallvec![PrimeObject {
                        fd,
                        size: (luma * 3 / 2) as usize,
                        modifier: 0,
                    }],
                    fourcc: FOURCC_NV12,
                    planes: smallvec![
                        PrimePlane {
                            object_index: 0,
                            offset: 0,
                            pitch: width,
                        },
                        PrimePlane {
                            object_index: 0,
                            offset: luma,
                            pitch: width,
                        },
                    ],
                })
            }
            DecodeMode::Software => {
                let luma = (width * height) as usize;
                let chroma = (width * height.div_ceil(2)) as usize;
                FakePixels::Nv12(vec![235; luma], vec![128; chroma])
            }
        };
        self.alive.fetch_add(1, Ordering::SeqCst);
        FakeFrame {
            width,
            height,
            pixels,
            alive: Arc::clone(&self.alive),
        }
    }
}

impl VideoDecoder for FakeDecoder {
    type Frame = FakeFrame;

    fn mode(&self) -> DecodeMode {
        self.mode
    }

    fn send(&mut self, access_unit: &[u8]) -> Result<()> {
        self.units.lock().push(access_unit.to_vec());
        let frame = self.frame();
        self.queued.push_back(frame);
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<FakeFrame>> {
        if let Some(e) = self.receive_error.lock().take() {
            return Err(e);
        }
        Ok(self.queued.pop_front())
    }

    fn flush(&mut self) {
        self.queued.clear();
        self.flushed.store(true, Ordering::SeqCst);
    }

    fn convert_to_xrgb(&mut self, frame: &FakeFrame, dst: &mut [u8], pitch: usize) -> Result<()> {
        let FakePixels::Nv12(luma, chroma) = &frame.pixels else {
            return Err(SinkError::decoder("frame has no CPU pixels"));
        };
        let stride = frame.width as usize;
        let image = PlanarImage {
            format: PlanarFormat::Nv12,
            width: frame.width,
            height: frame.height,
            planes: smallvec![
                PlaneData { data: luma, stride },
                PlaneData { data: chroma, stride },
            ],
        };
        convert::convert_to_xrgb(&image, dst, pitch)
    }
}

/// Backend pairing a [`FakeDisplay`] with [`FakeDecoder`]s
pub struct FakeBackend {
    pub display: Arc<FakeDisplay>,
    mode: DecodeMode,
    frame_size: Arc<Mutex<(u32, u32)>>,
    alive: Arc<AtomicUsize>,
    units: Arc<Mutex<Vec<Vec<u8>>>>,
    flushed: Arc<AtomicBool>,
    fail_decoder: AtomicBool,
    receive_error: Arc<Mutex<Option<SinkError>>>,
}

impl FakeBackend {
    pub fn new(mode: DecodeMode) -> Self {
        Self {
            display: Arc::new(FakeDisplay::new()),
            mode,
            frame_size: Arc::new(Mutex::new((640, 360))),
            alive: Arc::new(AtomicUsize::new(0)),
            units: Arc::new(Mutex::new(Vec::new())),
            flushed: Arc::new(AtomicBool::new(false)),
            fail_decoder: AtomicBool::new(false),
            receive_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Size of frames decoded from now on
    pub fn set_frame_size(&self, width: u32, height: u32) {
        *self.frame_size.lock() = (width, height);
    }

    pub fn set_fail_decoder(&self, fail: bool) {
        self.fail_decoder.store(fail, Ordering::SeqCst);
    }

    /// Make the next receive call return `error`
    pub fn fail_next_receive(&self, error: SinkError) {
        *self.receive_error.lock() = Some(error);
    }

    /// Decoded frames not yet dropped
    pub fn frames_alive(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    /// Access units submitted to any decoder
    pub fn units(&self) -> Vec<Vec<u8>> {
        self.units.lock().clone()
    }

    pub fn was_flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }
}

impl VideoBackend for FakeBackend {
    type Display = FakeDisplay;
    type Decoder = FakeDecoder;

    fn open_display(&self, _config: &dyn MediaConfig) -> Result<Arc<FakeDisplay>> {
        Ok(Arc::clone(&self.display))
    }

    fn open_decoder(&self, _config: &dyn MediaConfig) -> Result<FakeDecoder> {
        if self.fail_decoder.load(Ordering::SeqCst) {
            return Err(SinkError::decoder("h264 decoder unavailable"));
        }
        Ok(FakeDecoder {
            mode: self.mode,
            frame_size: Arc::clone(&self.frame_size),
            alive: Arc::clone(&self.alive),
            queued: VecDeque::new(),
            next_fd: 10,
            units: Arc::clone(&self.units),
            flushed: Arc::clone(&self.flushed),
            receive_error: Arc::clone(&self.receive_error),
        })
    }
}
