//! Kernel display (DRM/KMS) object model and session selection

use crate::config::MediaConfig;
use crate::error::{Result, SinkError};
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use tracing::{debug, info, warn};

macro_rules! object_id {
    ($($name:ident),* $(,)?) => {$(
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    )*};
}

object_id!(ConnectorId, CrtcId, PlaneId, FramebufferId, GemHandle, PropertyId);

/// DRM fourcc code from its four characters
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

pub const FOURCC_XRGB8888: u32 = fourcc(b"XR24");
pub const FOURCC_ARGB8888: u32 = fourcc(b"AR24");
pub const FOURCC_NV12: u32 = fourcc(b"NV12");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMode {
    pub name: String,
    pub width: u16,
    pub height: u16,
    pub refresh: u32,
    pub preferred: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    pub id: ConnectorId,
    pub connected: bool,
    pub modes: Vec<DisplayMode>,
    /// CRTC of the encoder currently driving the connector
    pub crtc: Option<CrtcId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneKind {
    Primary,
    Overlay,
    Cursor,
}

#[derive(Debug, Clone)]
pub struct PlaneInfo {
    pub id: PlaneId,
    pub kind: PlaneKind,
    /// CRTCs this plane can be attached to
    pub crtcs: Vec<CrtcId>,
}

#[derive(Debug, Clone)]
pub struct PropertyInfo {
    pub id: PropertyId,
    pub name: String,
    /// Enum entries (name, value); empty for non-enum properties
    pub enums: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Full-frame source rectangle in 16.16 fixed point
    pub fn source(width: u32, height: u32) -> Self {
        Self::new(0, 0, width << 16, height << 16)
    }
}

/// Arguments to add a (possibly multi-planar) framebuffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferLayout {
    pub width: u32,
    pub height: u32,
    pub fourcc: u32,
    pub handles: [Option<GemHandle>; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    /// Format modifier; `None` adds the framebuffer without modifiers
    pub modifier: Option<u64>,
}

impl FramebufferLayout {
    /// Single-plane layout over a dumb buffer
    pub fn dumb(buffer: &DumbBuffer, width: u32, height: u32, fourcc: u32) -> Self {
        Self {
            width,
            height,
            fourcc,
            handles: [Some(buffer.handle), None, None, None],
            pitches: [buffer.pitch, 0, 0, 0],
            offsets: [0; 4],
            modifier: None,
        }
    }
}

/// CPU-mappable scanout buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbBuffer {
    pub handle: GemHandle,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub size: u64,
}

/// Releases a framebuffer and its GEM handles given only the raw card fd
///
/// Must not allocate or lock; used from the termination path.
pub type RawRelease = fn(fd: RawFd, framebuffer: u32, handles: &[u32]);

/// Operations on an opened DRM card
///
/// Methods take `&self` so a device can be shared between the video path
/// and the cursor session.
pub trait DisplayDevice: Send + Sync {
    fn connectors(&self) -> Result<Vec<ConnectorInfo>>;
    fn crtcs(&self) -> Result<Vec<CrtcId>>;
    fn planes(&self) -> Result<Vec<PlaneInfo>>;
    fn plane_properties(&self, plane: PlaneId) -> Result<Vec<PropertyInfo>>;
    fn set_plane_property(&self, plane: PlaneId, property: PropertyId, value: u64) -> Result<()>;

    /// Import a DMA-BUF fd as a GEM handle
    fn import_prime(&self, fd: RawFd) -> Result<GemHandle>;
    fn close_handle(&self, handle: GemHandle) -> Result<()>;

    fn add_framebuffer(&self, layout: &FramebufferLayout) -> Result<FramebufferId>;
    fn remove_framebuffer(&self, framebuffer: FramebufferId) -> Result<()>;

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer>;
    /// Hand the buffer's CPU mapping to `fill`
    ///
    /// The mapping is made once in `create_dumb` and lives until
    /// `destroy_dumb`, so each call refreshes the same pixels in place.
    fn write_dumb(&self, buffer: &DumbBuffer, fill: &mut dyn FnMut(&mut [u8])) -> Result<()>;
    fn destroy_dumb(&self, buffer: DumbBuffer) -> Result<()>;

    /// Show `framebuffer` on `plane`, or disable the plane with `None`
    ///
    /// `source` is in 16.16 fixed point.
    fn set_plane(
        &self,
        plane: PlaneId,
        crtc: CrtcId,
        framebuffer: Option<FramebufferId>,
        destination: Rect,
        source: Rect,
    ) -> Result<()>;

    fn raw_fd(&self) -> RawFd;

    /// Allocation-free release usable from the termination path
    fn raw_release() -> RawRelease
    where
        Self: Sized;
}

/// Display objects picked for one video session
pub struct DisplaySession<D: DisplayDevice> {
    device: Arc<D>,
    pub connector: ConnectorId,
    pub mode: DisplayMode,
    pub crtc: CrtcId,
    pub video_plane: PlaneId,
    pub cursor_plane: Option<PlaneId>,
}

impl<D: DisplayDevice> DisplaySession<D> {
    /// Select connector, mode, CRTC and planes, then set BT.709 encoding
    pub fn open(device: Arc<D>, config: &dyn MediaConfig) -> Result<Self> {
        let connectors = device.connectors()?;
        let connector = connectors
            .iter()
            .find(|c| c.connected && !c.modes.is_empty())
            .ok_or_else(|| SinkError::display("no connected connector with modes"))?;

        let mode = connector
            .modes
            .iter()
            .find(|m| m.preferred)
            .or_else(|| connector.modes.first())
            .cloned()
            .ok_or_else(|| SinkError::display("connector has no modes"))?;

        let crtc = match connector.crtc {
            Some(crtc) => crtc,
            None => *device
                .crtcs()?
                .first()
                .ok_or_else(|| SinkError::display("no CRTC available"))?,
        };

        let planes = device.planes()?;
        let video_plane = select_plane(&planes, crtc, PlaneKind::Overlay, config.video_plane())
            .or_else(|| select_plane(&planes, crtc, PlaneKind::Primary, None))
            .ok_or_else(|| SinkError::display(format!("no video plane for CRTC {}", crtc)))?;
        let cursor_plane = select_plane(&planes, crtc, PlaneKind::Cursor, config.cursor_plane());

        info!(
            "Display: connector {} mode {} ({}x{}@{}), CRTC {}, video plane {}, cursor plane {}",
            connector.id,
            mode.name,
            mode.width,
            mode.height,
            mode.refresh,
            crtc,
            video_plane,
            cursor_plane.map_or_else(|| "none".to_string(), |p| p.to_string())
        );

        let session = Self {
            connector: connector.id,
            mode,
            crtc,
            video_plane,
            cursor_plane,
            device,
        };
        session.set_bt709();
        Ok(session)
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Whole-screen destination rectangle
    pub fn screen(&self) -> Rect {
        Rect::new(0, 0, self.mode.width as u32, self.mode.height as u32)
    }

    /// Put `framebuffer` (of `width` x `height`) on the video plane, scaled to the screen
    pub fn present(&self, framebuffer: FramebufferId, width: u32, height: u32) -> Result<()> {
        self.device.set_plane(
            self.video_plane,
            self.crtc,
            Some(framebuffer),
            self.screen(),
            Rect::source(width, height),
        )
    }

    /// Decoders emit BT.709; many drivers default planes to BT.601
    fn set_bt709(&self) {
        let properties = match self.device.plane_properties(self.video_plane) {
            Ok(properties) => properties,
            Err(e) => {
                warn!("Could not read plane properties: {}", e);
                return;
            }
        };

        let Some(property) = properties.iter().find(|p| p.name == "COLOR_ENCODING") else {
            info!("Plane {} has no COLOR_ENCODING property", self.video_plane);
            return;
        };
        let Some((name, value)) = property.enums.iter().find(|(name, _)| name.contains("709"))
        else {
            warn!("BT.709 not offered by COLOR_ENCODING");
            return;
        };

        match self
            .device
            .set_plane_property(self.video_plane, property.id, *value)
        {
            Ok(()) => info!("COLOR_ENCODING set to {}", name),
            Err(e) => warn!("Failed to set COLOR_ENCODING: {}", e),
        }
    }
}

fn select_plane(
    planes: &[PlaneInfo],
    crtc: CrtcId,
    kind: PlaneKind,
    configured: Option<u32>,
) -> Option<PlaneId> {
    if let Some(id) = configured {
        if planes.iter().any(|p| p.id.0 == id) {
            return Some(PlaneId(id));
        }
        warn!("Configured plane {} not found, selecting automatically", id);
    }
    let plane = planes
        .iter()
        .find(|p| p.kind == kind && p.crtcs.contains(&crtc))
        .map(|p| p.id);
    debug!("Selected {:?} plane: {:?}", kind, plane);
    plane
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDisplay, TestConfig};

    #[test]
    fn test_fourcc() {
        assert_eq!(FOURCC_XRGB8888, 0x3432_5258);
        assert_eq!(FOURCC_NV12, 0x3231_564e);
    }

    #[test]
    fn test_session_selects_preferred_mode_and_planes() {
        let display = Arc::new(FakeDisplay::new());
        let session = DisplaySession::open(Arc::clone(&display), &TestConfig::default()).unwrap();

        assert_eq!(session.connector, ConnectorId(50));
        assert_eq!(session.mode.width, 800);
        assert_eq!(session.crtc, CrtcId(31));
        assert_eq!(session.video_plane, PlaneId(36));
        assert_eq!(session.cursor_plane, Some(PlaneId(41)));
    }

    #[test]
    fn test_session_sets_bt709() {
        let display = Arc::new(FakeDisplay::new());
        DisplaySession::open(Arc::clone(&display), &TestConfig::default()).unwrap();

        let set = display.property_writes();
        assert_eq!(set, vec![(PlaneId(36), PropertyId(100), 1)]);
    }

    #[test]
    fn test_session_without_connected_connector() {
        let display = Arc::new(FakeDisplay::new());
        display.disconnect_all();
        let err = DisplaySession::open(display, &TestConfig::default()).err();
        assert!(matches!(err, Some(SinkError::Display(_))));
    }

    #[test]
    fn test_present_scales_to_screen() {
        let display = Arc::new(FakeDisplay::new());
        let session = DisplaySession::open(Arc::clone(&display), &TestConfig::default()).unwrap();
        session.present(FramebufferId(7), 640, 360).unwrap();

        let (plane, fb, dst, src) = display.last_set_plane().unwrap();
        assert_eq!(plane, PlaneId(36));
        assert_eq!(fb, Some(FramebufferId(7)));
        assert_eq!(dst, Rect::new(0, 0, 800, 480));
        assert_eq!(src, Rect::new(0, 0, 640 << 16, 360 << 16));
    }
}
