//! Hardware cursor on a dedicated cursor plane

use crate::error::Result;
use crate::video::display::{
    CrtcId, DisplayDevice, DumbBuffer, FramebufferId, FramebufferLayout, PlaneId, Rect,
    FOURCC_ARGB8888,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cursor image edge in pixels
pub const CURSOR_SIZE: u32 = 64;

const BLACK: u32 = 0xFF00_0000;
const WHITE: u32 = 0xFFFF_FFFF;

/// Draw the arrow glyph into a cleared ARGB8888 image
///
/// A 16 px tall arrow with a black outline and white fill, plus a tail.
pub fn draw_arrow(pixels: &mut [u8], pitch: usize) {
    let mut put = |x: usize, y: usize, color: u32| {
        let at = y * pitch + x * 4;
        if let Some(px) = pixels.get_mut(at..at + 4) {
            px.copy_from_slice(&color.to_le_bytes());
        }
    };

    for y in 0..16 {
        for x in (0..=y).take_while(|&x| x < 12) {
            let outline = x == 0 || x == y || y == 15;
            put(x, y, if outline { BLACK } else { WHITE });
        }
    }
    for y in 10..16 {
        for x in 4..8 {
            let outline = x == 4 || x == 7 || y == 15;
            put(x, y, if outline { BLACK } else { WHITE });
        }
    }
}

struct CursorState {
    buffer: Option<DumbBuffer>,
    framebuffer: Option<FramebufferId>,
    x: i32,
    y: i32,
    visible: bool,
    failure_logged: bool,
}

/// Cursor plane state, shared between pointer input and video teardown
pub struct CursorSession<D: DisplayDevice> {
    device: Arc<D>,
    plane: PlaneId,
    crtc: CrtcId,
    state: Mutex<CursorState>,
}

impl<D: DisplayDevice> CursorSession<D> {
    /// Allocate the cursor image and framebuffer; starts hidden at (0, 0)
    pub fn attach(device: Arc<D>, plane: PlaneId, crtc: CrtcId) -> Result<Arc<Self>> {
        let buffer = device.create_dumb(CURSOR_SIZE, CURSOR_SIZE, 32)?;
        let layout = FramebufferLayout::dumb(&buffer, CURSOR_SIZE, CURSOR_SIZE, FOURCC_ARGB8888);

        let framebuffer = match device.add_framebuffer(&layout) {
            Ok(fb) => fb,
            Err(e) => {
                let _ = device.destroy_dumb(buffer);
                return Err(e);
            }
        };

        let pitch = buffer.pitch as usize;
        let drawn = device.write_dumb(&buffer, &mut |pixels| {
            pixels.fill(0);
            draw_arrow(pixels, pitch);
        });
        if let Err(e) = drawn {
            let _ = device.remove_framebuffer(framebuffer);
            let _ = device.destroy_dumb(buffer);
            return Err(e);
        }

        info!(
            "Cursor attached on plane {}, CRTC {}, framebuffer {}",
            plane, crtc, framebuffer
        );

        Ok(Arc::new(Self {
            device,
            plane,
            crtc,
            state: Mutex::new(CursorState {
                buffer: Some(buffer),
                framebuffer: Some(framebuffer),
                x: 0,
                y: 0,
                visible: false,
                failure_logged: false,
            }),
        }))
    }

    fn show_at(&self, framebuffer: FramebufferId, x: i32, y: i32) -> Result<()> {
        self.device.set_plane(
            self.plane,
            self.crtc,
            Some(framebuffer),
            Rect::new(x, y, CURSOR_SIZE, CURSOR_SIZE),
            Rect::source(CURSOR_SIZE, CURSOR_SIZE),
        )
    }

    fn hide(&self) -> Result<()> {
        self.device.set_plane(
            self.plane,
            self.crtc,
            None,
            Rect::new(0, 0, 0, 0),
            Rect::new(0, 0, 0, 0),
        )
    }

    /// Move the cursor; it becomes visible on the first successful move
    pub fn update_position(&self, x: i32, y: i32) {
        let mut state = self.state.lock();
        let Some(framebuffer) = state.framebuffer else {
            return;
        };
        state.x = x;
        state.y = y;

        match self.show_at(framebuffer, x, y) {
            Ok(()) => {
                if !state.visible {
                    state.visible = true;
                    info!("Cursor visible on plane {}", self.plane);
                }
            }
            Err(e) => {
                if !state.failure_logged {
                    state.failure_logged = true;
                    warn!("Failed to move cursor plane: {}", e);
                }
            }
        }
    }

    /// Show at the stored position, or disable the plane
    pub fn set_visible(&self, visible: bool) {
        let mut state = self.state.lock();
        let Some(framebuffer) = state.framebuffer else {
            return;
        };

        if visible && !state.visible {
            match self.show_at(framebuffer, state.x, state.y) {
                Ok(()) => {
                    state.visible = true;
                    debug!("Cursor shown");
                }
                Err(e) => debug!("Failed to show cursor: {}", e),
            }
        } else if !visible && state.visible {
            if let Err(e) = self.hide() {
                debug!("Failed to disable cursor plane: {}", e);
            }
            state.visible = false;
            debug!("Cursor hidden");
        }
    }

    /// Disable the plane and free the image; later calls do nothing
    pub fn detach(&self) {
        let mut state = self.state.lock();
        let Some(framebuffer) = state.framebuffer.take() else {
            return;
        };

        if let Err(e) = self.hide() {
            debug!("Failed to disable cursor plane: {}", e);
        }
        if let Err(e) = self.device.remove_framebuffer(framebuffer) {
            warn!("Failed to remove cursor framebuffer: {}", e);
        }
        if let Some(buffer) = state.buffer.take() {
            if let Err(e) = self.device.destroy_dumb(buffer) {
                warn!("Failed to destroy cursor buffer: {}", e);
            }
        }
        state.visible = false;
        info!("Cursor detached");
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().framebuffer.is_some()
    }

    pub fn is_visible(&self) -> bool {
        self.state.lock().visible
    }

    pub fn position(&self) -> (i32, i32) {
        let state = self.state.lock();
        (state.x, state.y)
    }
}
