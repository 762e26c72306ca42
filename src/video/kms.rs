//! DRM/KMS card access through the `drm` crate

use crate::error::{Result, SinkError};
use crate::video::display::{
    ConnectorId, ConnectorInfo, CrtcId, DisplayDevice, DisplayMode, DumbBuffer, FramebufferId,
    FramebufferLayout, GemHandle, PlaneId, PlaneInfo, PlaneKind, PropertyId, PropertyInfo,
    RawRelease, Rect,
};
use drm::buffer::{DrmFourcc, DrmModifier, PlanarBuffer};
use drm::control::{
    self, connector, crtc, dumbbuffer, framebuffer, plane, property, Device as ControlDevice,
    FbCmd2Flags, ModeTypeFlags,
};
use memmap2::{MmapMut, MmapOptions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::num::NonZeroU32;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::Path;
use tracing::{debug, info, warn};

fn kms_error(what: &str, e: std::io::Error) -> SinkError {
    SinkError::display(format!("{}: {}", what, e))
}

fn handle<T: control::ResourceHandle>(raw: u32, what: &str) -> Result<T> {
    control::from_u32(raw).ok_or_else(|| SinkError::display(format!("invalid {} id 0", what)))
}

fn buffer_handle(handle: GemHandle) -> Result<drm::buffer::Handle> {
    NonZeroU32::new(handle.0)
        .map(drm::buffer::Handle::from)
        .ok_or_else(|| SinkError::display("invalid GEM handle 0"))
}

/// A dumb buffer with its CPU mapping, kept for the buffer's lifetime
struct MappedDumb {
    buffer: dumbbuffer::DumbBuffer,
    pixels: MmapMut,
}

/// An opened DRM card node
pub struct KmsDevice {
    file: File,
    /// Dumb buffers by GEM handle; the drm type cannot be rebuilt from ids
    dumb: Mutex<HashMap<u32, MappedDumb>>,
}

impl AsFd for KmsDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl drm::Device for KmsDevice {}
impl ControlDevice for KmsDevice {}

impl KmsDevice {
    /// Open a card node and take display master when it is free
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| kms_error(&format!("open {}", path.display()), e))?;
        let device = Self {
            file,
            dumb: Mutex::new(HashMap::new()),
        };

        drm::Device::set_client_capability(&device, drm::ClientCapability::UniversalPlanes, true)
            .map_err(|e| kms_error("enable universal planes", e))?;
        if let Err(e) = drm::Device::acquire_master_lock(&device) {
            warn!("DRM master not acquired ({}), plane updates may fail", e);
        }

        info!("Opened DRM device {}", path.display());
        Ok(device)
    }

    fn plane_kind(&self, plane: plane::Handle) -> Result<PlaneKind> {
        let properties = self
            .get_properties(plane)
            .map_err(|e| kms_error("plane properties", e))?;
        let (ids, values) = properties.as_props_and_values();
        for (id, value) in ids.iter().zip(values) {
            let info = self
                .get_property(*id)
                .map_err(|e| kms_error("property info", e))?;
            if info.name().to_bytes() == b"type" {
                return Ok(match *value {
                    1 => PlaneKind::Primary,
                    2 => PlaneKind::Cursor,
                    _ => PlaneKind::Overlay,
                });
            }
        }
        Ok(PlaneKind::Overlay)
    }
}

/// [`FramebufferLayout`] seen through the drm crate's buffer trait
struct Planar<'a> {
    layout: &'a FramebufferLayout,
    format: DrmFourcc,
}

impl PlanarBuffer for Planar<'_> {
    fn size(&self) -> (u32, u32) {
        (self.layout.width, self.layout.height)
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        self.layout.modifier.map(DrmModifier::from)
    }

    fn pitches(&self) -> [u32; 4] {
        self.layout.pitches
    }

    fn handles(&self) -> [Option<drm::buffer::Handle>; 4] {
        self.layout
            .handles
            .map(|handle| handle.and_then(|h| buffer_handle(h).ok()))
    }

    fn offsets(&self) -> [u32; 4] {
        self.layout.offsets
    }
}

impl DisplayDevice for KmsDevice {
    fn connectors(&self) -> Result<Vec<ConnectorInfo>> {
        let resources = self
            .resource_handles()
            .map_err(|e| kms_error("resources", e))?;

        let mut connectors = Vec::new();
        for &id in resources.connectors() {
            let info = match self.get_connector(id, false) {
                Ok(info) => info,
                Err(e) => {
                    debug!("Skipping connector {:?}: {}", id, e);
                    continue;
                }
            };

            let modes = info
                .modes()
                .iter()
                .map(|mode| {
                    let (width, height) = mode.size();
                    DisplayMode {
                        name: mode.name().to_string_lossy().into_owned(),
                        width,
                        height,
                        refresh: mode.vrefresh(),
                        preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
                    }
                })
                .collect();

            let crtc = info
                .current_encoder()
                .and_then(|encoder| self.get_encoder(encoder).ok())
                .and_then(|encoder| encoder.crtc())
                .map(|crtc| CrtcId(crtc.into()));

            connectors.push(ConnectorInfo {
                id: ConnectorId(id.into()),
                connected: info.state() == connector::State::Connected,
                modes,
                crtc,
            });
        }
        Ok(connectors)
    }

    fn crtcs(&self) -> Result<Vec<CrtcId>> {
        let resources = self
            .resource_handles()
            .map_err(|e| kms_error("resources", e))?;
        Ok(resources
            .crtcs()
            .iter()
            .map(|&crtc| CrtcId(crtc.into()))
            .collect())
    }

    fn planes(&self) -> Result<Vec<PlaneInfo>> {
        let resources = self
            .resource_handles()
            .map_err(|e| kms_error("resources", e))?;
        let handles = self.plane_handles().map_err(|e| kms_error("planes", e))?;

        let mut planes = Vec::with_capacity(handles.len());
        for id in handles {
            let info = self.get_plane(id).map_err(|e| kms_error("plane info", e))?;
            let crtcs = resources
                .filter_crtcs(info.possible_crtcs())
                .into_iter()
                .map(|crtc| CrtcId(crtc.into()))
                .collect();
            planes.push(PlaneInfo {
                id: PlaneId(id.into()),
                kind: self.plane_kind(id)?,
                crtcs,
            });
        }
        Ok(planes)
    }

    fn plane_properties(&self, plane: PlaneId) -> Result<Vec<PropertyInfo>> {
        let plane: plane::Handle = handle(plane.0, "plane")?;
        let properties = self
            .get_properties(plane)
            .map_err(|e| kms_error("plane properties", e))?;
        let (ids, _) = properties.as_props_and_values();

        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            let info = self
                .get_property(id)
                .map_err(|e| kms_error("property info", e))?;
            let enums = match info.value_type() {
                property::ValueType::Enum(values) => values
                    .values()
                    .1
                    .iter()
                    .map(|entry| (entry.name().to_string_lossy().into_owned(), entry.value()))
                    .collect(),
                _ => Vec::new(),
            };
            out.push(PropertyInfo {
                id: PropertyId(id.into()),
                name: info.name().to_string_lossy().into_owned(),
                enums,
            });
        }
        Ok(out)
    }

    fn set_plane_property(&self, plane: PlaneId, property: PropertyId, value: u64) -> Result<()> {
        let plane: plane::Handle = handle(plane.0, "plane")?;
        let property: property::Handle = handle(property.0, "property")?;
        self.set_property(plane, property, value)
            .map_err(|e| kms_error("set property", e))
    }

    fn import_prime(&self, fd: RawFd) -> Result<GemHandle> {
        // The fd stays owned by the decoder's frame
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        let handle = self
            .prime_fd_to_buffer(fd)
            .map_err(|e| kms_error("prime import", e))?;
        Ok(GemHandle(handle.into()))
    }

    fn close_handle(&self, handle: GemHandle) -> Result<()> {
        self.close_buffer(buffer_handle(handle)?)
            .map_err(|e| kms_error("GEM close", e))
    }

    fn add_framebuffer(&self, layout: &FramebufferLayout) -> Result<FramebufferId> {
        let format = DrmFourcc::try_from(layout.fourcc)
            .map_err(|_| SinkError::display(format!("unknown fourcc {:#010x}", layout.fourcc)))?;
        let flags = if layout.modifier.is_some() {
            FbCmd2Flags::MODIFIERS
        } else {
            FbCmd2Flags::empty()
        };
        let framebuffer = self
            .add_planar_framebuffer(&Planar { layout, format }, flags)
            .map_err(|e| kms_error("AddFB2", e))?;
        Ok(FramebufferId(framebuffer.into()))
    }

    fn remove_framebuffer(&self, framebuffer: FramebufferId) -> Result<()> {
        let framebuffer: framebuffer::Handle = handle(framebuffer.0, "framebuffer")?;
        self.destroy_framebuffer(framebuffer)
            .map_err(|e| kms_error("RmFB", e))
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer> {
        let dumb = self
            .create_dumb_buffer((width, height), DrmFourcc::Xrgb8888, bpp)
            .map_err(|e| kms_error("create dumb buffer", e))?;
        let handle: u32 = drm::buffer::Buffer::handle(&dumb).into();
        let pitch = drm::buffer::Buffer::pitch(&dumb);
        let size = pitch as u64 * height as u64;

        let pixels = match drm_ffi::mode::dumbbuffer::map(self.as_fd(), handle, 0, 0).and_then(
            |info| {
                // SAFETY: the range is the kernel's mapping of this dumb buffer;
                // it is unmapped before the buffer is destroyed.
                unsafe {
                    MmapOptions::new()
                        .offset(info.offset)
                        .len(size as usize)
                        .map_mut(&self.file)
                }
            },
        ) {
            Ok(pixels) => pixels,
            Err(e) => {
                let _ = self.destroy_dumb_buffer(dumb);
                return Err(kms_error("map dumb buffer", e));
            }
        };

        let buffer = DumbBuffer {
            handle: GemHandle(handle),
            width,
            height,
            pitch,
            size,
        };
        self.dumb.lock().insert(handle, MappedDumb { buffer: dumb, pixels });
        Ok(buffer)
    }

    fn write_dumb(&self, buffer: &DumbBuffer, fill: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        let mut dumb = self.dumb.lock();
        let mapped = dumb
            .get_mut(&buffer.handle.0)
            .ok_or_else(|| SinkError::display(format!("unknown dumb buffer {}", buffer.handle)))?;
        fill(&mut mapped.pixels[..]);
        Ok(())
    }

    fn destroy_dumb(&self, buffer: DumbBuffer) -> Result<()> {
        let MappedDumb { buffer: dumb, pixels } = self
            .dumb
            .lock()
            .remove(&buffer.handle.0)
            .ok_or_else(|| SinkError::display(format!("unknown dumb buffer {}", buffer.handle)))?;
        drop(pixels);
        self.destroy_dumb_buffer(dumb)
            .map_err(|e| kms_error("destroy dumb buffer", e))
    }

    fn set_plane(
        &self,
        plane: PlaneId,
        crtc: CrtcId,
        framebuffer: Option<FramebufferId>,
        destination: Rect,
        source: Rect,
    ) -> Result<()> {
        let plane: plane::Handle = handle(plane.0, "plane")?;
        let crtc: crtc::Handle = handle(crtc.0, "CRTC")?;
        let framebuffer = framebuffer
            .map(|fb| handle::<framebuffer::Handle>(fb.0, "framebuffer"))
            .transpose()?;

        ControlDevice::set_plane(
            self,
            plane,
            crtc,
            framebuffer,
            0,
            (
                destination.x,
                destination.y,
                destination.width,
                destination.height,
            ),
            (
                source.x.max(0) as u32,
                source.y.max(0) as u32,
                source.width,
                source.height,
            ),
        )
        .map_err(|e| kms_error("SetPlane", e))
    }

    fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn raw_release() -> RawRelease {
        release_raw
    }
}

/// A card fd borrowed for the termination path
struct RawCard<'a>(BorrowedFd<'a>);

impl AsFd for RawCard<'_> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0
    }
}

impl drm::Device for RawCard<'_> {}
impl ControlDevice for RawCard<'_> {}

/// Remove a framebuffer and close GEM handles using only ioctls
fn release_raw(fd: RawFd, framebuffer: u32, handles: &[u32]) {
    if fd < 0 {
        return;
    }
    // The fd belongs to the still-open KmsDevice
    let card = RawCard(unsafe { BorrowedFd::borrow_raw(fd) });

    if let Some(framebuffer) = control::from_u32::<framebuffer::Handle>(framebuffer) {
        let _ = card.destroy_framebuffer(framebuffer);
    }
    for (i, &raw) in handles.iter().enumerate() {
        if handles[..i].contains(&raw) {
            continue;
        }
        if let Some(raw) = NonZeroU32::new(raw) {
            let _ = card.close_buffer(drm::buffer::Handle::from(raw));
        }
    }
}
