//! H.264 decoding through FFmpeg with a DRM hardware device
//!
//! When a DRM hwdevice context can be created the decoder is steered to
//! `DRM_PRIME` output and frames are presented without copying. Otherwise
//! FFmpeg's software decoder produces CPU frames, which libswscale converts
//! straight into the mapped dumb buffer.

use crate::config::MediaConfig;
use crate::error::{Result, SinkError};
use crate::video::decoder::{
    DecodeMode, DecodedFrame, FrameMemory, PrimeDescriptor, PrimeObject, PrimePlane,
    VideoDecoder,
};
use crate::video::kms::KmsDevice;
use crate::video::output::VideoBackend;
use ffmpeg_next as ffmpeg;
use ffmpeg::ffi::{AVBufferRef, AVCodecContext, AVHWDeviceType, AVPixelFormat};
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling;
use std::ffi::CString;
use std::os::raw::c_int;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::Arc;
use tracing::{debug, info, warn};

const AV_CODEC_FLAG_LOW_DELAY: i32 = 1 << 19;
const AV_CODEC_FLAG2_FAST: i32 = 1 << 0;
const FF_EC_GUESS_MVS: i32 = 1;
const FF_EC_DEBLOCK: i32 = 2;
const AV_EF_IGNORE_ERR: i32 = 1 << 15;

/// Receive results meaning "no frame yet" rather than failure
const EAGAIN: i32 = 11;
const ENOBUFS: i32 = 105;

const AV_DRM_MAX_PLANES: usize = 4;

// libavutil/hwcontext_drm.h
#[repr(C)]
struct AvDrmObjectDescriptor {
    fd: i32,
    size: usize,
    format_modifier: u64,
}

#[repr(C)]
struct AvDrmPlaneDescriptor {
    object_index: i32,
    offset: isize,
    pitch: isize,
}

#[repr(C)]
struct AvDrmLayerDescriptor {
    format: u32,
    nb_planes: i32,
    planes: [AvDrmPlaneDescriptor; AV_DRM_MAX_PLANES],
}

#[repr(C)]
struct AvDrmFrameDescriptor {
    nb_objects: i32,
    objects: [AvDrmObjectDescriptor; AV_DRM_MAX_PLANES],
    nb_layers: i32,
    layers: [AvDrmLayerDescriptor; AV_DRM_MAX_PLANES],
}

/// Prefer DRM PRIME; otherwise take the decoder's first offer
unsafe extern "C" fn get_format(
    _ctx: *mut AVCodecContext,
    formats: *const AVPixelFormat,
) -> AVPixelFormat {
    let mut cursor = formats;
    while *cursor != AVPixelFormat::AV_PIX_FMT_NONE {
        if *cursor == AVPixelFormat::AV_PIX_FMT_DRM_PRIME {
            return *cursor;
        }
        cursor = cursor.add(1);
    }
    *formats
}

fn create_hw_device(path: &Path) -> Option<*mut AVBufferRef> {
    let node = CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut device: *mut AVBufferRef = ptr::null_mut();
    let ret = unsafe {
        ffmpeg::ffi::av_hwdevice_ctx_create(
            &mut device,
            AVHWDeviceType::AV_HWDEVICE_TYPE_DRM,
            node.as_ptr(),
            ptr::null_mut(),
            0,
        )
    };
    if ret < 0 || device.is_null() {
        debug!(
            "No DRM hwdevice on {}: {}",
            path.display(),
            ffmpeg::Error::from(ret)
        );
        None
    } else {
        Some(device)
    }
}

/// A decoded frame; the wrapped reference keeps its buffer out of the pool
pub struct FfmpegFrame {
    frame: ffmpeg::frame::Video,
}

impl FfmpegFrame {
    fn prime(&self) -> Option<PrimeDescriptor> {
        // data[0] is null while the driver is still negotiating its format
        let descriptor = unsafe { (*self.frame.as_ptr()).data[0] } as *const AvDrmFrameDescriptor;
        if descriptor.is_null() {
            return None;
        }
        let descriptor = unsafe { &*descriptor };
        if descriptor.nb_objects < 1 || descriptor.nb_layers < 1 {
            return None;
        }

        let objects = descriptor
            .objects
            .iter()
            .take(descriptor.nb_objects.clamp(0, 4) as usize)
            .map(|object| PrimeObject {
                fd: object.fd,
                size: object.size,
                modifier: object.format_modifier,
            })
            .collect();

        let layer = &descriptor.layers[0];
        let planes = layer
            .planes
            .iter()
            .take(layer.nb_planes.clamp(0, 4) as usize)
            .map(|plane| PrimePlane {
                object_index: plane.object_index.max(0) as usize,
                offset: plane.offset as u32,
                pitch: plane.pitch as u32,
            })
            .collect();

        Some(PrimeDescriptor {
            objects,
            fourcc: layer.format,
            planes,
        })
    }
}

impl DecodedFrame for FfmpegFrame {
    fn width(&self) -> u32 {
        self.frame.width()
    }

    fn height(&self) -> u32 {
        self.frame.height()
    }

    fn memory(&self) -> FrameMemory {
        match self.frame.format() {
            Pixel::DRM_PRIME => match self.prime() {
                Some(descriptor) => FrameMemory::Prime(descriptor),
                None => FrameMemory::Unsupported("DRM PRIME without descriptor".into()),
            },
            Pixel::None => FrameMemory::Unsupported("no pixel format".into()),
            _ => FrameMemory::Cpu,
        }
    }
}

/// libswscale context converting one source layout to XRGB8888
struct XrgbScaler {
    context: scaling::Context,
    format: Pixel,
    width: u32,
    height: u32,
}

// SAFETY: the SwsContext holds no thread affinity and is only used through
// `&mut self` by the thread owning the decoder
unsafe impl Send for XrgbScaler {}

impl XrgbScaler {
    fn new(frame: &ffmpeg::frame::Video) -> Result<Self> {
        let (format, width, height) = (frame.format(), frame.width(), frame.height());
        // BGR0 in memory is little-endian XRGB8888
        let context = scaling::Context::get(
            format,
            width,
            height,
            Pixel::BGRZ,
            width,
            height,
            scaling::Flags::BILINEAR,
        )
        .map_err(|e| SinkError::decoder(format!("no scaler for {:?}: {}", format, e)))?;
        debug!("Scaler ready: {:?} {}x{} -> XRGB8888", format, width, height);
        Ok(Self {
            context,
            format,
            width,
            height,
        })
    }

    fn matches(&self, frame: &ffmpeg::frame::Video) -> bool {
        self.format == frame.format()
            && self.width == frame.width()
            && self.height == frame.height()
    }

    fn convert(
        &mut self,
        frame: &ffmpeg::frame::Video,
        dst: &mut [u8],
        pitch: usize,
    ) -> Result<()> {
        let row = self.width as usize * 4;
        let rows = self.height as usize;
        if pitch < row || dst.len() < pitch * rows.saturating_sub(1) + row {
            return Err(SinkError::display(format!(
                "buffer of {} bytes (pitch {}) too small for {}x{}",
                dst.len(),
                pitch,
                self.width,
                self.height
            )));
        }
        let stride = c_int::try_from(pitch)
            .map_err(|_| SinkError::display(format!("pitch {} out of range", pitch)))?;

        let planes = [dst.as_mut_ptr(), ptr::null_mut(), ptr::null_mut(), ptr::null_mut()];
        let strides = [stride, 0, 0, 0];
        let ret = unsafe {
            let src = frame.as_ptr();
            ffmpeg::ffi::sws_scale(
                self.context.as_mut_ptr(),
                (*src).data.as_ptr() as *const *const u8,
                (*src).linesize.as_ptr(),
                0,
                self.height as c_int,
                planes.as_ptr(),
                strides.as_ptr(),
            )
        };
        if ret < 0 {
            return Err(SinkError::decoder(format!(
                "sws_scale: {}",
                ffmpeg::Error::from(ret)
            )));
        }
        Ok(())
    }
}

/// Convert through the cached scaler, rebuilding it when the layout changes
fn scale_into(
    slot: &mut Option<XrgbScaler>,
    frame: &ffmpeg::frame::Video,
    dst: &mut [u8],
    pitch: usize,
) -> Result<()> {
    let scaler = match slot.take() {
        Some(scaler) if scaler.matches(frame) => slot.insert(scaler),
        _ => slot.insert(XrgbScaler::new(frame)?),
    };
    scaler.convert(frame, dst, pitch)
}

/// libavcodec H.264 decoder tuned for low latency
pub struct FfmpegDecoder {
    decoder: ffmpeg::decoder::Video,
    mode: DecodeMode,
    scaler: Option<XrgbScaler>,
}

impl FfmpegDecoder {
    pub fn open(config: &dyn MediaConfig) -> Result<Self> {
        ffmpeg::init().map_err(|e| SinkError::decoder(format!("FFmpeg init: {}", e)))?;

        let codec = ffmpeg::decoder::find(ffmpeg::codec::Id::H264)
            .ok_or_else(|| SinkError::decoder("H.264 decoder not found"))?;
        let mut context = ffmpeg::codec::context::Context::new_with_codec(codec);

        let resolution = config.video_resolution();
        info!("Video dimensions: {}", resolution);

        let hw_device = config
            .hw_device_paths()
            .iter()
            .find_map(|path| create_hw_device(path).map(|device| (path.clone(), device)));

        unsafe {
            let ctx = context.as_mut_ptr();
            (*ctx).width = resolution.width() as i32;
            (*ctx).height = resolution.height() as i32;
            (*ctx).thread_count = 1;
            (*ctx).flags |= AV_CODEC_FLAG_LOW_DELAY;
            (*ctx).flags2 |= AV_CODEC_FLAG2_FAST;
            (*ctx).error_concealment = FF_EC_GUESS_MVS | FF_EC_DEBLOCK;
            (*ctx).err_recognition = AV_EF_IGNORE_ERR;
            if let Some((_, device)) = &hw_device {
                // The context takes the reference and releases it when freed
                (*ctx).hw_device_ctx = *device;
                (*ctx).get_format = Some(get_format);
            }
        }

        let mode = match &hw_device {
            Some((path, _)) => {
                info!("DRM hwaccel using {}", path.display());
                DecodeMode::ZeroCopy
            }
            None => {
                warn!("No DRM hwdevice available, using software decoding");
                DecodeMode::Software
            }
        };

        let decoder = context
            .decoder()
            .open_as(codec)
            .and_then(|opened| opened.video())
            .map_err(|e| SinkError::decoder(format!("open H.264 decoder: {}", e)))?;

        info!("H.264 decoder opened ({})", mode);
        Ok(Self {
            decoder,
            mode,
            scaler: None,
        })
    }
}

impl VideoDecoder for FfmpegDecoder {
    type Frame = FfmpegFrame;

    fn mode(&self) -> DecodeMode {
        self.mode
    }

    fn send(&mut self, access_unit: &[u8]) -> Result<()> {
        let packet = ffmpeg::Packet::copy(access_unit);
        match self.decoder.send_packet(&packet) {
            Ok(()) => Ok(()),
            // Output queue full or draining; frames are collected by receive
            Err(ffmpeg::Error::Other { errno: EAGAIN }) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(SinkError::decoder(e.to_string())),
        }
    }

    fn receive(&mut self) -> Result<Option<FfmpegFrame>> {
        let mut frame = ffmpeg::frame::Video::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => Ok(Some(FfmpegFrame { frame })),
            Err(ffmpeg::Error::Other { errno: EAGAIN | ENOBUFS }) | Err(ffmpeg::Error::Eof) => {
                Ok(None)
            }
            Err(e) => Err(SinkError::decoder(e.to_string())),
        }
    }

    fn flush(&mut self) {
        if self.decoder.send_eof().is_ok() {
            let mut frame = ffmpeg::frame::Video::empty();
            while self.decoder.receive_frame(&mut frame).is_ok() {}
        }
        self.decoder.flush();
    }

    fn convert_to_xrgb(&mut self, frame: &FfmpegFrame, dst: &mut [u8], pitch: usize) -> Result<()> {
        scale_into(&mut self.scaler, &frame.frame, dst, pitch)
    }
}

/// KMS display with the FFmpeg decoder
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegKmsBackend;

impl VideoBackend for FfmpegKmsBackend {
    type Display = KmsDevice;
    type Decoder = FfmpegDecoder;

    fn open_display(&self, config: &dyn MediaConfig) -> Result<Arc<KmsDevice>> {
        KmsDevice::open(&config.display_device_path()).map(Arc::new)
    }

    fn open_decoder(&self, config: &dyn MediaConfig) -> Result<FfmpegDecoder> {
        FfmpegDecoder::open(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grey_frame(luma: u8, width: u32, height: u32) -> ffmpeg::frame::Video {
        let mut frame = ffmpeg::frame::Video::new(Pixel::YUV420P, width, height);
        frame.data_mut(0).fill(luma);
        frame.data_mut(1).fill(128);
        frame.data_mut(2).fill(128);
        frame
    }

    #[test]
    fn test_scaler_writes_xrgb_rows_at_pitch() {
        ffmpeg::init().unwrap();
        let frame = grey_frame(235, 16, 8);
        let pitch = 80;
        let mut dst = vec![0x11u8; pitch * 8];
        let mut scaler = None;
        scale_into(&mut scaler, &frame, &mut dst, pitch).unwrap();

        for row in dst.chunks(pitch) {
            for pixel in row[..64].chunks(4) {
                assert!(pixel[..3].iter().all(|&c| c >= 0xF8), "{:?}", pixel);
            }
            // Padding past the picture stays untouched
            assert!(row[64..].iter().all(|&b| b == 0x11));
        }
    }

    #[test]
    fn test_scaler_rebuilt_on_size_change() {
        ffmpeg::init().unwrap();
        let mut scaler = None;
        let mut dst = vec![0u8; 64 * 4 * 16];
        scale_into(&mut scaler, &grey_frame(16, 16, 8), &mut dst, 64).unwrap();
        assert_eq!(scaler.as_ref().map(|s| s.width), Some(16));

        scale_into(&mut scaler, &grey_frame(16, 32, 16), &mut dst, 128).unwrap();
        assert_eq!(scaler.as_ref().map(|s| (s.width, s.height)), Some((32, 16)));
        assert!(dst[..3].iter().all(|&c| c <= 0x08));
    }

    #[test]
    fn test_scaler_rejects_short_buffer() {
        ffmpeg::init().unwrap();
        let mut scaler = None;
        let mut dst = vec![0u8; 16 * 4 * 4];
        let result = scale_into(&mut scaler, &grey_frame(235, 16, 8), &mut dst, 64);
        assert!(matches!(result, Err(SinkError::Display(_))));
    }
}
