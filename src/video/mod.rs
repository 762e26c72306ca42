//! Projection video: Annex-B framing, decoding and DRM/KMS presentation
//!
//! [`HardwareVideoOutput`] drives the pipeline. The kernel display and the
//! decoder sit behind the [`DisplayDevice`] and [`VideoDecoder`] traits; the
//! `kms` and `ffmpeg` features provide the real implementations.

#[cfg(test)]
pub(crate) mod convert;
pub mod cursor;
pub mod decoder;
pub mod display;
pub mod emergency;
mod output;
pub mod parser;
mod retention;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
#[cfg(feature = "kms")]
pub mod kms;

pub use cursor::{CursorSession, CURSOR_SIZE};
pub use decoder::{
    DecodeMode, DecodedFrame, FrameMemory, PrimeDescriptor, PrimeObject, PrimePlane, VideoDecoder,
};
pub use display::{
    ConnectorId, ConnectorInfo, CrtcId, DisplayDevice, DisplayMode, DisplaySession, DumbBuffer,
    FramebufferId, FramebufferLayout, GemHandle, PlaneId, PlaneInfo, PlaneKind, PropertyId,
    PropertyInfo, RawRelease, Rect, FOURCC_ARGB8888, FOURCC_NV12, FOURCC_XRGB8888,
};
pub use emergency::{BufferSlot, EmergencyCleanup};
pub use output::{HardwareVideoOutput, OutputState, VideoBackend, VideoStats};
pub use parser::AccessUnitParser;
pub use retention::FrameRetention;
