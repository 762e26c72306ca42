//! Decoder seam: what a decoded picture looks like to the display path

use crate::error::Result;
use smallvec::SmallVec;
use std::fmt;
use std::os::fd::RawFd;

/// How frames leave the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    /// DRM PRIME frames, scanned out without copying
    ZeroCopy,
    /// CPU frames, converted into a dumb buffer
    Software,
}

impl fmt::Display for DecodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeMode::ZeroCopy => f.write_str("zero-copy (DRM PRIME)"),
            DecodeMode::Software => f.write_str("software"),
        }
    }
}

/// One DMA-BUF backing a PRIME frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimeObject {
    pub fd: RawFd,
    pub size: usize,
    pub modifier: u64,
}

/// One plane of a PRIME frame's first layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimePlane {
    pub object_index: usize,
    pub offset: u32,
    pub pitch: u32,
}

/// Layout of a PRIME frame as exported by the decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimeDescriptor {
    pub objects: SmallVec<[PrimeObject; 4]>,
    /// DRM fourcc of the first layer
    pub fourcc: u32,
    pub planes: SmallVec<[PrimePlane; 4]>,
}

impl PrimeDescriptor {
    /// At least one object and one plane, every plane pointing at an object
    pub fn is_valid(&self) -> bool {
        !self.objects.is_empty()
            && !self.planes.is_empty()
            && self
                .planes
                .iter()
                .all(|plane| plane.object_index < self.objects.len())
    }
}

/// Where a decoded frame's pixels live
#[derive(Debug)]
pub enum FrameMemory {
    Prime(PrimeDescriptor),
    /// System memory; the decoder converts it for the software path
    Cpu,
    /// A pixel format neither path can show
    Unsupported(String),
}

/// A decoded picture; holding it keeps the decoder's buffer alive
pub trait DecodedFrame: Send {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn memory(&self) -> FrameMemory;
}

/// H.264 decoder fed one access unit at a time
pub trait VideoDecoder: Send {
    type Frame: DecodedFrame + 'static;

    fn mode(&self) -> DecodeMode;

    /// Submit one access unit
    fn send(&mut self, access_unit: &[u8]) -> Result<()>;

    /// Next decoded frame; `Ok(None)` when none is ready yet
    fn receive(&mut self) -> Result<Option<Self::Frame>>;

    /// Convert a [`FrameMemory::Cpu`] frame to XRGB8888 into `dst`, one row
    /// every `pitch` bytes
    fn convert_to_xrgb(&mut self, frame: &Self::Frame, dst: &mut [u8], pitch: usize)
        -> Result<()>;

    /// Signal end of stream and discard everything still queued
    fn flush(&mut self);
}
