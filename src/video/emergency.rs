//! Release of kernel display buffers on abnormal termination
//!
//! Contiguous memory behind scanout buffers is not returned when a process
//! dies holding GEM handles on some drivers. The video output mirrors every
//! handle it owns here, in atomics, so a termination handler can release
//! them without touching the output's own lock.

use crate::video::display::RawRelease;
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};

/// Framebuffer plus up to four GEM handles, all raw ids (0 = none)
#[derive(Debug, Default)]
struct HandleSet {
    framebuffer: AtomicU32,
    handles: [AtomicU32; 4],
}

impl HandleSet {
    fn publish(&self, framebuffer: u32, handles: &[u32]) {
        for (i, slot) in self.handles.iter().enumerate() {
            slot.store(handles.get(i).copied().unwrap_or(0), Ordering::Release);
        }
        self.framebuffer.store(framebuffer, Ordering::Release);
    }

    fn take(&self) -> (u32, [u32; 4]) {
        let framebuffer = self.framebuffer.swap(0, Ordering::AcqRel);
        let mut handles = [0u32; 4];
        for (out, slot) in handles.iter_mut().zip(&self.handles) {
            *out = slot.swap(0, Ordering::AcqRel);
        }
        (framebuffer, handles)
    }
}

/// Which mirrored buffer a handle set describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSlot {
    Current,
    Previous,
    Software,
}

type FrameRelease = Box<dyn Fn() + Send + Sync>;

/// Termination-path cleanup shared between the video output and the
/// process signal handler
pub struct EmergencyCleanup {
    running: AtomicBool,
    fd: AtomicI32,
    release: RawRelease,
    slots: [HandleSet; 3],
    frames: Mutex<Option<FrameRelease>>,
    completed: AtomicUsize,
}

impl EmergencyCleanup {
    pub fn new(release: RawRelease) -> Self {
        Self {
            running: AtomicBool::new(false),
            fd: AtomicI32::new(-1),
            release,
            slots: Default::default(),
            frames: Mutex::new(None),
            completed: AtomicUsize::new(0),
        }
    }

    fn slot(&self, slot: BufferSlot) -> &HandleSet {
        match slot {
            BufferSlot::Current => &self.slots[0],
            BufferSlot::Previous => &self.slots[1],
            BufferSlot::Software => &self.slots[2],
        }
    }

    /// Start covering buffers allocated on `fd`
    pub fn arm(&self, fd: RawFd, frames: FrameRelease) {
        *self.frames.lock() = Some(frames);
        self.fd.store(fd, Ordering::Release);
    }

    /// Stop covering; the normal teardown has released everything
    pub fn disarm(&self) {
        self.fd.store(-1, Ordering::Release);
        for slot in &self.slots {
            slot.take();
        }
        self.frames.lock().take();
    }

    pub fn is_armed(&self) -> bool {
        self.fd.load(Ordering::Acquire) >= 0
    }

    /// Mirror the handles of a buffer now owned by the output
    pub fn track(&self, slot: BufferSlot, framebuffer: u32, handles: &[u32]) {
        self.slot(slot).publish(framebuffer, handles);
    }

    /// Stop mirroring a buffer the output is about to release
    ///
    /// Returns `false` when the slot was already empty, meaning a cleanup
    /// run released the buffer and the caller must not.
    pub fn untrack(&self, slot: BufferSlot) -> bool {
        let (framebuffer, handles) = self.slot(slot).take();
        framebuffer != 0 || handles.iter().any(|&h| h != 0)
    }

    /// Mirror a retention rotation: current becomes previous
    pub fn rotate(&self, framebuffer: u32, handles: &[u32]) {
        let (fb, old) = self.slot(BufferSlot::Current).take();
        let count = old.iter().take_while(|&&h| h != 0).count();
        self.slot(BufferSlot::Previous).publish(fb, &old[..count]);
        self.slot(BufferSlot::Current).publish(framebuffer, handles);
    }

    /// Drop frame references and release every mirrored handle
    ///
    /// Returns `false` without doing anything when a run is already in
    /// progress. Does not log, allocate, or block.
    pub fn run(&self) -> bool {
        if self.running.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Some(frames) = self.frames.try_lock() {
            if let Some(release_frames) = frames.as_ref() {
                release_frames();
            }
        }

        let fd = self.fd.load(Ordering::Acquire);
        if fd >= 0 {
            for slot in &self.slots {
                let (framebuffer, handles) = slot.take();
                if framebuffer != 0 || handles.iter().any(|&h| h != 0) {
                    (self.release)(fd, framebuffer, &handles);
                }
            }
        }

        self.completed.fetch_add(1, Ordering::AcqRel);
        self.running.store(false, Ordering::Release);
        true
    }

    /// Completed runs, for reporting after the fact
    pub fn completed_runs(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }
}
