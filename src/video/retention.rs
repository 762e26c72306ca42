//! Two-generation ownership of presented buffers
//!
//! A buffer handed to the display may still be scanned out until the next
//! one has been latched, so it is only released once the buffer after its
//! successor has been presented.

/// Holds at most two presented buffers
#[derive(Debug)]
pub struct FrameRetention<T> {
    current: Option<T>,
    previous: Option<T>,
}

impl<T> FrameRetention<T> {
    pub const fn new() -> Self {
        Self {
            current: None,
            previous: None,
        }
    }

    /// Record `presented` as on screen; returns the buffer two generations back
    pub fn rotate(&mut self, presented: T) -> Option<T> {
        let released = self.previous.take();
        self.previous = self.current.replace(presented);
        released
    }

    pub fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    pub fn previous(&self) -> Option<&T> {
        self.previous.as_ref()
    }

    pub fn len(&self) -> usize {
        self.current.is_some() as usize + self.previous.is_some() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Give up both generations, oldest first
    pub fn drain(&mut self) -> impl Iterator<Item = T> {
        self.previous.take().into_iter().chain(self.current.take())
    }
}

impl<T> Default for FrameRetention<T> {
    fn default() -> Self {
        Self::new()
    }
}
