//! Playlist order and repeat handling

use std::fmt;
use std::path::{Path, PathBuf};

/// Tracks the previous button restarts instead of going back past
pub const RESTART_THRESHOLD_MS: u64 = 3000;

/// What happens when a track ends or next is pressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepeatMode {
    #[default]
    Off,
    All,
    One,
}

impl RepeatMode {
    /// Off, All, One, then back to Off
    pub fn cycle(self) -> Self {
        match self {
            RepeatMode::Off => RepeatMode::All,
            RepeatMode::All => RepeatMode::One,
            RepeatMode::One => RepeatMode::Off,
        }
    }
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepeatMode::Off => "off",
            RepeatMode::All => "all",
            RepeatMode::One => "one",
        };
        f.write_str(name)
    }
}

/// Result of moving through the playlist
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    Play(PathBuf),
    /// Ran off the end with repeat off
    Stop,
}

/// Ordered list of files with a cursor
///
/// The cursor is `None` until a track is selected and after the list is
/// replaced or cleared.
#[derive(Debug, Clone, Default)]
pub struct Playlist {
    files: Vec<PathBuf>,
    index: Option<usize>,
}

impl Playlist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, files: Vec<PathBuf>) {
        self.files = files;
        self.index = None;
    }

    pub fn add(&mut self, file: impl Into<PathBuf>) {
        self.files.push(file.into());
    }

    pub fn clear(&mut self) {
        self.files.clear();
        self.index = None;
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// File under the cursor
    pub fn current(&self) -> Option<&Path> {
        self.index
            .and_then(|i| self.files.get(i))
            .map(PathBuf::as_path)
    }

    /// Move the cursor to `index`; out of range leaves it untouched
    pub fn select(&mut self, index: usize) -> Option<PathBuf> {
        let file = self.files.get(index)?.clone();
        self.index = Some(index);
        Some(file)
    }

    /// Step forward; `None` when the list is empty
    ///
    /// Repeat one stays on the current track, repeat all wraps to the first
    /// track and repeat off parks on the last track and stops.
    pub fn next(&mut self, repeat: RepeatMode) -> Option<Advance> {
        if self.files.is_empty() {
            return None;
        }

        if repeat == RepeatMode::One {
            let index = self.index.unwrap_or(0).min(self.files.len() - 1);
            return self.select(index).map(Advance::Play);
        }

        let next = self.index.map_or(0, |i| i + 1);
        if next < self.files.len() {
            return self.select(next).map(Advance::Play);
        }

        match repeat {
            RepeatMode::All => self.select(0).map(Advance::Play),
            _ => {
                self.index = Some(self.files.len() - 1);
                Some(Advance::Stop)
            }
        }
    }

    /// Step back, or restart the current track when it has played past
    /// [`RESTART_THRESHOLD_MS`]
    ///
    /// Going back from the first track wraps with repeat all and replays the
    /// first track otherwise.
    pub fn previous(&mut self, repeat: RepeatMode, position_ms: u64) -> Option<PathBuf> {
        if self.files.is_empty() {
            return None;
        }

        if position_ms > RESTART_THRESHOLD_MS {
            if let Some(current) = self.current() {
                return Some(current.to_path_buf());
            }
        }

        let previous = match self.index {
            Some(i) if i > 0 && i <= self.files.len() => i - 1,
            _ if repeat == RepeatMode::All => self.files.len() - 1,
            _ => 0,
        };
        self.select(previous)
    }
}
