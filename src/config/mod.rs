//! Configuration surface consumed by the sink
//!
//! The sink only ever reads configuration. [`MediaConfig`] is the narrow
//! accessor trait the audio and video components depend on; [`SinkConfig`]
//! is the TOML-backed implementation used by the binary.

mod args;
mod settings;

pub use args::{Args, Command, RepeatArg};
pub use settings::{AudioSettings, ConfigError, SinkConfig, VideoSettings};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Projection video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VideoResolution {
    #[default]
    #[serde(rename = "800x480")]
    Sd480,
    #[serde(rename = "1280x720")]
    Hd720,
    #[serde(rename = "1920x1080")]
    Hd1080,
}

impl VideoResolution {
    pub fn width(&self) -> u32 {
        match self {
            VideoResolution::Sd480 => 800,
            VideoResolution::Hd720 => 1280,
            VideoResolution::Hd1080 => 1920,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            VideoResolution::Sd480 => 480,
            VideoResolution::Hd720 => 720,
            VideoResolution::Hd1080 => 1080,
        }
    }
}

impl fmt::Display for VideoResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width(), self.height())
    }
}

/// Projection video frame rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameRate {
    #[default]
    Fps30,
    Fps60,
}

impl FrameRate {
    /// Map a configured fps value; anything above 30 selects 60
    pub fn from_fps(fps: u32) -> Self {
        if fps > 30 {
            FrameRate::Fps60
        } else {
            FrameRate::Fps30
        }
    }

    pub fn fps(&self) -> u32 {
        match self {
            FrameRate::Fps30 => 30,
            FrameRate::Fps60 => 60,
        }
    }
}

/// Read-only configuration accessors used by the sink components
///
/// Empty device names mean "use the system default device".
pub trait MediaConfig: Send + Sync {
    fn audio_output_device_name(&self) -> String;
    fn audio_input_device_name(&self) -> String;
    fn video_resolution(&self) -> VideoResolution;
    fn video_fps(&self) -> FrameRate;
    fn show_cursor(&self) -> bool;

    /// Plane to present video on; `None` picks the first overlay plane
    fn video_plane(&self) -> Option<u32> {
        None
    }

    /// Plane for the hardware cursor; `None` picks the first cursor plane
    fn cursor_plane(&self) -> Option<u32> {
        None
    }

    /// DRM nodes tried, in order, for the decoder's hardware device context
    fn hw_device_paths(&self) -> Vec<PathBuf> {
        vec![
            PathBuf::from("/dev/dri/renderD128"),
            PathBuf::from("/dev/dri/card0"),
        ]
    }

    /// Node the display session opens
    fn display_device_path(&self) -> PathBuf {
        PathBuf::from("/dev/dri/card0")
    }
}
