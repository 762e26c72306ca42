//! TOML configuration file support

use crate::config::{FrameRate, MediaConfig, VideoResolution};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Sink configuration loaded from a TOML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub audio: AudioSettings,
    pub video: VideoSettings,
}

/// `[audio]` table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Output device name (empty = system default)
    pub output_device: String,

    /// Input device name (empty = system default)
    pub input_device: String,
}

/// `[video]` table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    pub resolution: VideoResolution,

    /// Frames per second (30 or 60)
    pub fps: u32,

    /// Composite a hardware cursor over the projection
    pub show_cursor: bool,

    /// Overlay plane id override (0 = auto)
    pub video_plane: u32,

    /// Cursor plane id override (0 = auto)
    pub cursor_plane: u32,

    /// DRM node for the display session
    pub display_device: PathBuf,

    /// DRM nodes tried for hardware decoding, in order
    pub hw_devices: Vec<PathBuf>,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            resolution: VideoResolution::default(),
            fps: 30,
            show_cursor: false,
            video_plane: 0,
            cursor_plane: 0,
            display_device: PathBuf::from("/dev/dri/card0"),
            hw_devices: vec![
                PathBuf::from("/dev/dri/renderD128"),
                PathBuf::from("/dev/dri/card0"),
            ],
        }
    }
}

impl SinkConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })
    }

    /// Load configuration from default locations
    ///
    /// Searches in order:
    /// 1. Same directory as executable: headunit-sink.toml
    /// 2. User config directory: headunit-sink/config.toml
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let config_path = exe_dir.join("headunit-sink.toml");
                if config_path.exists() {
                    return Self::load(&config_path);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("headunit-sink").join("config.toml");
            if config_path.exists() {
                return Self::load(&config_path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Generate a sample configuration file content
    pub fn sample_config() -> String {
        r#"# headunit-sink configuration

[audio]
# Output device name as shown by `headunit-sink list` (empty = system default)
output_device = ""

# Microphone device name (empty = system default)
input_device = ""

[video]
# Projection resolution: "800x480", "1280x720" or "1920x1080"
resolution = "800x480"

# Frames per second: 30 or 60
fps = 30

# Draw a hardware cursor plane over the projection
show_cursor = false

# Plane overrides (0 = first overlay / first cursor plane)
video_plane = 0
cursor_plane = 0

# DRM node used for display output
display_device = "/dev/dri/card0"

# DRM nodes tried for hardware decoding, in order
hw_devices = ["/dev/dri/renderD128", "/dev/dri/card0"]
"#
        .to_string()
    }
}

impl MediaConfig for SinkConfig {
    fn audio_output_device_name(&self) -> String {
        self.audio.output_device.clone()
    }

    fn audio_input_device_name(&self) -> String {
        self.audio.input_device.clone()
    }

    fn video_resolution(&self) -> VideoResolution {
        self.video.resolution
    }

    fn video_fps(&self) -> FrameRate {
        FrameRate::from_fps(self.video.fps)
    }

    fn show_cursor(&self) -> bool {
        self.video.show_cursor
    }

    fn video_plane(&self) -> Option<u32> {
        (self.video.video_plane != 0).then_some(self.video.video_plane)
    }

    fn cursor_plane(&self) -> Option<u32> {
        (self.video.cursor_plane != 0).then_some(self.video.cursor_plane)
    }

    fn hw_device_paths(&self) -> Vec<PathBuf> {
        self.video.hw_devices.clone()
    }

    fn display_device_path(&self) -> PathBuf {
        self.video.display_device.clone()
    }
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io {
        path: String,
        source: std::io::Error,
    },
    /// Error parsing TOML
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "Failed to read config file '{}': {}", path, source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "Failed to parse config file '{}': {}", path, source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}
