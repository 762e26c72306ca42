//! Local file playback sharing the output negotiation with projection audio
//!
//! [`AudioPlayer`] owns a [`Playlist`] and runs one decode thread per track.
//! Each track is negotiated against the DAC on its own: native offload when
//! the hardware takes the source rate, otherwise linear resampling to the
//! best standard rate it does take.

mod audio_player;
mod decode;
pub mod playlist;
pub mod resample;
pub mod source;

pub use audio_player::{AudioPlayer, PlaybackState, PlayerEvent, TrackInfo};
pub use playlist::{Advance, Playlist, RepeatMode, RESTART_THRESHOLD_MS};
pub use resample::{pack, Resampler, StereoFrame};
pub use source::{open_source, SourceInfo, TrackSource, WavSource};
