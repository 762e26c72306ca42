//! Local music player: transport controls over the per-track decode worker

use crate::audio::{AudioHost, StreamNegotiation};
use crate::config::MediaConfig;
use crate::player::decode::{run_track, TrackControl, TrackOutcome};
use crate::player::playlist::{Advance, Playlist, RepeatMode};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long stop waits for the decode thread before detaching it
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

/// The track being played
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub path: PathBuf,
    /// File name without extension
    pub title: String,
}

impl TrackInfo {
    fn new(path: &Path) -> Self {
        let title = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            path: path.to_path_buf(),
            title,
        }
    }
}

/// Notifications for whoever drives the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    TrackChanged(TrackInfo),
    PlaybackStateChanged(PlaybackState),
    /// Position in milliseconds, sent when the whole second changes
    PositionChanged(u64),
    TrackFinished,
    PlaylistChanged,
    RepeatModeChanged(RepeatMode),
    PlaybackError(String),
    /// What the DAC was opened with for the current track
    StreamInfo(StreamNegotiation),
}

enum Notice {
    Ended { generation: u64, outcome: TrackOutcome },
    Shutdown,
}

struct Worker {
    generation: u64,
    control: Arc<TrackControl>,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

#[derive(Default)]
struct PlayerState {
    playlist: Playlist,
    repeat: RepeatMode,
    current: Option<TrackInfo>,
    playing: bool,
    paused: bool,
}

struct Inner {
    host: Arc<dyn AudioHost>,
    config: Arc<dyn MediaConfig>,
    state: Mutex<PlayerState>,
    /// Held across every transport change; taken before `state`
    worker: Mutex<Option<Worker>>,
    generation: AtomicU64,
    events: Sender<PlayerEvent>,
    notices: Sender<Notice>,
}

/// Plays local files through the configured output device
///
/// Each track runs on its own decode thread. When a track ends the player
/// moves on according to the repeat mode; that happens on an internal
/// thread so the decode thread never has to join itself.
pub struct AudioPlayer {
    inner: Arc<Inner>,
    events: Receiver<PlayerEvent>,
    advance: Option<JoinHandle<()>>,
}

impl AudioPlayer {
    pub fn new(host: Arc<dyn AudioHost>, config: Arc<dyn MediaConfig>) -> Self {
        let (events_tx, events_rx) = unbounded();
        let (notices_tx, notices_rx) = unbounded();

        let inner = Arc::new(Inner {
            host,
            config,
            state: Mutex::new(PlayerState::default()),
            worker: Mutex::new(None),
            generation: AtomicU64::new(0),
            events: events_tx,
            notices: notices_tx,
        });

        let advance = {
            let inner = Arc::clone(&inner);
            thread::spawn(move || {
                for notice in notices_rx.iter() {
                    match notice {
                        Notice::Ended {
                            generation,
                            outcome,
                        } => inner.on_track_ended(generation, outcome),
                        Notice::Shutdown => break,
                    }
                }
                debug!("Player advance thread stopped");
            })
        };

        Self {
            inner,
            events: events_rx,
            advance: Some(advance),
        }
    }

    /// Event stream; every clone competes for the same events
    pub fn events(&self) -> Receiver<PlayerEvent> {
        self.events.clone()
    }

    pub fn set_playlist(&self, files: Vec<PathBuf>) {
        self.inner.state.lock().playlist.set(files);
        self.inner.emit(PlayerEvent::PlaylistChanged);
    }

    pub fn add_to_playlist(&self, file: impl Into<PathBuf>) {
        self.inner.state.lock().playlist.add(file);
        self.inner.emit(PlayerEvent::PlaylistChanged);
    }

    pub fn clear_playlist(&self) {
        self.inner.state.lock().playlist.clear();
        self.inner.emit(PlayerEvent::PlaylistChanged);
    }

    /// Play a file, replacing whatever is playing
    pub fn play(&self, path: impl AsRef<Path>) {
        let mut slot = self.inner.worker.lock();
        self.inner.play_locked(&mut slot, path.as_ref());
    }

    /// Play a playlist entry; false when the index is out of range
    pub fn play_index(&self, index: usize) -> bool {
        let mut slot = self.inner.worker.lock();
        let selected = self.inner.state.lock().playlist.select(index);
        match selected {
            Some(path) => {
                self.inner.play_locked(&mut slot, &path);
                true
            }
            None => false,
        }
    }

    /// Pause or resume; when stopped, replay the selected playlist entry
    pub fn toggle_play_pause(&self) {
        let mut slot = self.inner.worker.lock();
        let (playing, paused, current) = {
            let state = self.inner.state.lock();
            let current = state.playlist.current().map(Path::to_path_buf);
            (state.playing, state.paused, current)
        };

        if playing {
            self.inner.set_paused_locked(&slot, !paused);
        } else if let Some(path) = current {
            self.inner.play_locked(&mut slot, &path);
        }
    }

    pub fn pause(&self) {
        let slot = self.inner.worker.lock();
        self.inner.set_paused_locked(&slot, true);
    }

    pub fn resume(&self) {
        let slot = self.inner.worker.lock();
        self.inner.set_paused_locked(&slot, false);
    }

    pub fn stop(&self) {
        let mut slot = self.inner.worker.lock();
        self.inner.stop_locked(&mut slot);
    }

    pub fn next_track(&self) {
        let mut slot = self.inner.worker.lock();
        self.inner.next_locked(&mut slot);
    }

    /// Previous entry, or restart the current one after three seconds
    pub fn previous_track(&self) {
        let mut slot = self.inner.worker.lock();
        let position = slot
            .as_ref()
            .map(|worker| worker.control.position_ms())
            .unwrap_or(0);
        let previous = {
            let mut state = self.inner.state.lock();
            let repeat = state.repeat;
            state.playlist.previous(repeat, position)
        };
        if let Some(path) = previous {
            self.inner.play_locked(&mut slot, &path);
        }
    }

    /// Jump within the current track
    pub fn seek(&self, position_ms: u64) {
        let slot = self.inner.worker.lock();
        if let Some(worker) = slot.as_ref() {
            worker.control.request_seek(position_ms);
            self.inner.emit(PlayerEvent::PositionChanged(position_ms));
        }
    }

    pub fn set_repeat_mode(&self, mode: RepeatMode) {
        let changed = {
            let mut state = self.inner.state.lock();
            let changed = state.repeat != mode;
            state.repeat = mode;
            changed
        };
        if changed {
            debug!("Repeat mode: {}", mode);
            self.inner.emit(PlayerEvent::RepeatModeChanged(mode));
        }
    }

    pub fn cycle_repeat_mode(&self) {
        let next = self.repeat_mode().cycle();
        self.set_repeat_mode(next);
    }

    pub fn state(&self) -> PlaybackState {
        let state = self.inner.state.lock();
        match (state.playing, state.paused) {
            (true, true) => PlaybackState::Paused,
            (true, false) => PlaybackState::Playing,
            _ => PlaybackState::Stopped,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    /// No track loaded and no end-of-track advance pending
    pub fn is_idle(&self) -> bool {
        let slot = self.inner.worker.lock();
        slot.is_none() && !self.inner.state.lock().playing
    }

    pub fn current_track(&self) -> Option<TrackInfo> {
        self.inner.state.lock().current.clone()
    }

    pub fn position_ms(&self) -> u64 {
        self.inner
            .worker
            .lock()
            .as_ref()
            .map(|worker| worker.control.position_ms())
            .unwrap_or(0)
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.inner.state.lock().repeat
    }

    pub fn playlist_index(&self) -> Option<usize> {
        self.inner.state.lock().playlist.index()
    }

    pub fn playlist_len(&self) -> usize {
        self.inner.state.lock().playlist.len()
    }

    /// Negotiated output of the current track
    pub fn stream_info(&self) -> Option<StreamNegotiation> {
        self.inner
            .worker
            .lock()
            .as_ref()
            .and_then(|worker| worker.control.stream())
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        {
            let mut slot = self.inner.worker.lock();
            self.inner.stop_worker(&mut slot);
        }
        let _ = self.inner.notices.send(Notice::Shutdown);
        if let Some(handle) = self.advance.take() {
            let _ = handle.join();
        }
    }
}

impl Inner {
    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    fn play_locked(&self, slot: &mut Option<Worker>, path: &Path) {
        self.stop_worker(slot);

        let track = TrackInfo::new(path);
        info!("Track: {}", track.title);
        {
            let mut state = self.state.lock();
            state.current = Some(track.clone());
            state.playing = true;
            state.paused = false;
        }
        self.emit(PlayerEvent::TrackChanged(track));
        self.emit(PlayerEvent::PlaybackStateChanged(PlaybackState::Playing));

        *slot = Some(self.spawn_worker(path.to_path_buf()));
    }

    fn spawn_worker(&self, path: PathBuf) -> Worker {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let control = Arc::new(TrackControl::new());
        let (done_tx, done_rx) = bounded(1);

        let handle = {
            let control = Arc::clone(&control);
            let host = Arc::clone(&self.host);
            let config = Arc::clone(&self.config);
            let events = self.events.clone();
            let notices = self.notices.clone();
            thread::spawn(move || {
                let outcome = run_track(&path, &host, &config, &control, &events);
                let _ = done_tx.send(());
                let _ = notices.send(Notice::Ended {
                    generation,
                    outcome,
                });
            })
        };

        Worker {
            generation,
            control,
            handle,
            done: done_rx,
        }
    }

    /// Stop the decode thread, waiting at most [`JOIN_TIMEOUT`]
    fn stop_worker(&self, slot: &mut Option<Worker>) {
        let Some(worker) = slot.take() else {
            return;
        };
        worker.control.request_stop();
        match worker.done.recv_timeout(JOIN_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = worker.handle.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Decode thread did not stop within {:?}, detaching it",
                    JOIN_TIMEOUT
                );
            }
        }
    }

    fn stop_locked(&self, slot: &mut Option<Worker>) {
        self.stop_worker(slot);
        {
            let mut state = self.state.lock();
            state.playing = false;
            state.paused = false;
        }
        self.emit(PlayerEvent::PlaybackStateChanged(PlaybackState::Stopped));
        self.emit(PlayerEvent::PositionChanged(0));
    }

    fn set_paused_locked(&self, slot: &Option<Worker>, paused: bool) {
        let Some(worker) = slot.as_ref() else {
            return;
        };
        {
            let mut state = self.state.lock();
            if !state.playing || state.paused == paused {
                return;
            }
            state.paused = paused;
        }
        worker.control.set_paused(paused);
        let state = if paused {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        };
        self.emit(PlayerEvent::PlaybackStateChanged(state));
    }

    fn next_locked(&self, slot: &mut Option<Worker>) {
        let advance = {
            let mut state = self.state.lock();
            let repeat = state.repeat;
            state.playlist.next(repeat)
        };
        match advance {
            Some(Advance::Play(path)) => self.play_locked(slot, &path),
            Some(Advance::Stop) => self.stop_locked(slot),
            None => {}
        }
    }

    /// Runs on the advance thread when a worker exits on its own
    fn on_track_ended(&self, generation: u64, outcome: TrackOutcome) {
        let mut slot = self.worker.lock();
        // A worker replaced or stopped by a transport call is not ours to advance
        if slot.as_ref().map(|worker| worker.generation) != Some(generation) {
            return;
        }
        self.stop_worker(&mut slot);

        let (repeat, current) = {
            let mut state = self.state.lock();
            state.playing = false;
            state.paused = false;
            (state.repeat, state.current.clone())
        };

        match outcome {
            TrackOutcome::Finished => {
                self.emit(PlayerEvent::TrackFinished);
                self.emit(PlayerEvent::PlaybackStateChanged(PlaybackState::Stopped));
                match (repeat, current) {
                    (RepeatMode::One, Some(track)) => self.play_locked(&mut slot, &track.path),
                    _ => self.next_locked(&mut slot),
                }
            }
            TrackOutcome::Failed | TrackOutcome::Stopped => {
                self.emit(PlayerEvent::PlaybackStateChanged(PlaybackState::Stopped));
            }
        }
    }
}
