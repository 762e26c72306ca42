//! Hardware audio capture (microphone) with a single parked read

use crate::audio::backend::{AudioHost, AudioStream, Direction, InputCallback, StreamRequest};
use crate::audio::buffer::{Consumer, RingBuffer};
use crate::audio::hardware::StreamNegotiation;
use crate::audio::AudioFormat;
use crate::config::MediaConfig;
use crate::device::DeviceEnumerator;
use crate::error::{Result, SinkError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Bytes buffered between the capture callback and readers
pub const INPUT_RING_CAPACITY: usize = 65_536;

/// Bytes handed to one read, the projection session's capture chunk
pub const DEFAULT_READ_CHUNK_BYTES: usize = 2056;

type InputRing = RingBuffer<INPUT_RING_CAPACITY>;

/// Why a read produced no data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadRejected {
    #[error("input is not active")]
    Inactive,
    #[error("a read is already pending")]
    Busy,
    #[error("input stopped")]
    Stopped,
    #[error("timed out waiting for capture data")]
    Timeout,
}

type ReadOutcome = std::result::Result<Vec<u8>, ReadRejected>;

/// Completion side of a read, handed to [`HardwareAudioInput::read`]
pub struct ReadPromise {
    tx: Sender<ReadOutcome>,
}

impl ReadPromise {
    fn resolve(self, data: Vec<u8>) {
        // A dropped future just means nobody waits any more
        let _ = self.tx.try_send(Ok(data));
    }

    fn reject(self, reason: ReadRejected) {
        let _ = self.tx.try_send(Err(reason));
    }
}

/// Waiting side of a read
pub struct ReadFuture {
    rx: Receiver<ReadOutcome>,
}

impl ReadFuture {
    /// Block until the read completes or `timeout` elapses
    pub fn wait(self, timeout: Duration) -> ReadOutcome {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(ReadRejected::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(ReadRejected::Stopped),
        }
    }

    /// Outcome if already completed
    pub fn try_take(&self) -> Option<ReadOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(ReadRejected::Stopped)),
        }
    }
}

/// Create a connected promise/future pair
pub fn read_promise() -> (ReadPromise, ReadFuture) {
    let (tx, rx) = bounded(1);
    (ReadPromise { tx }, ReadFuture { rx })
}

struct ParkedRead {
    promise: ReadPromise,
    buf: Vec<u8>,
}

/// Consumer side, shared by readers and the capture callback
struct ReadState {
    consumer: Option<Consumer<INPUT_RING_CAPACITY>>,
    parked: Option<ParkedRead>,
}

impl ReadState {
    /// Resolve the parked read if a whole chunk is buffered
    fn fulfil(&mut self) {
        let Some(consumer) = self.consumer.as_mut() else {
            return;
        };
        let ready = matches!(&self.parked, Some(parked) if consumer.available() >= parked.buf.len());
        if !ready {
            return;
        }
        if let Some(mut parked) = self.parked.take() {
            consumer.read(&mut parked.buf);
            parked.promise.resolve(parked.buf);
        }
    }
}

#[derive(Default)]
struct StreamSlot {
    stream: Option<Box<dyn AudioStream>>,
    negotiation: Option<StreamNegotiation>,
}

/// PCM source behind one hardware capture stream
///
/// The capture callback is the ring's producer. Readers park at most one
/// read; the callback completes it once a full chunk has been captured.
pub struct HardwareAudioInput {
    host: Arc<dyn AudioHost>,
    config: Arc<dyn MediaConfig>,
    requested: AudioFormat,
    chunk_bytes: usize,
    ring: Arc<InputRing>,
    state: Arc<Mutex<ReadState>>,
    active: AtomicBool,
    stopping: Arc<AtomicBool>,
    slot: Mutex<StreamSlot>,
}

impl HardwareAudioInput {
    pub fn new(
        host: Arc<dyn AudioHost>,
        config: Arc<dyn MediaConfig>,
        requested: AudioFormat,
    ) -> Self {
        Self::with_chunk_size(host, config, requested, DEFAULT_READ_CHUNK_BYTES)
    }

    pub fn with_chunk_size(
        host: Arc<dyn AudioHost>,
        config: Arc<dyn MediaConfig>,
        requested: AudioFormat,
        chunk_bytes: usize,
    ) -> Self {
        if chunk_bytes >= INPUT_RING_CAPACITY {
            warn!(
                "Read chunk of {} bytes exceeds the capture ring, reads will never complete",
                chunk_bytes
            );
        }
        Self {
            host,
            config,
            requested,
            chunk_bytes: chunk_bytes.max(1),
            ring: Arc::new(InputRing::new()),
            state: Arc::new(Mutex::new(ReadState {
                consumer: None,
                parked: None,
            })),
            active: AtomicBool::new(false),
            stopping: Arc::new(AtomicBool::new(false)),
            slot: Mutex::new(StreamSlot::default()),
        }
    }

    /// Open the configured capture device at the session format
    pub fn open(&self) -> Result<StreamNegotiation> {
        let mut slot = self.slot.lock();
        if let (Some(_), Some(negotiation)) = (&slot.stream, &slot.negotiation) {
            return Ok(negotiation.clone());
        }

        let enumerator = DeviceEnumerator::new(Arc::clone(&self.host));
        let device = enumerator.select(Direction::Input, &self.config.audio_input_device_name())?;
        let caps = self.host.capabilities(&device)?;
        let negotiation = StreamNegotiation::for_session(device, self.requested, &caps)?;

        self.ring.clear();
        let (mut producer, consumer) = match (self.ring.producer(), self.ring.consumer()) {
            (Some(producer), Some(consumer)) => (producer, consumer),
            _ => return Err(SinkError::AlreadyActive),
        };

        let stopping = Arc::clone(&self.stopping);
        let state = Arc::clone(&self.state);
        let callback: InputCallback = Box::new(move |data: &[u8]| {
            if stopping.load(Ordering::Acquire) {
                return;
            }
            producer.write(data);
            // Contended: a reader is checking right now, retry next period
            if let Some(mut state) = state.try_lock() {
                state.fulfil();
            }
        });

        let request = StreamRequest {
            device: negotiation.device.clone(),
            format: negotiation.format,
            buffer_frames: negotiation.buffer_frames,
            period_frames: negotiation.period_frames,
            buffers: negotiation.buffers,
        };

        self.stopping.store(false, Ordering::Release);
        self.state.lock().consumer = Some(consumer);
        let stream = match self.host.open_input(&request, callback) {
            Ok(stream) => stream,
            Err(e) => {
                self.state.lock().consumer = None;
                return Err(e);
            }
        };

        slot.stream = Some(stream);
        slot.negotiation = Some(negotiation.clone());

        info!(
            "Input opened: {} on {} (read chunk {} bytes)",
            negotiation.format, negotiation.device.name, self.chunk_bytes
        );
        Ok(negotiation)
    }

    /// Start capturing
    pub fn start(&self) -> Result<()> {
        let mut slot = self.slot.lock();
        let stream = slot.stream.as_mut().ok_or(SinkError::NotOpened)?;
        stream.start()?;
        self.active.store(true, Ordering::Release);
        debug!("Input stream started");
        Ok(())
    }

    /// Request one chunk of captured audio
    ///
    /// Completes immediately when a chunk is buffered, otherwise parks until
    /// the capture callback has one. Only one read may be parked.
    pub fn read(&self, promise: ReadPromise) {
        // Checked under the lock: stop clears parked reads in its own
        // section after dropping the flag, so nothing parks behind it
        let mut state = self.state.lock();
        if !self.is_active() {
            promise.reject(ReadRejected::Inactive);
            return;
        }
        if state.parked.is_some() {
            promise.reject(ReadRejected::Busy);
            return;
        }
        let Some(consumer) = state.consumer.as_mut() else {
            promise.reject(ReadRejected::Inactive);
            return;
        };

        let mut buf = vec![0u8; self.chunk_bytes];
        if consumer.available() >= buf.len() {
            consumer.read(&mut buf);
            promise.resolve(buf);
        } else {
            state.parked = Some(ParkedRead { promise, buf });
        }
    }

    /// Stop capturing, rejecting a parked read and discarding buffered audio
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.active.store(false, Ordering::Release);

        let mut slot = self.slot.lock();
        if let Some(mut stream) = slot.stream.take() {
            if let Err(e) = stream.stop() {
                warn!("Failed to stop input stream: {}", e);
            }
            drop(stream);
            info!("Input stopped");
        }

        let parked = {
            let mut state = self.state.lock();
            state.consumer = None;
            state.parked.take()
        };
        if let Some(parked) = parked {
            parked.promise.reject(ReadRejected::Stopped);
        }
        if !self.ring.clear() {
            warn!("Input ring still claimed after stop");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    pub fn negotiation(&self) -> Option<StreamNegotiation> {
        self.slot.lock().negotiation.clone()
    }

    /// Captured bytes not yet read
    pub fn buffered(&self) -> usize {
        self.ring.available()
    }

    /// Captured bytes lost because readers fell behind
    pub fn dropped_bytes(&self) -> u64 {
        self.ring.dropped_bytes()
    }
}

impl Drop for HardwareAudioInput {
    fn drop(&mut self) {
        self.stop();
    }
}
