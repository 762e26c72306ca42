//! Hardware audio output fed by the projection session or the music player

use crate::audio::backend::{AudioHost, AudioStream, Direction, OutputCallback, StreamRequest};
use crate::audio::buffer::{Producer, RingBuffer};
use crate::audio::hardware::StreamNegotiation;
use crate::audio::AudioFormat;
use crate::config::MediaConfig;
use crate::device::DeviceEnumerator;
use crate::error::{Result, SinkError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Bytes buffered between writers and the hardware callback
pub const OUTPUT_RING_CAPACITY: usize = 262_144;

type OutputRing = RingBuffer<OUTPUT_RING_CAPACITY>;

#[derive(Default)]
struct StreamSlot {
    stream: Option<Box<dyn AudioStream>>,
    negotiation: Option<StreamNegotiation>,
}

/// PCM sink in front of one hardware output stream
///
/// Writers push bytes into a ring; the hardware callback drains it and
/// zero-fills whatever the ring cannot supply. `stop` may run concurrently
/// with the callback: the stopping flag is raised before anything else, so
/// a callback racing with teardown only ever emits silence.
pub struct HardwareAudioOutput {
    host: Arc<dyn AudioHost>,
    config: Arc<dyn MediaConfig>,
    requested: AudioFormat,
    ring: Arc<OutputRing>,
    /// Serializes application writers, never taken by the callback
    producer: Mutex<Option<Producer<OUTPUT_RING_CAPACITY>>>,
    stopping: Arc<AtomicBool>,
    slot: Mutex<StreamSlot>,
}

impl HardwareAudioOutput {
    pub fn new(
        host: Arc<dyn AudioHost>,
        config: Arc<dyn MediaConfig>,
        requested: AudioFormat,
    ) -> Self {
        Self {
            host,
            config,
            requested,
            ring: Arc::new(OutputRing::new()),
            producer: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
            slot: Mutex::new(StreamSlot::default()),
        }
    }

    /// Open the configured device at the session format
    ///
    /// Opening an already open output returns the existing negotiation.
    pub fn open(&self) -> Result<StreamNegotiation> {
        let mut slot = self.slot.lock();
        if let (Some(_), Some(negotiation)) = (&slot.stream, &slot.negotiation) {
            return Ok(negotiation.clone());
        }

        let enumerator = DeviceEnumerator::new(Arc::clone(&self.host));
        let device = enumerator.select(Direction::Output, &self.config.audio_output_device_name())?;
        let caps = self.host.capabilities(&device)?;
        let negotiation = StreamNegotiation::for_session(device, self.requested, &caps)?;

        self.open_locked(&mut slot, negotiation)
    }

    /// Open with a negotiation computed by the caller (local playback)
    pub fn open_with(&self, negotiation: StreamNegotiation) -> Result<StreamNegotiation> {
        let mut slot = self.slot.lock();
        if slot.stream.is_some() {
            return Err(SinkError::AlreadyActive);
        }
        self.open_locked(&mut slot, negotiation)
    }

    fn open_locked(
        &self,
        slot: &mut StreamSlot,
        negotiation: StreamNegotiation,
    ) -> Result<StreamNegotiation> {
        // Nothing from a previous session may reach the new stream
        self.producer.lock().take();
        self.ring.clear();

        let (producer, mut consumer) = match (self.ring.producer(), self.ring.consumer()) {
            (Some(producer), Some(consumer)) => (producer, consumer),
            _ => return Err(SinkError::AlreadyActive),
        };

        let stopping = Arc::clone(&self.stopping);
        let callback: OutputCallback = Box::new(move |out: &mut [u8]| {
            if stopping.load(Ordering::Acquire) {
                out.fill(0);
                return;
            }
            let read = consumer.read(out);
            out[read..].fill(0);
        });

        let request = StreamRequest {
            device: negotiation.device.clone(),
            format: negotiation.format,
            buffer_frames: negotiation.buffer_frames,
            period_frames: negotiation.period_frames,
            buffers: negotiation.buffers,
        };

        self.stopping.store(false, Ordering::Release);
        let stream = self.host.open_output(&request, callback)?;

        *self.producer.lock() = Some(producer);
        slot.stream = Some(stream);
        slot.negotiation = Some(negotiation.clone());

        info!(
            "Output opened: {} on {} ({} frames x {} buffers)",
            negotiation.format,
            negotiation.device.name,
            negotiation.buffer_frames,
            negotiation.buffers
        );
        Ok(negotiation)
    }

    /// Start (or resume) the hardware stream
    pub fn start(&self) -> Result<()> {
        let mut slot = self.slot.lock();
        let stream = slot.stream.as_mut().ok_or(SinkError::NotOpened)?;
        stream.start()?;
        debug!("Output stream started");
        Ok(())
    }

    /// Pause the hardware stream, keeping the device and buffered data
    pub fn suspend(&self) -> Result<()> {
        let mut slot = self.slot.lock();
        if let Some(stream) = slot.stream.as_mut() {
            stream.stop()?;
            debug!("Output stream suspended");
        }
        Ok(())
    }

    /// Queue PCM bytes; returns how many were accepted
    ///
    /// Never blocks. Bytes beyond the free space are dropped and counted.
    /// The timestamp is accepted for interface parity and not used.
    pub fn write(&self, _timestamp: u64, data: &[u8]) -> usize {
        if self.stopping.load(Ordering::Acquire) {
            return 0;
        }
        let mut producer = self.producer.lock();
        let Some(producer) = producer.as_mut() else {
            return 0;
        };
        let written = producer.write(data);
        if written < data.len() {
            trace!("Output ring full, dropped {} bytes", data.len() - written);
        }
        written
    }

    /// Queue all of `data`, waiting for space as the hardware drains
    ///
    /// Returns early when `cancel` is raised or the output stops.
    pub fn write_blocking(&self, data: &[u8], cancel: &AtomicBool) -> usize {
        let wait = self.drain_wait();
        let mut written = 0;

        while written < data.len() {
            if cancel.load(Ordering::Acquire) || self.stopping.load(Ordering::Acquire) {
                break;
            }
            let accepted = {
                let mut producer = self.producer.lock();
                match producer.as_mut() {
                    Some(producer) => producer.write_partial(&data[written..]),
                    None => break,
                }
            };
            written += accepted;
            if written < data.len() {
                std::thread::sleep(wait);
            }
        }

        written
    }

    /// One hardware period, or a few milliseconds before negotiation
    fn drain_wait(&self) -> Duration {
        let slot = self.slot.lock();
        match &slot.negotiation {
            Some(n) if n.format.sample_rate > 0 => {
                let micros = n.period_frames as u64 * 1_000_000 / n.format.sample_rate as u64;
                Duration::from_micros(micros.max(500))
            }
            _ => Duration::from_millis(5),
        }
    }

    /// Stop and close the stream, discarding buffered data
    ///
    /// Safe to call from any thread while the callback runs, and more than once.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);

        let mut slot = self.slot.lock();
        if let Some(mut stream) = slot.stream.take() {
            if let Err(e) = stream.stop() {
                warn!("Failed to stop output stream: {}", e);
            }
            // Dropping the stream drops the callback and its consumer
            drop(stream);
            info!("Output stopped");
        }

        self.producer.lock().take();
        if !self.ring.clear() {
            warn!("Output ring still claimed after stop");
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.requested.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.requested.channels
    }

    /// Bits per sample of the requested format
    pub fn sample_size(&self) -> u32 {
        self.requested.sample_format.bits()
    }

    /// What the hardware accepted at the last open
    pub fn negotiation(&self) -> Option<StreamNegotiation> {
        self.slot.lock().negotiation.clone()
    }

    /// Bytes waiting for the hardware
    pub fn buffered(&self) -> usize {
        self.ring.available()
    }

    pub fn dropped_bytes(&self) -> u64 {
        self.ring.dropped_bytes()
    }

    pub fn is_open(&self) -> bool {
        self.slot.lock().stream.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.slot
            .lock()
            .stream
            .as_ref()
            .map(|stream| stream.is_running())
            .unwrap_or(false)
    }
}

impl Drop for HardwareAudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}
