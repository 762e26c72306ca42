//! ALSA (and other platform) audio through cpal
//!
//! `cpal::Stream` is not `Send` on every platform, so each stream lives on
//! its own thread and is driven through a control channel.

use crate::audio::backend::{
    AudioHost, AudioStream, DeviceCapabilities, DeviceInfo, Direction, InputCallback,
    OutputCallback, StreamRequest,
};
use crate::audio::SampleFormat;
use crate::error::{Result, SinkError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// The platform default cpal host
pub struct CpalHost {
    name: String,
}

impl CpalHost {
    pub fn new() -> Self {
        let host = cpal::default_host();
        let name = host.id().name().to_string();
        info!("Audio host: {}", name);
        Self { name }
    }

    fn find_device(&self, info: &DeviceInfo) -> Result<cpal::Device> {
        let host = cpal::default_host();
        let devices = match info.direction {
            Direction::Output => host.output_devices(),
            Direction::Input => host.input_devices(),
        }
        .map_err(|e| SinkError::device_error(&info.id, e.to_string()))?;

        for device in devices {
            if device.name().ok().as_deref() == Some(info.id.as_str()) {
                return Ok(device);
            }
        }
        Err(SinkError::DeviceNotFound(info.name.clone()))
    }
}

impl Default for CpalHost {
    fn default() -> Self {
        Self::new()
    }
}

fn to_cpal_format(format: SampleFormat) -> Option<cpal::SampleFormat> {
    match format {
        SampleFormat::S16Le => Some(cpal::SampleFormat::I16),
        SampleFormat::S32Le => Some(cpal::SampleFormat::I32),
        SampleFormat::S24Le3 => None,
    }
}

fn from_cpal_format(format: cpal::SampleFormat) -> Option<SampleFormat> {
    match format {
        cpal::SampleFormat::I16 => Some(SampleFormat::S16Le),
        cpal::SampleFormat::I32 => Some(SampleFormat::S32Le),
        _ => None,
    }
}

fn stream_config(request: &StreamRequest) -> Result<(cpal::StreamConfig, cpal::SampleFormat)> {
    let sample_format = to_cpal_format(request.format.sample_format).ok_or_else(|| {
        SinkError::Negotiation(format!(
            "{} is not available through cpal",
            request.format.sample_format
        ))
    })?;
    let config = cpal::StreamConfig {
        channels: request.format.channels,
        sample_rate: cpal::SampleRate(request.format.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(request.period_frames),
    };
    Ok((config, sample_format))
}

impl AudioHost for CpalHost {
    fn name(&self) -> &str {
        &self.name
    }

    fn devices(&self, direction: Direction) -> Result<Vec<DeviceInfo>> {
        let host = cpal::default_host();
        let default_name = match direction {
            Direction::Output => host.default_output_device(),
            Direction::Input => host.default_input_device(),
        }
        .and_then(|device| device.name().ok());

        let devices = match direction {
            Direction::Output => host.output_devices(),
            Direction::Input => host.input_devices(),
        }
        .map_err(|e| SinkError::Backend(e.to_string()))?;

        let mut result = Vec::new();
        for device in devices {
            let name = match device.name() {
                Ok(name) => name,
                Err(e) => {
                    debug!("Skipping unnamed device: {}", e);
                    continue;
                }
            };
            result.push(DeviceInfo {
                id: name.clone(),
                is_default: default_name.as_deref() == Some(name.as_str()),
                name,
                direction,
            });
        }
        Ok(result)
    }

    fn default_device(&self, direction: Direction) -> Result<Option<DeviceInfo>> {
        Ok(self
            .devices(direction)?
            .into_iter()
            .find(|device| device.is_default))
    }

    fn capabilities(&self, info: &DeviceInfo) -> Result<DeviceCapabilities> {
        let device = self.find_device(info)?;
        let ranges: Vec<cpal::SupportedStreamConfigRange> = match info.direction {
            Direction::Output => device
                .supported_output_configs()
                .map_err(|e| SinkError::device_error(&info.id, e.to_string()))?
                .collect(),
            Direction::Input => device
                .supported_input_configs()
                .map_err(|e| SinkError::device_error(&info.id, e.to_string()))?
                .collect(),
        };

        let mut caps = DeviceCapabilities {
            min_rate: u32::MAX,
            max_rate: 0,
            max_channels: 0,
            formats: Vec::new(),
        };
        for range in &ranges {
            let Some(format) = from_cpal_format(range.sample_format()) else {
                continue;
            };
            caps.min_rate = caps.min_rate.min(range.min_sample_rate().0);
            caps.max_rate = caps.max_rate.max(range.max_sample_rate().0);
            caps.max_channels = caps.max_channels.max(range.channels());
            if !caps.formats.contains(&format) {
                caps.formats.push(format);
            }
        }

        if caps.formats.is_empty() {
            return Err(SinkError::device_error(
                &info.id,
                "no integer PCM configuration available",
            ));
        }

        debug!(
            "{} capabilities: {}-{}Hz, {} channels, {:?}",
            info.name, caps.min_rate, caps.max_rate, caps.max_channels, caps.formats
        );
        Ok(caps)
    }

    fn open_output(
        &self,
        request: &StreamRequest,
        mut callback: OutputCallback,
    ) -> Result<Box<dyn AudioStream>> {
        let device = self.find_device(&request.device)?;
        let (config, sample_format) = stream_config(request)?;
        let name = request.device.name.clone();

        CpalStream::spawn(name, move || {
            device
                .build_output_stream_raw(
                    &config,
                    sample_format,
                    move |data: &mut cpal::Data, _: &cpal::OutputCallbackInfo| {
                        callback(data.bytes_mut());
                    },
                    |err| error!("Output stream error: {}", err),
                    None,
                )
                .map_err(|e| e.to_string())
        })
    }

    fn open_input(
        &self,
        request: &StreamRequest,
        mut callback: InputCallback,
    ) -> Result<Box<dyn AudioStream>> {
        let device = self.find_device(&request.device)?;
        let (config, sample_format) = stream_config(request)?;
        let name = request.device.name.clone();

        CpalStream::spawn(name, move || {
            device
                .build_input_stream_raw(
                    &config,
                    sample_format,
                    move |data: &cpal::Data, _: &cpal::InputCallbackInfo| {
                        callback(data.bytes());
                    },
                    |err| error!("Input stream error: {}", err),
                    None,
                )
                .map_err(|e| e.to_string())
        })
    }
}

enum Control {
    Play,
    Pause,
}

/// Handle to a cpal stream owned by its own thread
struct CpalStream {
    device_name: String,
    control: Option<Sender<(Control, Sender<std::result::Result<(), String>>)>>,
    running: bool,
    thread: Option<JoinHandle<()>>,
}

impl CpalStream {
    fn spawn<F>(device_name: String, build: F) -> Result<Box<dyn AudioStream>>
    where
        F: FnOnce() -> std::result::Result<cpal::Stream, String> + Send + 'static,
    {
        let (control_tx, control_rx) =
            bounded::<(Control, Sender<std::result::Result<(), String>>)>(4);
        let (ready_tx, ready_rx) = bounded::<std::result::Result<(), String>>(1);

        let thread_name = device_name.clone();
        let thread = thread::Builder::new()
            .name("cpal-stream".into())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Runs until the handle drops its sender
                for (command, reply) in control_rx.iter() {
                    let result = match command {
                        Control::Play => stream.play().map_err(|e| e.to_string()),
                        Control::Pause => stream.pause().map_err(|e| e.to_string()),
                    };
                    let _ = reply.send(result);
                }
                drop(stream);
                debug!("Stream thread for {} exiting", thread_name);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStream {
                device_name,
                control: Some(control_tx),
                running: false,
                thread: Some(thread),
            })),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(SinkError::device_error(device_name, e))
            }
            Err(_) => {
                let _ = thread.join();
                Err(SinkError::ChannelError(
                    "stream thread exited before reporting".into(),
                ))
            }
        }
    }

    fn send(&self, command: Control) -> Result<()> {
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| SinkError::ChannelError("stream closed".into()))?;
        let (reply_tx, reply_rx) = bounded(1);
        control
            .send((command, reply_tx))
            .map_err(|_| SinkError::ChannelError("stream thread gone".into()))?;
        match reply_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SinkError::device_error(&self.device_name, e)),
            Err(_) => Err(SinkError::ChannelError("stream thread gone".into())),
        }
    }
}

impl AudioStream for CpalStream {
    fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        self.send(Control::Play)?;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        self.running = false;
        self.send(Control::Pause)
    }

    fn is_running(&self) -> bool {
        self.running
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        // Closing the channel ends the thread, which drops the stream
        self.control.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Stream thread for {} panicked", self.device_name);
            }
        }
    }
}
