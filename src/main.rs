//! headunit-sink - bench harness for the real-time media sink

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use headunit_sink::audio::{AudioHost, Direction, StreamNegotiation};
use headunit_sink::config::{Args, Command, MediaConfig, RepeatArg, SinkConfig};
use headunit_sink::device::DeviceEnumerator;
use headunit_sink::player::{AudioPlayer, PlayerEvent, RepeatMode};

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    let config = match &args.config {
        Some(path) => SinkConfig::load(path)?,
        None => SinkConfig::load_default()?,
    };
    let config: Arc<dyn MediaConfig> = Arc::new(config);

    match args.command.unwrap_or_default() {
        Command::List { inputs } => cmd_list(inputs),
        Command::Caps { rate, bits } => cmd_caps(&config, rate, bits),
        Command::Play { files, repeat } => cmd_play(config, files, repeat),
        Command::Video { file, chunk } => cmd_video(config, &file, chunk),
        Command::Record { output, seconds } => cmd_record(config, &output, seconds),
        Command::SampleConfig => {
            print!("{}", SinkConfig::sample_config());
            Ok(())
        }
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let level = args.log_level();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if let Some(log_file) = &args.log {
        let file = std::fs::File::create(log_file)?;
        subscriber.with_writer(file).init();
    } else {
        subscriber.init();
    }

    Ok(())
}

#[cfg(feature = "cpal")]
fn audio_host() -> Result<Arc<dyn AudioHost>> {
    Ok(Arc::new(headunit_sink::audio::cpal_host::CpalHost::new()))
}

#[cfg(not(feature = "cpal"))]
fn audio_host() -> Result<Arc<dyn AudioHost>> {
    anyhow::bail!("built without audio support, rebuild with --features cpal")
}

/// Flag cleared by the first Ctrl+C
fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\nStopping...");
        r.store(false, Ordering::SeqCst);
    })
    .context("install signal handler")?;
    Ok(running)
}

/// List audio devices
fn cmd_list(inputs: bool) -> Result<()> {
    let enumerator = DeviceEnumerator::new(audio_host()?);

    let mut directions = vec![Direction::Output];
    if inputs {
        directions.push(Direction::Input);
    }

    for direction in directions {
        let devices = enumerator.enumerate(direction).unwrap_or_default();
        println!("{:?} devices:\n", direction);
        if devices.is_empty() {
            println!("  (none)");
        }
        for (i, device) in devices.iter().enumerate() {
            println!("  {}. {}", i + 1, device);
        }
        println!();
    }

    Ok(())
}

/// Show what the configured output would be opened with
fn cmd_caps(config: &Arc<dyn MediaConfig>, rate: u32, bits: u32) -> Result<()> {
    let host = audio_host()?;
    let enumerator = DeviceEnumerator::new(Arc::clone(&host));
    let device = enumerator.select(Direction::Output, &config.audio_output_device_name())?;
    let caps = host.capabilities(&device)?;

    println!("Device:   {}", device);
    println!("Rates:    {} - {} Hz", caps.min_rate, caps.max_rate);
    println!("Channels: up to {}", caps.max_channels);
    let formats: Vec<String> = caps.formats.iter().map(|f| f.to_string()).collect();
    println!("Formats:  {}", formats.join(", "));

    let negotiation = StreamNegotiation::for_playback(device, rate, bits, &caps);
    println!("\nSource {} Hz / {}-bit plays as:", rate, bits);
    println!("  Format:  {}", negotiation.format);
    println!(
        "  Offload: {}",
        if negotiation.native_offload { "native" } else { "resampled" }
    );
    println!(
        "  Buffer:  {} frames, period {} frames x {}",
        negotiation.buffer_frames, negotiation.period_frames, negotiation.buffers
    );

    Ok(())
}

/// Play local files in order
fn cmd_play(
    config: Arc<dyn MediaConfig>,
    files: Vec<std::path::PathBuf>,
    repeat: RepeatArg,
) -> Result<()> {
    let player = AudioPlayer::new(audio_host()?, config);
    let events = player.events();
    let running = interrupt_flag()?;

    player.set_repeat_mode(match repeat {
        RepeatArg::Off => RepeatMode::Off,
        RepeatArg::All => RepeatMode::All,
        RepeatArg::One => RepeatMode::One,
    });
    player.set_playlist(files);
    player.play_index(0);

    while running.load(Ordering::SeqCst) {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(PlayerEvent::TrackChanged(track)) => println!("Playing: {}", track.title),
            Ok(PlayerEvent::StreamInfo(stream)) => println!(
                "  {} ({})",
                stream.format,
                if stream.native_offload { "native" } else { "resampled" }
            ),
            Ok(PlayerEvent::PlaybackError(message)) => warn!("{}", message),
            Ok(_) => {}
            Err(_) => {
                if player.is_idle() {
                    break;
                }
            }
        }
    }

    player.stop();
    println!("Stopped.");
    Ok(())
}

/// Push an Annex-B file through the video output
#[cfg(feature = "ffmpeg")]
fn cmd_video(config: Arc<dyn MediaConfig>, file: &std::path::Path, chunk: usize) -> Result<()> {
    use headunit_sink::video::ffmpeg::FfmpegKmsBackend;
    use headunit_sink::video::HardwareVideoOutput;
    use std::time::Instant;

    let data = std::fs::read(file).with_context(|| format!("read {}", file.display()))?;
    let output = HardwareVideoOutput::new(FfmpegKmsBackend, config);
    output.open()?;
    output.init()?;

    // First Ctrl+C stops gracefully; a second one releases display buffers
    // from the handler and exits
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        let emergency = output.emergency();
        ctrlc::set_handler(move || {
            if running.swap(false, Ordering::SeqCst) {
                return;
            }
            emergency.run();
            std::process::exit(130);
        })
        .context("install signal handler")?;
    }

    let started = Instant::now();
    for (i, piece) in data.chunks(chunk.max(1)).enumerate() {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        output.write(started.elapsed().as_nanos() as u64, piece);
        std::thread::sleep(Duration::from_millis(2));
        if i % 100 == 0 {
            let stats = output.stats();
            tracing::info!(
                "{} writes, {} frames shown, {} dropped",
                stats.writes, stats.frames_shown, stats.frames_dropped
            );
        }
    }

    let stats = output.stats();
    output.stop();
    println!(
        "Shown {} frames ({} dropped) from {} access units",
        stats.frames_shown, stats.frames_dropped, stats.access_units
    );
    Ok(())
}

#[cfg(not(feature = "ffmpeg"))]
fn cmd_video(_config: Arc<dyn MediaConfig>, _file: &std::path::Path, _chunk: usize) -> Result<()> {
    anyhow::bail!("built without video support, rebuild with --features ffmpeg")
}

/// Capture microphone audio to a raw S16LE file
fn cmd_record(config: Arc<dyn MediaConfig>, output: &std::path::Path, seconds: u32) -> Result<()> {
    use headunit_sink::audio::{read_promise, AudioFormat, HardwareAudioInput};
    use std::io::Write;
    use std::time::Instant;

    let input = HardwareAudioInput::new(audio_host()?, config, AudioFormat::s16(16_000, 1));
    let negotiation = input.open()?;
    println!("Recording from {} ({})", negotiation.device, negotiation.format);

    let mut file = std::io::BufWriter::new(
        std::fs::File::create(output).with_context(|| format!("create {}", output.display()))?,
    );
    let running = interrupt_flag()?;
    input.start()?;

    let deadline = Instant::now() + Duration::from_secs(seconds as u64);
    let mut total = 0usize;
    while running.load(Ordering::SeqCst) && Instant::now() < deadline {
        let (promise, future) = read_promise();
        input.read(promise);
        match future.wait(Duration::from_secs(1)) {
            Ok(data) => {
                file.write_all(&data)?;
                total += data.len();
            }
            Err(e) => {
                warn!("Capture read failed: {}", e);
                break;
            }
        }
    }

    input.stop();
    file.flush()?;
    println!("Wrote {} bytes to {}", total, output.display());
    Ok(())
}
