//! CLI argument parsing using clap

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// headunit-sink - real-time media sink for automotive head-units
///
/// Bench harness for the audio/video sink: enumerate devices, preview
/// negotiation, play local files and push raw H.264 through the video path.
#[derive(Parser, Debug)]
#[command(name = "headunit-sink")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Verbose output (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log output to file
    #[arg(long, global = true)]
    pub log: Option<String>,

    /// Configuration file (default: search standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// List audio devices
    List {
        /// Also list input (microphone) devices
        #[arg(long)]
        inputs: bool,
    },

    /// Show capabilities and the negotiated stream for the configured output
    Caps {
        /// Source sample rate to negotiate against
        #[arg(long, default_value = "48000")]
        rate: u32,

        /// Source bit depth
        #[arg(long, default_value = "16")]
        bits: u32,
    },

    /// Play local audio files through the output device
    Play {
        /// Files to queue, in order
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Repeat mode
        #[arg(short, long, value_enum, default_value = "off")]
        repeat: RepeatArg,
    },

    /// Decode a raw H.264 Annex-B file and present it on the display
    Video {
        /// Elementary stream file
        file: PathBuf,

        /// Bytes handed to each write() call
        #[arg(long, default_value = "16384")]
        chunk: usize,
    },

    /// Capture microphone PCM into a raw file
    Record {
        /// Output file (raw interleaved S16LE)
        output: PathBuf,

        /// Seconds to record
        #[arg(short, long, default_value = "5")]
        seconds: u32,
    },

    /// Print a sample configuration file
    SampleConfig,
}

/// Repeat policy accepted on the command line
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatArg {
    Off,
    All,
    One,
}

impl Args {
    /// Get the log level based on verbose/quiet flags
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else {
            match self.verbose {
                0 => tracing::Level::INFO,
                1 => tracing::Level::DEBUG,
                _ => tracing::Level::TRACE,
            }
        }
    }
}

impl Default for Command {
    fn default() -> Self {
        Command::List { inputs: false }
    }
}
