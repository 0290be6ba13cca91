use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "beatstroke", about = "Turns music into a beat-synchronised stroke signal")]
pub struct Cli {
    /// Config file (defaults to ./beatstroke.toml or the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Onset sensitivity multiplier; higher detects fewer beats
    #[arg(long, global = true)]
    pub sensitivity: Option<f64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Analyze audio files and print their beat maps
    Analyze {
        /// Input audio files (WAV, MP3, FLAC, OGG)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Print the full beat maps as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Play a file through the engine and report the generated positions
    Simulate {
        /// Input audio file
        file: PathBuf,

        /// Position ticks per second
        #[arg(long, default_value_t = 60)]
        rate: u32,

        /// Pace ticks at playback speed instead of as fast as possible
        #[arg(long)]
        realtime: bool,
    },
}
