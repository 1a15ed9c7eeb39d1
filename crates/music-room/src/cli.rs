//! Command-line interface definitions.
//!
//! Only process-level knobs live here; everything interactive (ports, hosts,
//! file paths) is prompted on the console like the rest of the UI.

use std::path::PathBuf;

use clap::Parser;
use room_audio::config::PlaybackConfig;

use crate::config::SessionConfig;

#[derive(Parser, Debug)]
#[command(name = "music-room", about = "Host or join a synchronous MP3 listening room")]
pub struct Args {
    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Temp directory for received songs (defaults to the OS temp dir)
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Resampler input chunk size in frames (higher => more latency, lower => more overhead)
    #[arg(long, default_value_t = 1024)]
    pub chunk_frames: usize,

    /// Playback callback refill cap (frames). Larger reduces lock churn but can add latency.
    #[arg(long, default_value_t = 4096)]
    pub refill_max_frames: usize,

    /// Queue buffer target in seconds (per stage)
    #[arg(long, default_value_t = 2.0)]
    pub buffer_seconds: f32,
}

impl Args {
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            chunk_frames: self.chunk_frames,
            refill_max_frames: self.refill_max_frames,
            buffer_seconds: self.buffer_seconds,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            temp_dir: self.temp_dir(),
            ..SessionConfig::default()
        }
    }
}
