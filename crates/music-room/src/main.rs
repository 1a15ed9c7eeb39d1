//! `music-room` — host or join a synchronous MP3 listening room.

use anyhow::Result;
use clap::Parser;
use music_room::{cli, console, storage};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if args.list_devices {
        room_audio::device::list_devices(&cpal::default_host())?;
        return Ok(());
    }

    let temp_dir = args.temp_dir();
    match storage::sweep_stale_temp_files(&temp_dir) {
        Ok(0) => {}
        Ok(n) => tracing::info!(count = n, "cleaned up stale temp files"),
        Err(e) => tracing::warn!("temp sweep warning: {e}"),
    }

    let temp_dir_for_signal = temp_dir.clone();
    let _ = ctrlc::set_handler(move || {
        let _ = storage::sweep_stale_temp_files(&temp_dir_for_signal);
        std::process::exit(130);
    });

    console::run(&args)
}
