//! Streaming MP3 decode stage.
//!
//! Probes the file with Symphonia, optionally seeks to a start offset, then
//! decodes packets into interleaved `f32` on a background thread that feeds a
//! bounded [`PcmQueue`]. The queue is closed on EOF or on a fatal decoder
//! error, which is how downstream stages learn the track is over.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::formats::{FormatOptions, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

use crate::queue::{PcmQueue, samples_for_seconds};

/// Start decoding `path`, optionally seeking to `seek_secs` first.
///
/// Returns the source signal spec and the queue the decoder thread fills.
pub fn start_file_decode(
    path: &Path,
    seek_secs: Option<f64>,
    buffer_seconds: f32,
) -> Result<(SignalSpec, Arc<PcmQueue>)> {
    let file = File::open(path).with_context(|| format!("open {path:?}"))?;

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .with_context(|| format!("probe {path:?}"))?;

    let mut format = probed.format;

    if let Some(secs) = seek_secs {
        if secs > 0.0 {
            let time = Time::new(secs.trunc() as u64, secs.fract());
            // Coarse is fine for MP3: frame granularity beats decode-and-skip.
            let _ = format.seek(
                SeekMode::Coarse,
                SeekTo::Time {
                    time,
                    track_id: None,
                },
            );
        }
    }

    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("no default audio track in {path:?}"))?;

    let channels = track
        .codec_params
        .channels
        .ok_or_else(|| anyhow!("unknown channel layout"))?;
    let rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("unknown sample rate"))?;

    let spec = SignalSpec::new(rate, channels);
    let codec_params: CodecParameters = track.codec_params.clone();

    let queue = Arc::new(PcmQueue::new(
        channels.count(),
        samples_for_seconds(rate, channels.count(), buffer_seconds),
    ));

    let queue_thread = queue.clone();
    thread::spawn(move || {
        if let Err(e) = decode_loop(format, codec_params, &queue_thread) {
            tracing::warn!("decoder thread error: {e:#}");
        }
        queue_thread.close();
    });

    Ok((spec, queue))
}

fn decode_loop(
    mut format: Box<dyn symphonia::core::formats::FormatReader>,
    codec_params: CodecParameters,
    queue: &Arc<PcmQueue>,
) -> Result<()> {
    let mut decoder =
        symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(_) => break, // EOF
        };

        // Skip undecodable packets instead of aborting the track.
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(_) => continue,
        };

        let mut samples = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
        samples.copy_interleaved_ref(decoded);
        queue.push_blocking(samples.samples());
    }

    Ok(())
}
