//! Output stage: a CPAL stream draining a [`PcmQueue`].
//!
//! The callback refills a small local buffer from the queue without blocking,
//! maps channels between source and device layouts, and converts `f32` to the
//! device sample format. Underruns are filled with silence. A muted stream
//! keeps draining the queue — playback position advances, the room stays in
//! sync, only the local output is silent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::queue::PcmQueue;

/// Knobs for the output callback.
pub struct OutputConfig {
    /// Maximum frames pulled from the queue per refill.
    pub refill_max_frames: usize,
    /// When true the callback writes silence but still consumes the queue.
    pub muted: Arc<AtomicBool>,
}

/// Build the output stream for `queue`. The stream is returned stopped;
/// call `stream.play()` to start.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<PcmQueue>,
    cfg: OutputConfig,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, cfg),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, cfg),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, cfg),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, cfg),
        other => Err(anyhow!("unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<PcmQueue>,
    cfg: OutputConfig,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels_out = config.channels as usize;
    let refill_max_frames = cfg.refill_max_frames.max(1);
    let muted = cfg.muted;

    let cursor = Arc::new(Mutex::new(Cursor {
        pos: 0,
        src_channels: queue.channels(),
        src: Vec::new(),
    }));

    let queue_cb = queue.clone();
    let cursor_cb = cursor.clone();
    let err_fn = |err| tracing::warn!("output stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let mut cur = cursor_cb.lock().unwrap();
            let silence = muted.load(Ordering::Relaxed);
            let frames = data.len() / channels_out;

            for frame in 0..frames {
                if cur.pos >= cur.src.len() {
                    cur.pos = 0;
                    cur.src.clear();
                    match queue_cb.pop_now(refill_max_frames) {
                        Some(v) => cur.src = v,
                        None => {
                            // Underrun or end of track: silence the rest.
                            for idx in (frame * channels_out)..data.len() {
                                data[idx] = T::from_sample::<f32>(0.0);
                            }
                            return;
                        }
                    }
                }
                for ch in 0..channels_out {
                    let sample = next_mapped_sample(&mut cur, channels_out, ch);
                    let sample = if silence { 0.0 } else { sample };
                    data[frame * channels_out + ch] = T::from_sample::<f32>(sample);
                }
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Refill buffer state local to one output stream.
struct Cursor {
    pos: usize,
    src_channels: usize,
    src: Vec<f32>,
}

/// Next output sample for `dst_ch` with basic channel mapping:
/// mono→many duplicates, stereo→mono averages, anything else clamps.
/// `cur.pos` advances by one source frame after the last output channel.
fn next_mapped_sample(cur: &mut Cursor, dst_channels: usize, dst_ch: usize) -> f32 {
    if cur.pos >= cur.src.len() {
        return 0.0;
    }

    let at = |ch: usize| -> f32 {
        if ch < cur.src_channels && cur.pos + ch < cur.src.len() {
            cur.src[cur.pos + ch]
        } else {
            0.0
        }
    };

    let out = match (cur.src_channels, dst_channels) {
        (2, 1) => 0.5 * (at(0) + at(1)),
        (1, _) => at(0),
        _ => at(dst_ch.min(cur.src_channels - 1)),
    };

    if dst_ch + 1 == dst_channels {
        cur.pos += cur.src_channels;
    }
    out
}
