//! Streaming resample stage (Rubato async sinc).
//!
//! Converts decoded interleaved `f32` audio from the source rate to the device
//! rate on a background thread. Only inserted when the rates differ.

use std::sync::Arc;
use std::thread;

use anyhow::Result;
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};
use symphonia::core::audio::SignalSpec;

use crate::queue::{PcmQueue, samples_for_seconds};

/// Start the resampler thread: reads `src_spec.rate` audio from `srcq`,
/// writes `dst_rate` audio into the returned queue.
pub fn start_resampler(
    srcq: Arc<PcmQueue>,
    src_spec: SignalSpec,
    dst_rate: u32,
    chunk_frames: usize,
    buffer_seconds: f32,
) -> Result<Arc<PcmQueue>> {
    let channels = src_spec.channels.count();
    let f_ratio = dst_rate as f64 / src_spec.rate as f64;

    let dstq = Arc::new(PcmQueue::new(
        channels,
        samples_for_seconds(dst_rate, channels, buffer_seconds),
    ));

    let sinc_len = 128;
    let window = WindowFunction::BlackmanHarris2;
    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff: calculate_cutoff(sinc_len, window),
        interpolation: SincInterpolationType::Cubic,
        oversampling_factor: 256,
        window,
    };

    let chunk_in = chunk_frames.max(1);
    let dstq_thread = dstq.clone();

    thread::spawn(move || {
        let mut resampler: Async<f32> =
            match Async::<f32>::new_sinc(f_ratio, 1.1, &params, chunk_in, channels, FixedAsync::Input) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!("resampler init error: {e:#}");
                    dstq_thread.close();
                    return;
                }
            };

        let mut out = vec![0.0f32; channels * chunk_in * 3];
        let mut indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len: None,
        };

        // Steady state: whole input chunks.
        while let Some(chunk) = srcq.pop_exact(chunk_in) {
            indexing.partial_len = None;
            if let Some(produced) =
                process_chunk(&mut resampler, &chunk, chunk_in, channels, &mut out, &mut indexing)
            {
                dstq_thread.push_blocking(&out[..produced]);
            } else {
                break;
            }
        }

        // Tail: whatever partial frames remain after the source closed.
        while let Some(tail) = srcq.pop_up_to(chunk_in) {
            let tail_frames = tail.len() / channels;
            if tail_frames == 0 {
                continue;
            }
            indexing.partial_len = Some(tail_frames);
            if let Some(produced) =
                process_chunk(&mut resampler, &tail, tail_frames, channels, &mut out, &mut indexing)
            {
                if produced > 0 {
                    dstq_thread.push_blocking(&out[..produced]);
                }
            } else {
                break;
            }
        }

        dstq_thread.close();
    });

    Ok(dstq)
}

/// Run one resampler pass; returns the number of produced samples.
fn process_chunk(
    resampler: &mut Async<f32>,
    input: &[f32],
    in_frames: usize,
    channels: usize,
    out: &mut [f32],
    indexing: &mut Indexing,
) -> Option<usize> {
    let input_adapter = match InterleavedSlice::new(input, channels, in_frames) {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("interleaved input adapter error: {e:#}");
            return None;
        }
    };

    let out_capacity_frames = out.len() / channels;
    let mut output_adapter = match InterleavedSlice::new_mut(out, channels, out_capacity_frames) {
        Ok(a) => a,
        Err(e) => {
            tracing::error!("interleaved output adapter error: {e:#}");
            return None;
        }
    };

    indexing.input_offset = 0;
    indexing.output_offset = 0;

    match resampler.process_into_buffer(&input_adapter, &mut output_adapter, Some(&*indexing)) {
        Ok((_consumed, produced_frames)) => Some(produced_frames * channels),
        Err(e) => {
            tracing::error!("resampler process error: {e:#}");
            None
        }
    }
}
