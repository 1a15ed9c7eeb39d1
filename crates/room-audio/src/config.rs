/// Tuning knobs shared by the pipeline stages.
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Resampler input chunk size in frames.
    pub chunk_frames: usize,
    /// Maximum frames the output callback pulls per refill.
    pub refill_max_frames: usize,
    /// Target buffering per stage, in seconds of audio.
    pub buffer_seconds: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            chunk_frames: 1024,
            refill_max_frames: 4096,
            buffer_seconds: 2.0,
        }
    }
}
