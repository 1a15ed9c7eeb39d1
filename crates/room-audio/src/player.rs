//! One-track-at-a-time playback sessions.
//!
//! [`Player`] is the handle the room reactors hold. A *session* is one track
//! being decoded and played; it lives on its own thread and winds down when
//! the track ends, a fatal pipeline error occurs, or [`Player::pause`] cancels
//! it. The contract the reactors rely on:
//!
//! - `feed(path)` stops any current session and stages the track.
//! - `seek(secs)` adjusts the staged start offset (call between `feed` and
//!   `play`).
//! - `play()` starts the staged track; a no-op while a session is playing.
//! - `pause()` cancels the running session; `wait_for_end()` then returns
//!   promptly. Together they are "stop".
//! - `wait_for_end()` blocks until the current session finishes (any reason).
//! - `mute`/`unmute` silence the output while the track keeps advancing, so a
//!   muted listener stays in step with the room.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use cpal::traits::{DeviceTrait, StreamTrait};

use crate::config::PlaybackConfig;
use crate::playback::OutputConfig;
use crate::queue::wait_drained_or_cancelled;
use crate::{decode, device, playback, resample};

/// State shared between the handle and one session thread.
struct Session {
    cancel: AtomicBool,
    playing: AtomicBool,
    finished: Mutex<bool>,
    cv: Condvar,
}

impl Session {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cancel: AtomicBool::new(false),
            playing: AtomicBool::new(true),
            finished: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn finish(&self) {
        self.playing.store(false, Ordering::Relaxed);
        let mut g = self.finished.lock().unwrap();
        *g = true;
        drop(g);
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut g = self.finished.lock().unwrap();
        while !*g {
            g = self.cv.wait(g).unwrap();
        }
    }
}

struct Staged {
    path: PathBuf,
    seek_secs: Option<f64>,
}

struct Inner {
    staged: Option<Staged>,
    session: Option<Arc<Session>>,
}

pub struct Player {
    device_needle: Option<String>,
    playback: PlaybackConfig,
    muted: Arc<AtomicBool>,
    inner: Mutex<Inner>,
}

impl Player {
    pub fn new(device_needle: Option<String>, playback: PlaybackConfig) -> Self {
        Self {
            device_needle,
            playback,
            muted: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(Inner {
                staged: None,
                session: None,
            }),
        }
    }

    /// Stop the current track (if any) and stage `path` for the next `play`.
    pub fn feed(&self, path: &Path) {
        self.pause();
        self.wait_for_end();
        let mut inner = self.inner.lock().unwrap();
        inner.session = None;
        inner.staged = Some(Staged {
            path: path.to_path_buf(),
            seek_secs: None,
        });
    }

    /// Set the start offset for the staged track.
    pub fn seek(&self, seconds: f64) {
        let mut inner = self.inner.lock().unwrap();
        match inner.staged.as_mut() {
            Some(staged) => staged.seek_secs = Some(seconds.max(0.0)),
            None => tracing::debug!(seconds, "seek ignored: nothing staged"),
        }
    }

    /// Start playing the staged track. No-op while a session is playing or
    /// when nothing is staged.
    pub fn play(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(session) = &inner.session {
            if session.playing.load(Ordering::Relaxed) {
                return;
            }
        }
        let Some(staged) = inner.staged.take() else {
            return;
        };

        let session = Session::new();
        inner.session = Some(session.clone());
        drop(inner);

        let needle = self.device_needle.clone();
        let playback = self.playback.clone();
        let muted = self.muted.clone();
        thread::spawn(move || {
            if let Err(e) = run_session(&staged, needle.as_deref(), &playback, &muted, &session) {
                tracing::warn!(path = ?staged.path, "playback session error: {e:#}");
            }
            session.finish();
        });
    }

    /// Cancel the running session; playback stops shortly after.
    pub fn pause(&self) {
        let inner = self.inner.lock().unwrap();
        if let Some(session) = &inner.session {
            session.cancel.store(true, Ordering::Relaxed);
        }
    }

    /// Block until the current session finishes. Returns immediately when no
    /// session was started.
    pub fn wait_for_end(&self) {
        let session = {
            let inner = self.inner.lock().unwrap();
            inner.session.clone()
        };
        if let Some(session) = session {
            session.wait();
        }
    }

    pub fn is_playing(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .session
            .as_ref()
            .map(|s| s.playing.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }
}

/// Decode → (resample) → output for one track; blocks until the track ends
/// or the session is cancelled.
fn run_session(
    staged: &Staged,
    device_needle: Option<&str>,
    playback: &PlaybackConfig,
    muted: &Arc<AtomicBool>,
    session: &Arc<Session>,
) -> Result<()> {
    let (src_spec, srcq) =
        decode::start_file_decode(&staged.path, staged.seek_secs, playback.buffer_seconds)?;

    let host = cpal::default_host();
    let device = device::pick_device(&host, device_needle)?;
    let config = device
        .default_output_config()
        .context("query default output config")?;
    let stream_config: cpal::StreamConfig = config.clone().into();

    let srcq_for_cancel = srcq.clone();
    let dst_rate = stream_config.sample_rate;
    let dstq = if src_spec.rate == dst_rate {
        srcq
    } else {
        resample::start_resampler(
            srcq,
            src_spec,
            dst_rate,
            playback.chunk_frames,
            playback.buffer_seconds,
        )?
    };

    let stream = playback::build_output_stream(
        &device,
        &stream_config,
        config.sample_format(),
        &dstq,
        OutputConfig {
            refill_max_frames: playback.refill_max_frames,
            muted: muted.clone(),
        },
    )?;
    stream.play().context("start output stream")?;

    let finished_normally = wait_drained_or_cancelled(&dstq, &session.cancel);
    if !finished_normally {
        srcq_for_cancel.close();
        dstq.close();
    }

    // Let the device drain its last buffer before the stream drops.
    thread::sleep(Duration::from_millis(100));
    Ok(())
}
