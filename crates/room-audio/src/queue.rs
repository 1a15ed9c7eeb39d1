//! Bounded queue of interleaved `f32` samples connecting pipeline stages.
//!
//! One producer (decode or resample thread) pushes, one consumer (resample
//! thread or the CPAL callback) pops. `close()` marks the end of the stream:
//! blocked producers give up, and consumers drain whatever is left before
//! seeing `None`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

pub struct PcmQueue {
    channels: usize,
    max_samples: usize,
    inner: Mutex<Inner>,
    cv: Condvar,
}

struct Inner {
    samples: VecDeque<f32>,
    closed: bool,
}

/// Capacity in samples for `seconds` of audio at `rate_hz` / `channels`.
///
/// Falls back to two seconds when `seconds` is non-finite or non-positive.
pub fn samples_for_seconds(rate_hz: u32, channels: usize, seconds: f32) -> usize {
    let secs = if seconds.is_finite() && seconds > 0.0 {
        seconds
    } else {
        2.0
    };
    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

impl PcmQueue {
    pub fn new(channels: usize, max_samples: usize) -> Self {
        Self {
            channels,
            max_samples: max_samples.max(channels),
            inner: Mutex::new(Inner {
                samples: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Mark the stream finished and wake every waiter. Idempotent.
    pub fn close(&self) {
        let mut g = self.inner.lock().unwrap();
        g.closed = true;
        drop(g);
        self.cv.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Push interleaved samples, blocking while the queue is full.
    ///
    /// Returns early (dropping the remainder) if the queue is closed.
    pub fn push_blocking(&self, samples: &[f32]) {
        let mut offset = 0;
        while offset < samples.len() {
            let mut g = self.inner.lock().unwrap();
            while g.samples.len() >= self.max_samples && !g.closed {
                g = self.cv.wait(g).unwrap();
            }
            if g.closed {
                return;
            }
            while offset < samples.len() && g.samples.len() < self.max_samples {
                g.samples.push_back(samples[offset]);
                offset += 1;
            }
            drop(g);
            self.cv.notify_all();
        }
    }

    /// Block until exactly `frames` whole frames are available and pop them.
    ///
    /// Returns `None` when the queue closes before enough data arrives; the
    /// remaining partial tail stays queued for [`PcmQueue::pop_up_to`].
    pub fn pop_exact(&self, frames: usize) -> Option<Vec<f32>> {
        let want = frames * self.channels;
        let mut g = self.inner.lock().unwrap();
        while g.samples.len() < want && !g.closed {
            g = self.cv.wait(g).unwrap();
        }
        if g.samples.len() < want {
            return None;
        }
        let out: Vec<f32> = g.samples.drain(..want).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }

    /// Block until at least one frame is available, pop up to `max_frames`.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub fn pop_up_to(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = self.inner.lock().unwrap();
        while g.samples.len() < self.channels && !g.closed {
            g = self.cv.wait(g).unwrap();
        }
        let available = g.samples.len() / self.channels;
        let take = available.min(max_frames) * self.channels;
        if take == 0 {
            return None;
        }
        let out: Vec<f32> = g.samples.drain(..take).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }

    /// Pop up to `max_frames` without blocking; `None` when nothing whole is
    /// queued. Safe to call from the audio callback.
    pub fn pop_now(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = self.inner.lock().unwrap();
        let available = g.samples.len() / self.channels;
        let take = available.min(max_frames) * self.channels;
        if take == 0 {
            return None;
        }
        let out: Vec<f32> = g.samples.drain(..take).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }
}

/// Block until `q` is closed and fully drained, or `cancel` flips.
///
/// Returns `true` when the queue drained normally, `false` on cancel.
pub fn wait_drained_or_cancelled(q: &Arc<PcmQueue>, cancel: &AtomicBool) -> bool {
    let mut g = q.inner.lock().unwrap();
    loop {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        if g.closed && g.samples.is_empty() {
            return true;
        }
        let (ng, _timeout) = q.cv.wait_timeout(g, Duration::from_millis(50)).unwrap();
        g = ng;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn push_then_pop_exact_preserves_order() {
        let q = PcmQueue::new(2, 64);
        q.push_blocking(&[1.0, 2.0, 3.0, 4.0]);
        let got = q.pop_exact(2).unwrap();
        assert_eq!(got, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn pop_exact_returns_none_when_closed_short() {
        let q = PcmQueue::new(1, 64);
        q.push_blocking(&[1.0]);
        q.close();
        assert!(q.pop_exact(2).is_none());
        // the tail is still reachable
        assert_eq!(q.pop_up_to(4).unwrap(), vec![1.0]);
        assert!(q.pop_up_to(4).is_none());
    }

    #[test]
    fn pop_now_never_blocks() {
        let q = PcmQueue::new(2, 64);
        assert!(q.pop_now(16).is_none());
        q.push_blocking(&[0.5, 0.5]);
        assert_eq!(q.pop_now(16).unwrap().len(), 2);
    }

    #[test]
    fn push_blocking_unblocks_on_close() {
        let q = Arc::new(PcmQueue::new(1, 2));
        q.push_blocking(&[1.0, 2.0]);
        let q2 = q.clone();
        let producer = thread::spawn(move || {
            // full; blocks until closed, then gives up
            q2.push_blocking(&[3.0, 4.0]);
        });
        thread::sleep(Duration::from_millis(20));
        q.close();
        producer.join().unwrap();
    }

    #[test]
    fn wait_drained_reports_cancel() {
        let q = Arc::new(PcmQueue::new(1, 16));
        q.push_blocking(&[1.0]);
        let cancel = AtomicBool::new(true);
        assert!(!wait_drained_or_cancelled(&q, &cancel));
    }

    #[test]
    fn wait_drained_reports_normal_end() {
        let q = Arc::new(PcmQueue::new(1, 16));
        q.close();
        let cancel = AtomicBool::new(false);
        assert!(wait_drained_or_cancelled(&q, &cancel));
    }

    #[test]
    fn samples_for_seconds_falls_back_on_bad_input() {
        assert_eq!(samples_for_seconds(48_000, 2, 1.0), 96_000);
        assert_eq!(
            samples_for_seconds(48_000, 2, f32::NAN),
            samples_for_seconds(48_000, 2, 2.0)
        );
    }
}
