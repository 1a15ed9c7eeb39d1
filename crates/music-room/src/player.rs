//! The playback contract the reactors drive.
//!
//! Reactors only ever talk to a [`TrackPlayer`]; the real implementation is
//! [`room_audio::player::Player`], and tests substitute a scripted fake.

use std::path::Path;

pub trait TrackPlayer: Send + Sync {
    /// Stop the current track (if any) and stage `path`.
    fn feed(&self, path: &Path);
    /// Start the staged track; no-op while already playing.
    fn play(&self);
    /// Cancel the running track.
    fn pause(&self);
    /// Block until the current track finishes for any reason.
    fn wait_for_end(&self);
    /// Set the start offset of the staged track, in seconds.
    fn seek(&self, seconds: f64);
    fn set_muted(&self, muted: bool);
    fn is_playing(&self) -> bool;
}

impl TrackPlayer for room_audio::player::Player {
    fn feed(&self, path: &Path) {
        room_audio::player::Player::feed(self, path);
    }

    fn play(&self) {
        room_audio::player::Player::play(self);
    }

    fn pause(&self) {
        room_audio::player::Player::pause(self);
    }

    fn wait_for_end(&self) {
        room_audio::player::Player::wait_for_end(self);
    }

    fn seek(&self, seconds: f64) {
        room_audio::player::Player::seek(self, seconds);
    }

    fn set_muted(&self, muted: bool) {
        room_audio::player::Player::set_muted(self, muted);
    }

    fn is_playing(&self) -> bool {
        room_audio::player::Player::is_playing(self)
    }
}
