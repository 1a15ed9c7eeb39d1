//! MP3 playback engine for the listening room.
//!
//! The engine is a three-stage pipeline:
//! 1. **Decode**: a background thread uses Symphonia to decode MP3 into
//!    interleaved `f32` samples.
//! 2. **Resample**: when the source rate differs from the device rate, a
//!    background thread converts between them with Rubato.
//! 3. **Output**: a CPAL stream whose callback drains the final queue without
//!    blocking.
//!
//! Stages hand off through bounded [`queue::PcmQueue`]s sized in seconds of
//! audio. [`player::Player`] wraps the pipeline in a one-track-at-a-time
//! session API (`feed` / `play` / `pause` / `wait_for_end` / `seek`) that the
//! room reactors drive.

pub mod config;
pub mod decode;
pub mod device;
pub mod playback;
pub mod player;
pub mod queue;
pub mod resample;
