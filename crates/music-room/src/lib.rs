//! Synchronous listening-room core.
//!
//! One process hosts a room (`host::Room`): it accepts TCP participants,
//! collects their MP3 uploads into a shared queue, replicates every upload to
//! every other participant, and coordinates lock-step playback by
//! broadcasting a wall-clock start time with each track. Other processes join
//! as participants (`client::ClientSession`) and mirror the queue and the
//! playback schedule locally.
//!
//! Both endpoints are built around the same shape: a single reactor thread
//! multiplexing (via `crossbeam_channel::select!`) socket events, console
//! input and worker-completion channels, with short-lived worker threads for
//! anything that would block — bulk socket transfers, file prompts and the
//! audio-end waiter.

pub mod client;
pub mod config;
pub mod console;
pub mod host;
pub mod media;
pub mod net;
pub mod player;
pub mod storage;

/// CLI surface of the `music-room` binary.
pub mod cli;
