//! Participant-side session reactor.
//!
//! Mirrors the host reactor's shape with a smaller surface: one gated header
//! reader on the room connection, the console, and a single worker-completion
//! channel. The session keeps a local replica of the room queue (positions
//! assigned by the host) and a local player that follows the host's
//! `PLAY_NEXT` schedule, seeking by the difference between local wall-clock
//! time and the start time the host broadcast.

use std::fs;
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, select, unbounded};
use room_proto::{Command, Header, START_TIME_LEN, decode_start_time, encode_join_name};

use crate::config::SessionConfig;
use crate::console;
use crate::media;
use crate::net::{NetError, SharedStream};
use crate::player::TrackPlayer;
use crate::storage::{Backing, MusicStorage, Slot, StorageError};

/// Playback offsets are clamped to under a day; anything larger means the
/// clocks disagree beyond repair.
const MAX_SEEK_SECS: i64 = 86_400;

enum ServerEvent {
    Header(Header),
    Bad,
    Closed,
}

struct WorkerDone {
    /// True when the finished worker owned the socket's read side.
    rearm_reader: bool,
    ok: bool,
}

struct ClientSession {
    cfg: SessionConfig,
    stream: Arc<SharedStream>,
    storage: Arc<MusicStorage>,
    player: Arc<dyn TrackPlayer>,
    /// Set once playback of the head started; the next `PLAY_NEXT` pops it.
    should_remove_first_on_next: bool,
    rearm: Sender<()>,
    worker_done_tx: Sender<WorkerDone>,
    stdin_redirect: Option<Sender<String>>,
}

/// Join the room on `stream` and run the session until the user leaves or
/// the room goes away. Blocks.
pub fn run(
    stream: TcpStream,
    name: &str,
    player: Arc<dyn TrackPlayer>,
    stdin_rx: Receiver<String>,
    cfg: SessionConfig,
) -> Result<()> {
    let stream = Arc::new(SharedStream::new(stream).context("adopt room connection")?);
    stream
        .write_message(Command::Join, 0, &encode_join_name(name))
        .context("send join")?;

    let (net_tx, net_rx) = unbounded();
    let (rearm_tx, rearm_rx) = unbounded();
    let (worker_done_tx, worker_done_rx) = unbounded();

    spawn_header_reader(stream.clone(), cfg.max_file_size, net_tx, rearm_rx);
    let _ = rearm_tx.send(());

    let storage = Arc::new(MusicStorage::new(cfg.temp_dir.clone(), cfg.max_songs));
    let mut session = ClientSession {
        cfg,
        stream: stream.clone(),
        storage,
        player,
        should_remove_first_on_next: false,
        rearm: rearm_tx,
        worker_done_tx,
        stdin_redirect: None,
    };

    session.event_loop(net_rx, stdin_rx, worker_done_rx);

    // Stop local playback and unblock the header reader.
    session.player.pause();
    stream.shutdown();
    Ok(())
}

impl ClientSession {
    fn event_loop(
        &mut self,
        net_rx: Receiver<ServerEvent>,
        stdin_rx: Receiver<String>,
        worker_done_rx: Receiver<WorkerDone>,
    ) {
        loop {
            select! {
                recv(net_rx) -> event => match event {
                    Ok(ServerEvent::Header(header)) => {
                        if !self.handle_header(header) {
                            break;
                        }
                    }
                    Ok(ServerEvent::Bad) | Ok(ServerEvent::Closed) | Err(_) => {
                        println!("Connection to the room was lost");
                        break;
                    }
                },
                recv(stdin_rx) -> line => match line {
                    Ok(line) => {
                        if self.handle_command(&line) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(worker_done_rx) -> done => {
                    if let Ok(done) = done {
                        if !self.handle_worker_done(done) {
                            break;
                        }
                    }
                },
            }
        }
    }

    // ---- messages from the host -------------------------------------------

    /// Returns `false` when the session must end.
    fn handle_header(&mut self, header: Header) -> bool {
        match header.command {
            Command::SongData => {
                let pos = header.option as usize;
                match self.storage.reserve_at(pos) {
                    Ok(slot) => {
                        // The receive worker owns the read side now; the
                        // header reader stays parked until it completes.
                        self.spawn_receive_worker(slot, header.body_size);
                        return true;
                    }
                    Err(StorageError::QueueFull) => {
                        tracing::warn!(pos, "song data for an impossible position");
                        if self.drain_body(header.body_size).is_err() {
                            return false;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("reserve failed: {e}");
                        if self.drain_body(header.body_size).is_err() {
                            return false;
                        }
                    }
                }
            }

            Command::PlayNext => {
                if header.body_size as usize != START_TIME_LEN {
                    tracing::debug!(size = header.body_size, "odd PLAY_NEXT body");
                    if self.drain_body(header.body_size).is_err() {
                        return false;
                    }
                } else {
                    let mut body = [0u8; START_TIME_LEN];
                    if self.stream.read_exact(&mut body).is_err() {
                        return false;
                    }
                    match decode_start_time(&body) {
                        Ok(room_time) => self.handle_play_next(room_time),
                        Err(e) => tracing::debug!("bad PLAY_NEXT body: {e}"),
                    }
                }
            }

            Command::ResAddToQueueOk => {
                self.start_upload(header.option);
            }

            Command::ResAddToQueueNotOk => {
                println!("The room is not allowing you to queue a song right now");
                console::prompt();
            }

            Command::RemoveQueueEntry => {
                self.storage.remove_by_position(header.option as usize);
            }

            other => {
                tracing::debug!(?other, "ignoring message from the room");
                if self.drain_body(header.body_size).is_err() {
                    return false;
                }
            }
        }
        self.rearm();
        true
    }

    /// Follow the host onto the queue head at the broadcast start time.
    fn handle_play_next(&mut self, room_time: i64) {
        if self.player.is_playing() {
            self.player.pause();
            self.player.wait_for_end();
        }
        if self.should_remove_first_on_next {
            self.storage.remove_front();
        }
        self.should_remove_first_on_next = false;

        let Some(slot) = self.storage.front() else {
            return;
        };
        let path = {
            let Some(backing) = slot.try_lock_backing() else {
                return;
            };
            let Some(path) = backing.ready_path().map(Path::to_path_buf) else {
                return;
            };
            path
        };

        let offset = (now_secs() - room_time).clamp(0, MAX_SEEK_SECS - 1);
        tracing::info!(path = ?path, offset, "joining playback");
        self.player.feed(&path);
        self.player.seek(offset as f64);
        self.player.play();
        self.should_remove_first_on_next = true;
    }

    // ---- workers -----------------------------------------------------------

    fn spawn_receive_worker(&self, slot: Arc<Slot>, body_size: u32) {
        let stream = self.stream.clone();
        let storage = self.storage.clone();
        let done = self.worker_done_tx.clone();
        thread::spawn(move || {
            let ok = match receive_song_payload(&stream, &storage, &slot, body_size) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!("receive worker failed: {e:#}");
                    false
                }
            };
            let _ = done.send(WorkerDone {
                rearm_reader: true,
                ok,
            });
        });
    }

    /// The host granted our reservation; hand the console to an upload
    /// prompt worker.
    fn start_upload(&mut self, pos: u8) {
        let (line_tx, line_rx) = unbounded();
        self.stdin_redirect = Some(line_tx);

        let stream = self.stream.clone();
        let done = self.worker_done_tx.clone();
        let max_file_size = self.cfg.max_file_size;
        thread::spawn(move || {
            let ok = run_upload_prompt(&line_rx, &stream, pos, max_file_size);
            let _ = done.send(WorkerDone {
                rearm_reader: false,
                ok,
            });
        });
    }

    /// Returns `false` when the session must end.
    fn handle_worker_done(&mut self, done: WorkerDone) -> bool {
        if done.rearm_reader {
            self.rearm();
        } else {
            self.stdin_redirect = None;
            console::prompt();
        }
        if !done.ok {
            println!("Connection to the room was lost");
            return false;
        }
        true
    }

    // ---- console -----------------------------------------------------------

    /// Returns `true` when the user asked to leave.
    fn handle_command(&mut self, line: &str) -> bool {
        if let Some(redirect) = &self.stdin_redirect {
            if redirect.send(line.to_string()).is_ok() {
                return false;
            }
            // The prompt worker is gone; reclaim the console.
            self.stdin_redirect = None;
        }

        match line.trim() {
            "" => {}
            "exit" | "quit" => {
                let _ = self.stream.send_basic(Command::Leave);
                println!("Leaving the room");
                return true;
            }
            "help" => console::print_session_help(),
            "faq" => console::print_faq(),
            "mute" => self.player.set_muted(true),
            "unmute" => self.player.set_muted(false),
            "add song" => {
                if self.stream.send_basic(Command::ReqAddToQueue).is_err() {
                    println!("Connection to the room was lost");
                    return true;
                }
                // The host's response drives the next step.
                return false;
            }
            _ => println!("Invalid command. Try 'help' for information"),
        }
        console::prompt();
        false
    }

    fn drain_body(&self, body_size: u32) -> Result<(), NetError> {
        if body_size == 0 {
            return Ok(());
        }
        let mut junk = vec![0u8; body_size as usize];
        self.stream.read_exact(&mut junk)
    }

    fn rearm(&self) {
        let _ = self.rearm.send(());
    }
}

// ---- detached helpers ------------------------------------------------------

fn spawn_header_reader(
    stream: Arc<SharedStream>,
    max_body: u32,
    events: Sender<ServerEvent>,
    gate: Receiver<()>,
) {
    thread::spawn(move || {
        while gate.recv().is_ok() {
            match stream.read_header(max_body) {
                Ok(header) => {
                    if events.send(ServerEvent::Header(header)).is_err() {
                        return;
                    }
                }
                Err(NetError::BadFrame(e)) => {
                    tracing::debug!("unparseable header from room: {e}");
                    let _ = events.send(ServerEvent::Bad);
                    return;
                }
                Err(_) => {
                    let _ = events.send(ServerEvent::Closed);
                    return;
                }
            }
        }
    });
}

/// Spool an incoming track into a fresh temp file, mark the slot ready and
/// acknowledge the transfer.
fn receive_song_payload(
    stream: &Arc<SharedStream>,
    storage: &Arc<MusicStorage>,
    slot: &Arc<Slot>,
    body_size: u32,
) -> Result<()> {
    let mut bytes = vec![0u8; body_size as usize];
    stream
        .read_exact(&mut bytes)
        .context("read song payload")?;

    {
        let mut backing = slot.lock_backing();
        let path = match &*backing {
            // Re-sent position: reuse the temp file already there.
            Backing::Temp { path, .. } => path.clone(),
            _ => storage.create_temp_file().context("create temp file")?,
        };
        fs::write(&path, &bytes).with_context(|| format!("write {path:?}"))?;
        *backing = Backing::Temp { path, ready: true };
    }

    stream
        .send_basic(Command::RecvOk)
        .context("acknowledge transfer")?;
    Ok(())
}

/// Prompt loop for uploading a file after the room granted position `pos`.
///
/// Returns `false` only when the connection is gone; a cancelled prompt
/// (`-1`) tells the room and counts as success.
fn run_upload_prompt(
    lines: &Receiver<String>,
    stream: &Arc<SharedStream>,
    pos: u8,
    max_file_size: u32,
) -> bool {
    loop {
        println!("Enter file path (-1 to cancel):");
        console::prompt();
        let Ok(line) = lines.recv() else {
            return stream.send_basic(Command::CancelReqAddToQueue).is_ok();
        };
        let input = line.trim();
        if input == "-1" {
            return stream.send_basic(Command::CancelReqAddToQueue).is_ok();
        }
        match media::load_mp3(Path::new(input), max_file_size) {
            Ok(bytes) => {
                if stream.write_message(Command::SongData, pos, &bytes).is_err() {
                    return false;
                }
                println!("Song sent to the room");
                return true;
            }
            Err(e) => println!("Error: {e}"),
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
