//! Host-side room reactor.
//!
//! One thread owns all mutable room state (participant list, queue, player
//! handle, start time) and multiplexes, via `select!`:
//!
//! - network events (accepted connections, parsed headers, disconnects)
//!   forwarded by the listener thread and the per-participant header readers,
//! - console lines,
//! - three worker-completion channels: `recv_done`, `send_done`, `audio_done`.
//!
//! Bulk I/O never happens on the reactor thread. Uploads are read by detached
//! receive workers, replication is written by detached send workers, and the
//! audio-end waiter blocks in its own thread. Each participant's header
//! reader is gated by a token channel: the reactor withholds the token while
//! a worker owns the socket's read side and re-arms it from the completion
//! record, so at most one thread reads a given socket at a time.

use std::fs;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, Sender, select, unbounded};
use room_proto::{Command, Header, decode_join_name, encode_start_time};

use crate::config::SessionConfig;
use crate::console;
use crate::media;
use crate::net::{NetError, SharedStream};
use crate::player::TrackPlayer;
use crate::storage::{Backing, MusicStorage, Slot, StorageError};

pub type ParticipantId = u64;

/// Longest display name accepted in a `JOIN` body.
const MAX_NAME_LEN: u32 = 256;

enum NetEvent {
    Accepted(TcpStream),
    Header { id: ParticipantId, header: Header },
    /// The participant sent bytes that do not parse as a frame.
    Bad { id: ParticipantId },
    Closed { id: ParticipantId },
}

/// Completion record of a receive worker (or the local add-song prompt;
/// those carry no participant id).
struct RecvDone {
    participant: Option<ParticipantId>,
    slot: Arc<Slot>,
    ok: bool,
}

/// Completion record of one send worker.
struct SendDone {
    participant: ParticipantId,
    ok: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParticipantState {
    Idle,
    Reserving,
    Receiving,
}

struct Participant {
    id: ParticipantId,
    name: String,
    stream: Arc<SharedStream>,
    state: ParticipantState,
    pending_slot: Option<Arc<Slot>>,
    /// Catch-up sends still owed to this newcomer.
    entries_until_synced: u32,
    /// Token channel arming the header reader for one more read.
    rearm: Sender<()>,
}

pub struct Room {
    cfg: SessionConfig,
    storage: Arc<MusicStorage>,
    player: Arc<dyn TrackPlayer>,
    participants: Vec<Participant>,
    next_participant: ParticipantId,
    /// Wall-clock seconds when the current track started.
    start_time: Option<i64>,
    /// Slot currently fed to the player. A finished track keeps this until
    /// `audio_done` pops it, so stray play attempts cannot re-feed the head.
    playing_slot: Option<crate::storage::SlotId>,
    net_tx: Sender<NetEvent>,
    recv_done_tx: Sender<RecvDone>,
    send_done_tx: Sender<SendDone>,
    audio_done_tx: Sender<()>,
    /// While a prompt worker owns the console, lines are forwarded here.
    stdin_redirect: Option<Sender<String>>,
}

impl Room {
    /// Run a room on `listener` until the user exits. Blocks.
    pub fn run(
        listener: TcpListener,
        player: Arc<dyn TrackPlayer>,
        stdin_rx: Receiver<String>,
        cfg: SessionConfig,
    ) -> Result<()> {
        let local_addr = listener.local_addr().context("listener address")?;

        let (net_tx, net_rx) = unbounded();
        let (recv_done_tx, recv_done_rx) = unbounded();
        let (send_done_tx, send_done_rx) = unbounded();
        let (audio_done_tx, audio_done_rx) = unbounded();

        let shutdown = Arc::new(AtomicBool::new(false));
        let listener_thread = spawn_listener(listener, net_tx.clone(), shutdown.clone());

        let storage = Arc::new(MusicStorage::new(cfg.temp_dir.clone(), cfg.max_songs));
        let mut room = Room {
            cfg,
            storage,
            player,
            participants: Vec::new(),
            next_participant: 1,
            start_time: None,
            playing_slot: None,
            net_tx,
            recv_done_tx,
            send_done_tx,
            audio_done_tx,
            stdin_redirect: None,
        };

        tracing::info!(addr = %local_addr, "room is listening");
        room.event_loop(net_rx, stdin_rx, recv_done_rx, send_done_rx, audio_done_rx);

        // Wind down: stop the player, wake the listener thread out of
        // accept(), and unblock every parked header reader.
        room.player.pause();
        shutdown.store(true, Ordering::Relaxed);
        let _ = TcpStream::connect(local_addr);
        let _ = listener_thread.join();
        for p in &room.participants {
            p.stream.shutdown();
        }
        Ok(())
    }

    fn event_loop(
        &mut self,
        net_rx: Receiver<NetEvent>,
        stdin_rx: Receiver<String>,
        recv_done_rx: Receiver<RecvDone>,
        send_done_rx: Receiver<SendDone>,
        audio_done_rx: Receiver<()>,
    ) {
        loop {
            select! {
                recv(net_rx) -> event => match event {
                    Ok(event) => self.handle_net_event(event),
                    Err(_) => break,
                },
                recv(stdin_rx) -> line => match line {
                    Ok(line) => {
                        if self.handle_command(&line) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(recv_done_rx) -> done => {
                    if let Ok(done) = done {
                        self.handle_recv_done(done);
                    }
                },
                recv(send_done_rx) -> done => {
                    if let Ok(done) = done {
                        self.handle_send_done(done);
                    }
                },
                recv(audio_done_rx) -> done => {
                    if done.is_ok() {
                        self.handle_audio_done();
                    }
                },
            }
        }
    }

    // ---- network events ----------------------------------------------------

    fn handle_net_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Accepted(stream) => self.accept_participant(stream),
            NetEvent::Header { id, header } => self.handle_header(id, header),
            NetEvent::Bad { id } => self.drop_participant(id, Some(Command::BadValues)),
            NetEvent::Closed { id } => {
                if self.participants.iter().any(|p| p.id == id) {
                    println!("A client disconnected");
                }
                self.drop_participant(id, None);
            }
        }
    }

    fn accept_participant(&mut self, stream: TcpStream) {
        let stream = match SharedStream::new(stream) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                tracing::warn!("failed to adopt connection: {e}");
                return;
            }
        };

        let id = self.next_participant;
        self.next_participant += 1;

        let (rearm_tx, rearm_rx) = unbounded();
        spawn_header_reader(
            id,
            stream.clone(),
            self.cfg.max_file_size,
            self.net_tx.clone(),
            rearm_rx,
        );
        // Arm the first header read.
        let _ = rearm_tx.send(());

        println!("Client connected");
        tracing::info!(id, peer = %stream.peer_addr(), "participant joined");

        self.participants.push(Participant {
            id,
            name: "user".to_string(),
            stream,
            state: ParticipantState::Idle,
            pending_slot: None,
            entries_until_synced: 0,
            rearm: rearm_tx,
        });

        self.sync_new_participant(id);
    }

    /// Ship every already-replicated track to a newcomer.
    fn sync_new_participant(&mut self, id: ParticipantId) {
        let slots: Vec<Arc<Slot>> = self
            .storage
            .snapshot()
            .into_iter()
            .filter(|slot| slot.sent() > 0)
            .collect();

        for slot in slots {
            let Some(pos) = self.storage.position_of(slot.id()) else {
                continue;
            };
            let Some(bytes) = self.load_slot_bytes(&slot) else {
                continue;
            };
            let Some(p) = self.participants.iter_mut().find(|p| p.id == id) else {
                return;
            };
            p.entries_until_synced += 1;
            let stream = p.stream.clone();
            self.spawn_send_worker(id, stream, slot, bytes, pos as u8);
        }
    }

    fn handle_header(&mut self, id: ParticipantId, header: Header) {
        let Some(idx) = self.participants.iter().position(|p| p.id == id) else {
            return;
        };
        let stream = self.participants[idx].stream.clone();
        let state = self.participants[idx].state;

        match (header.command, state) {
            (Command::Join, _) => {
                if header.body_size > MAX_NAME_LEN {
                    self.drop_participant(id, Some(Command::BadValues));
                    return;
                }
                let mut body = vec![0u8; header.body_size as usize];
                if !body.is_empty() && stream.read_exact(&mut body).is_err() {
                    self.drop_participant(id, None);
                    return;
                }
                if let Ok(name) = decode_join_name(&body) {
                    if !name.is_empty() {
                        tracing::info!(id, name = %name, "participant named itself");
                        self.participants[idx].name = name;
                    }
                }
                self.rearm(id);
            }

            (Command::Leave, _) => {
                println!("{} left the room", self.participants[idx].name);
                self.drop_participant(id, None);
            }

            (Command::ReqAddToQueue, ParticipantState::Idle) if header.body_size == 0 => {
                match self.storage.reserve_temp() {
                    Ok(slot) => {
                        let pos = self.storage.position_of(slot.id()).unwrap_or(0) as u8;
                        let p = &mut self.participants[idx];
                        p.pending_slot = Some(slot);
                        p.state = ParticipantState::Reserving;
                        if stream
                            .send_with_option(Command::ResAddToQueueOk, pos)
                            .is_err()
                        {
                            self.drop_participant(id, None);
                            return;
                        }
                    }
                    Err(StorageError::QueueFull) => {
                        let _ = stream.send_basic(Command::ResAddToQueueNotOk);
                    }
                    Err(e) => {
                        tracing::warn!("slot reservation failed: {e}");
                        let _ = stream.send_basic(Command::ResAddToQueueNotOk);
                    }
                }
                self.rearm(id);
            }

            (Command::SongData, ParticipantState::Reserving) => {
                let Some(slot) = self.participants[idx].pending_slot.clone() else {
                    self.drop_participant(id, Some(Command::BadValues));
                    return;
                };
                if header.body_size == 0 {
                    self.drop_participant(id, Some(Command::BadValues));
                    return;
                }
                self.participants[idx].state = ParticipantState::Receiving;
                // The receive worker owns the socket's read side until its
                // completion record re-arms the header reader.
                self.spawn_receive_worker(id, stream, slot, header.body_size);
            }

            (Command::CancelReqAddToQueue, ParticipantState::Reserving) => {
                let slot = self.participants[idx].pending_slot.take();
                self.participants[idx].state = ParticipantState::Idle;
                if let Some(slot) = slot {
                    self.remove_queue_entry_and_broadcast(&slot);
                }
                self.rearm(id);
            }

            (Command::RecvOk, _) => {
                self.attempt_play_next();
                self.rearm(id);
            }

            (command, state) => {
                tracing::debug!(id, ?command, ?state, "protocol violation");
                self.drop_participant(id, Some(Command::BadValues));
            }
        }
    }

    // ---- workers -----------------------------------------------------------

    fn spawn_receive_worker(
        &self,
        id: ParticipantId,
        stream: Arc<SharedStream>,
        slot: Arc<Slot>,
        body_size: u32,
    ) {
        let done = self.recv_done_tx.clone();
        thread::spawn(move || {
            let ok = match receive_song_payload(&stream, &slot, body_size) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(id, "receive worker failed: {e:#}");
                    false
                }
            };
            let _ = done.send(RecvDone {
                participant: Some(id),
                slot,
                ok,
            });
        });
    }

    fn spawn_send_worker(
        &self,
        id: ParticipantId,
        stream: Arc<SharedStream>,
        slot: Arc<Slot>,
        bytes: Arc<Vec<u8>>,
        pos: u8,
    ) {
        let done = self.send_done_tx.clone();
        thread::spawn(move || {
            let ok = stream.write_message(Command::SongData, pos, &bytes).is_ok();
            if ok {
                slot.record_delivery();
            }
            let _ = done.send(SendDone {
                participant: id,
                ok,
            });
        });
    }

    fn handle_recv_done(&mut self, done: RecvDone) {
        match done.participant {
            Some(id) => {
                let exists = self.participants.iter().any(|p| p.id == id);
                if !done.ok {
                    if exists {
                        println!("A client disconnected");
                        self.drop_participant(id, None);
                    } else {
                        self.remove_queue_entry_and_broadcast(&done.slot);
                    }
                    return;
                }
                if let Some(p) = self.participants.iter_mut().find(|p| p.id == id) {
                    p.state = ParticipantState::Idle;
                    p.pending_slot = None;
                }
                self.rearm(id);
                self.fan_out(done.slot, Some(id));
            }
            None => {
                // Local add-song prompt finished; the console is ours again.
                self.stdin_redirect = None;
                if done.ok {
                    self.fan_out(done.slot, None);
                } else {
                    self.remove_queue_entry_and_broadcast(&done.slot);
                }
                console::prompt();
            }
        }
    }

    fn handle_send_done(&mut self, done: SendDone) {
        if !done.ok {
            self.drop_participant(done.participant, None);
            return;
        }
        let start_time = self.start_time;
        let playing = self.player.is_playing();
        let Some(p) = self
            .participants
            .iter_mut()
            .find(|p| p.id == done.participant)
        else {
            return;
        };
        if p.entries_until_synced > 0 {
            p.entries_until_synced -= 1;
            if p.entries_until_synced == 0 && playing {
                // The newcomer has everything; let it join the current track.
                if let Some(start) = start_time {
                    let _ = p
                        .stream
                        .write_message(Command::PlayNext, 0, &encode_start_time(start));
                }
            }
        }
    }

    fn handle_audio_done(&mut self) {
        self.storage.remove_front();
        self.playing_slot = None;
        self.attempt_play_next();
    }

    // ---- room logic --------------------------------------------------------

    /// Replicate `slot` to every participant except the originator.
    ///
    /// Only the first caller per slot does anything; concurrent or repeated
    /// calls lose the `sent` claim and abort silently.
    fn fan_out(&mut self, slot: Arc<Slot>, originator: Option<ParticipantId>) {
        if !slot.begin_fan_out() {
            return;
        }

        let targets: Vec<(ParticipantId, Arc<SharedStream>)> = self
            .participants
            .iter()
            .filter(|p| Some(p.id) != originator)
            .map(|p| (p.id, p.stream.clone()))
            .collect();

        if targets.is_empty() {
            self.attempt_play_next();
            return;
        }

        let Some(pos) = self.storage.position_of(slot.id()) else {
            return;
        };
        let Some(bytes) = self.load_slot_bytes(&slot) else {
            return;
        };

        for (id, stream) in targets {
            self.spawn_send_worker(id, stream, slot.clone(), bytes.clone(), pos as u8);
        }
    }

    /// Read a committed slot's file once into a shareable buffer.
    fn load_slot_bytes(&self, slot: &Arc<Slot>) -> Option<Arc<Vec<u8>>> {
        let backing = slot.lock_backing();
        let path = backing.ready_path()?;
        match fs::read(path) {
            Ok(bytes) => Some(Arc::new(bytes)),
            Err(e) => {
                tracing::warn!(path = ?path, "failed to load song for fan-out: {e}");
                None
            }
        }
    }

    /// Start the queue head if nothing is playing and its content is ready.
    fn attempt_play_next(&mut self) {
        if self.player.is_playing() {
            return;
        }
        let Some(slot) = self.storage.front() else {
            return;
        };
        if self.playing_slot == Some(slot.id()) {
            // The head already played to its end; audio_done will pop it.
            return;
        }
        let Some(backing) = slot.try_lock_backing() else {
            return;
        };
        let Some(path) = backing.ready_path().map(|p| p.to_path_buf()) else {
            return;
        };

        let start = now_secs();
        self.start_time = Some(start);
        self.playing_slot = Some(slot.id());
        let body = encode_start_time(start);

        let mut failed = Vec::new();
        for p in &self.participants {
            if p.stream
                .write_message(Command::PlayNext, 0, &body)
                .is_err()
            {
                failed.push(p.id);
            }
        }

        println!("Now playing: {}", path.display());
        self.player.feed(&path);
        self.player.play();
        drop(backing);

        let player = self.player.clone();
        let done = self.audio_done_tx.clone();
        thread::spawn(move || {
            player.wait_for_end();
            let _ = done.send(());
        });

        for id in failed {
            self.drop_participant(id, None);
        }
    }

    /// Structural removal plus the broadcast every replica needs.
    fn remove_queue_entry_and_broadcast(&mut self, slot: &Arc<Slot>) {
        let Some(pos) = self.storage.remove_by_id(slot.id()) else {
            return;
        };
        let mut failed = Vec::new();
        for p in &self.participants {
            if p.stream
                .send_with_option(Command::RemoveQueueEntry, pos as u8)
                .is_err()
            {
                failed.push(p.id);
            }
        }
        for id in failed {
            self.drop_participant(id, None);
        }
    }

    fn drop_participant(&mut self, id: ParticipantId, reply: Option<Command>) {
        let Some(idx) = self.participants.iter().position(|p| p.id == id) else {
            return;
        };
        let p = self.participants.remove(idx);
        if let Some(command) = reply {
            let _ = p.stream.send_basic(command);
        }
        p.stream.shutdown();
        tracing::info!(id, name = %p.name, "participant removed");
        if let Some(slot) = p.pending_slot {
            self.remove_queue_entry_and_broadcast(&slot);
        }
    }

    fn rearm(&self, id: ParticipantId) {
        if let Some(p) = self.participants.iter().find(|p| p.id == id) {
            let _ = p.rearm.send(());
        }
    }

    // ---- console -----------------------------------------------------------

    /// Returns `true` when the room should close.
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
                println!("Closing the room");
                return true;
            }
            "help" => console::print_session_help(),
            "faq" => console::print_faq(),
            "mute" => self.player.set_muted(true),
            "unmute" => self.player.set_muted(false),
            "add song" => {
                self.start_local_add();
                return false;
            }
            _ => println!("Invalid command. Try 'help' for information"),
        }
        console::prompt();
        false
    }

    /// Reserve a slot for one of the host's own files and hand the console to
    /// a prompt worker.
    fn start_local_add(&mut self) {
        let slot = match self.storage.reserve_local() {
            Ok(slot) => slot,
            Err(StorageError::QueueFull) => {
                println!("The queue is full, try again later");
                console::prompt();
                return;
            }
            Err(e) => {
                tracing::warn!("slot reservation failed: {e}");
                console::prompt();
                return;
            }
        };

        let (line_tx, line_rx) = unbounded();
        self.stdin_redirect = Some(line_tx);

        let done = self.recv_done_tx.clone();
        let max_file_size = self.cfg.max_file_size;
        thread::spawn(move || {
            let ok = prompt_for_local_song(&line_rx, &slot, max_file_size);
            let _ = done.send(RecvDone {
                participant: None,
                slot,
                ok,
            });
        });
    }
}

// ---- detached helpers ------------------------------------------------------

fn spawn_listener(
    listener: TcpListener,
    events: Sender<NetEvent>,
    shutdown: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        loop {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    if events.send(NetEvent::Accepted(stream)).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    if shutdown.load(Ordering::Relaxed) {
                        return;
                    }
                    tracing::warn!("accept error: {e}");
                }
            }
        }
    })
}

/// Reads one header per token, forwarding parse results to the reactor.
fn spawn_header_reader(
    id: ParticipantId,
    stream: Arc<SharedStream>,
    max_body: u32,
    events: Sender<NetEvent>,
    gate: Receiver<()>,
) {
    thread::spawn(move || {
        while gate.recv().is_ok() {
            match stream.read_header(max_body) {
                Ok(header) => {
                    if events.send(NetEvent::Header { id, header }).is_err() {
                        return;
                    }
                }
                Err(NetError::BadFrame(e)) => {
                    tracing::debug!(id, "unparseable header: {e}");
                    let _ = events.send(NetEvent::Bad { id });
                    return;
                }
                Err(NetError::PeerClosed) => {
                    let _ = events.send(NetEvent::Closed { id });
                    return;
                }
                Err(NetError::Transport(e)) => {
                    tracing::debug!(id, "socket error: {e}");
                    let _ = events.send(NetEvent::Closed { id });
                    return;
                }
            }
        }
    });
}

/// Drain the upload body into the reserved slot's temp file.
///
/// The slot lock is held for the duration of the file write; `ready` flips
/// only after every byte landed.
fn receive_song_payload(
    stream: &Arc<SharedStream>,
    slot: &Arc<Slot>,
    body_size: u32,
) -> Result<()> {
    let mut bytes = vec![0u8; body_size as usize];
    stream
        .read_exact(&mut bytes)
        .context("read song payload")?;

    let mut backing = slot.lock_backing();
    match &mut *backing {
        Backing::Temp { path, ready } => {
            fs::write(path.as_path(), &bytes).with_context(|| format!("write {path:?}"))?;
            *ready = true;
            Ok(())
        }
        other => Err(anyhow!("slot backing is {other:?}, expected temp")),
    }
}

/// Prompt loop for the host's own `add song`. Returns `false` on cancel.
fn prompt_for_local_song(
    lines: &Receiver<String>,
    slot: &Arc<Slot>,
    max_file_size: u32,
) -> bool {
    loop {
        println!("Enter file path (-1 to cancel):");
        console::prompt();
        let Ok(line) = lines.recv() else {
            return false;
        };
        let input = line.trim();
        if input == "-1" {
            return false;
        }
        let path = PathBuf::from(input);
        match media::validate_mp3(&path, max_file_size) {
            Ok(_) => {
                *slot.lock_backing() = Backing::Local { path };
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
