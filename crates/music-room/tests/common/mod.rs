//! Shared helpers for protocol-level integration tests.
#![allow(dead_code)] // not every test binary uses every helper

use std::fs;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use music_room::player::TrackPlayer;
use room_proto::{Command, HEADER_LEN, Header, MAX_FILE_SIZE_BYTES, encode_join_name};

/// A scripted player: records what the reactor asks of it and lets tests end
/// tracks on demand.
pub struct FakePlayer {
    state: Mutex<FakeState>,
    cv: Condvar,
}

#[derive(Default)]
struct FakeState {
    staged: Option<PathBuf>,
    playing: bool,
    muted: bool,
    fed: Vec<PathBuf>,
    seeks: Vec<f64>,
}

impl FakePlayer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            cv: Condvar::new(),
        })
    }

    /// Simulate the current track reaching its end.
    pub fn finish_track(&self) {
        let mut st = self.state.lock().unwrap();
        st.playing = false;
        drop(st);
        self.cv.notify_all();
    }

    pub fn wait_until_playing(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock().unwrap();
        while !st.playing {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self.cv.wait_timeout(st, deadline - now).unwrap();
            st = next;
        }
        true
    }

    pub fn fed_paths(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().fed.clone()
    }

    pub fn seeks(&self) -> Vec<f64> {
        self.state.lock().unwrap().seeks.clone()
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().unwrap().muted
    }
}

impl TrackPlayer for FakePlayer {
    fn feed(&self, path: &std::path::Path) {
        let mut st = self.state.lock().unwrap();
        st.playing = false;
        st.staged = Some(path.to_path_buf());
        st.fed.push(path.to_path_buf());
    }

    fn play(&self) {
        let mut st = self.state.lock().unwrap();
        if st.playing {
            return;
        }
        if st.staged.take().is_some() {
            st.playing = true;
            drop(st);
            self.cv.notify_all();
        }
    }

    fn pause(&self) {
        let mut st = self.state.lock().unwrap();
        st.playing = false;
        drop(st);
        self.cv.notify_all();
    }

    fn wait_for_end(&self) {
        let mut st = self.state.lock().unwrap();
        while st.playing {
            st = self.cv.wait(st).unwrap();
        }
    }

    fn seek(&self, seconds: f64) {
        self.state.lock().unwrap().seeks.push(seconds);
    }

    fn set_muted(&self, muted: bool) {
        self.state.lock().unwrap().muted = muted;
    }

    fn is_playing(&self) -> bool {
        self.state.lock().unwrap().playing
    }
}

/// One scripted end of a room connection.
pub struct TestPeer {
    pub stream: TcpStream,
}

impl TestPeer {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to room");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self { stream }
    }

    /// Connect and announce a display name.
    pub fn join(addr: SocketAddr, name: &str) -> Self {
        let mut peer = Self::connect(addr);
        peer.send(Command::Join, 0, &encode_join_name(name));
        peer
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self { stream }
    }

    pub fn send(&mut self, command: Command, option: u8, body: &[u8]) {
        let header = Header::new(command, option, body.len() as u32);
        self.stream.write_all(&header.encode()).unwrap();
        self.stream.write_all(body).unwrap();
    }

    pub fn send_basic(&mut self, command: Command) {
        self.send(command, 0, &[]);
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    pub fn read_header(&mut self) -> io::Result<Header> {
        let mut buf = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut buf)?;
        Header::decode(&buf, MAX_FILE_SIZE_BYTES)
    }

    pub fn read_message(&mut self) -> io::Result<(Header, Vec<u8>)> {
        let header = self.read_header()?;
        let mut body = vec![0u8; header.body_size as usize];
        self.stream.read_exact(&mut body)?;
        Ok((header, body))
    }

    /// Read one message and assert its command.
    pub fn expect(&mut self, command: Command) -> (Header, Vec<u8>) {
        let (header, body) = self.read_message().expect("read message");
        assert_eq!(header.command, command, "unexpected message: {header:?}");
        (header, body)
    }
}

/// Give the reactor a moment to drain queued events whose effects have no
/// observable message of their own (registration, console redirects).
pub fn settle() {
    std::thread::sleep(Duration::from_millis(150));
}

/// A scratch dir under the system temp dir, unique per test.
pub fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "music-room-it-{tag}-{}-{:?}",
        std::process::id(),
        std::thread::current().id()
    ));
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Write an `.mp3`-named file with `contents` into `dir`.
pub fn mp3_fixture(dir: &std::path::Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path
}
