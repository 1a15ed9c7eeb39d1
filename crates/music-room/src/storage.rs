//! The shared MP3 queue (`MusicStorage`).
//!
//! An ordered, length-bounded list of slots. Each slot carries an atomic
//! fan-out counter and a mutex-guarded backing description; the list itself
//! sits behind its own mutex. Lock order is always queue before slot, and the
//! queue lock is never held across file I/O.
//!
//! Slots backed by temp files the store created (paths shaped like
//! `<tmpdir>/musicBroadcaster_XXXXXX`) are deleted when the slot is removed
//! or the store is dropped; slots pointing at the host's own files are left
//! alone.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use rand::distributions::Alphanumeric;
use thiserror::Error;

/// Default queue capacity. Positions travel in the header's `opt` byte, so
/// capacity can never exceed 255.
pub const MAX_SONGS: usize = 10;

/// Prefix of every temp file the store owns.
pub const TEMP_PREFIX: &str = "musicBroadcaster_";

const TEMP_SUFFIX_LEN: usize = 6;

/// Stable identifier for a slot; survives queue reshuffles.
pub type SlotId = u64;

/// What a slot's bytes live in, if anything yet.
#[derive(Debug)]
pub enum Backing {
    /// Reserved; no data has been committed.
    Empty,
    /// A temp file the store owns. `ready` flips once the content is fully
    /// written; until then the slot must not be fed to a player.
    Temp { path: PathBuf, ready: bool },
    /// A file owned by the local user; never deleted by the store.
    Local { path: PathBuf },
}

impl Backing {
    /// Path of fully-committed content, playable right now.
    pub fn ready_path(&self) -> Option<&Path> {
        match self {
            Backing::Temp { path, ready: true } => Some(path),
            Backing::Local { path } => Some(path),
            _ => None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Backing::Temp { path, .. } => Some(path),
            Backing::Local { path } => Some(path),
            Backing::Empty => None,
        }
    }
}

#[derive(Debug)]
pub struct Slot {
    id: SlotId,
    sent: AtomicU32,
    backing: Mutex<Backing>,
}

impl Slot {
    fn new(id: SlotId, backing: Backing) -> Arc<Self> {
        Arc::new(Self {
            id,
            sent: AtomicU32::new(0),
            backing: Mutex::new(backing),
        })
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    /// Deliveries recorded so far; `> 0` means a fan-out ran (or is running).
    pub fn sent(&self) -> u32 {
        self.sent.load(Ordering::Acquire)
    }

    /// Claim the fan-out for this slot. Only the first caller wins; later or
    /// concurrent callers must abort silently.
    pub fn begin_fan_out(&self) -> bool {
        self.sent
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record one successful participant delivery.
    pub fn record_delivery(&self) {
        self.sent.fetch_add(1, Ordering::AcqRel);
    }

    /// The slot lock. Held by whichever worker is mutating the content.
    pub fn lock_backing(&self) -> MutexGuard<'_, Backing> {
        self.backing.lock().unwrap()
    }

    pub fn try_lock_backing(&self) -> Option<MutexGuard<'_, Backing>> {
        self.backing.try_lock().ok()
    }

    /// Snapshot of the playable path, if the content is committed.
    pub fn ready_path_now(&self) -> Option<PathBuf> {
        self.lock_backing().ready_path().map(Path::to_path_buf)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("queue is full")]
    QueueFull,
    #[error("temp file error: {0}")]
    Io(#[from] io::Error),
}

pub struct MusicStorage {
    temp_dir: PathBuf,
    max_songs: usize,
    next_id: AtomicU64,
    songs: Mutex<Vec<Arc<Slot>>>,
}

impl MusicStorage {
    pub fn new(temp_dir: PathBuf, max_songs: usize) -> Self {
        Self {
            temp_dir,
            max_songs: max_songs.min(255),
            next_id: AtomicU64::new(1),
            songs: Mutex::new(Vec::new()),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn len(&self) -> usize {
        self.songs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_songs
    }

    /// Create a fresh empty temp file with a random 6-character suffix.
    pub fn create_temp_file(&self) -> io::Result<PathBuf> {
        for _ in 0..16 {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(TEMP_SUFFIX_LEN)
                .map(char::from)
                .collect();
            let path = self.temp_dir.join(format!("{TEMP_PREFIX}{suffix}"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(path),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "could not find a free temp file name",
        ))
    }

    /// Append a slot backed by a fresh temp file (content not yet ready).
    pub fn reserve_temp(&self) -> Result<Arc<Slot>, StorageError> {
        // File creation happens before the queue lock; the queue lock is
        // never held across I/O.
        if self.is_full() {
            return Err(StorageError::QueueFull);
        }
        let path = self.create_temp_file()?;

        let mut songs = self.songs.lock().unwrap();
        if songs.len() >= self.max_songs {
            drop(songs);
            let _ = fs::remove_file(&path);
            return Err(StorageError::QueueFull);
        }
        let slot = Slot::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            Backing::Temp { path, ready: false },
        );
        songs.push(slot.clone());
        Ok(slot)
    }

    /// Append an empty slot that will point at a local file.
    pub fn reserve_local(&self) -> Result<Arc<Slot>, StorageError> {
        let mut songs = self.songs.lock().unwrap();
        if songs.len() >= self.max_songs {
            return Err(StorageError::QueueFull);
        }
        let slot = Slot::new(self.next_id.fetch_add(1, Ordering::Relaxed), Backing::Empty);
        songs.push(slot.clone());
        Ok(slot)
    }

    /// Slot at position `pos`, growing the queue with empty slots as needed.
    ///
    /// This is how a participant mirrors the position the host assigned.
    pub fn reserve_at(&self, pos: usize) -> Result<Arc<Slot>, StorageError> {
        if pos >= self.max_songs {
            return Err(StorageError::QueueFull);
        }
        let mut songs = self.songs.lock().unwrap();
        while songs.len() <= pos {
            songs.push(Slot::new(
                self.next_id.fetch_add(1, Ordering::Relaxed),
                Backing::Empty,
            ));
        }
        Ok(songs[pos].clone())
    }

    pub fn front(&self) -> Option<Arc<Slot>> {
        self.songs.lock().unwrap().first().cloned()
    }

    /// Pop the head slot, deleting its backing file when owned.
    pub fn remove_front(&self) {
        let slot = {
            let mut songs = self.songs.lock().unwrap();
            if songs.is_empty() {
                return;
            }
            songs.remove(0)
        };
        self.delete_backing(&slot);
    }

    /// Remove the slot with `id`, returning the position it occupied.
    pub fn remove_by_id(&self, id: SlotId) -> Option<usize> {
        let (pos, slot) = {
            let mut songs = self.songs.lock().unwrap();
            let pos = songs.iter().position(|s| s.id == id)?;
            (pos, songs.remove(pos))
        };
        self.delete_backing(&slot);
        Some(pos)
    }

    pub fn remove_by_position(&self, pos: usize) -> bool {
        let slot = {
            let mut songs = self.songs.lock().unwrap();
            if pos >= songs.len() {
                return false;
            }
            songs.remove(pos)
        };
        self.delete_backing(&slot);
        true
    }

    pub fn position_of(&self, id: SlotId) -> Option<usize> {
        self.songs.lock().unwrap().iter().position(|s| s.id == id)
    }

    /// Current slots in queue order; used for newcomer catch-up.
    pub fn snapshot(&self) -> Vec<Arc<Slot>> {
        self.songs.lock().unwrap().clone()
    }

    /// The authoritative "safe to delete" test: inside our temp dir, our
    /// prefix, and a 6-character suffix of `[-A-Za-z0-9._]`.
    pub fn is_owned_temp_path(&self, path: &Path) -> bool {
        if path.parent() != Some(self.temp_dir.as_path()) {
            return false;
        }
        matches_temp_name(path)
    }

    fn delete_backing(&self, slot: &Slot) {
        let guard = slot.lock_backing();
        if let Backing::Temp { path, .. } = &*guard {
            if self.is_owned_temp_path(path) {
                if let Err(e) = fs::remove_file(path) {
                    tracing::warn!(path = ?path, "temp cleanup warning: {e}");
                }
            }
        }
    }
}

impl Drop for MusicStorage {
    fn drop(&mut self) {
        let songs: Vec<Arc<Slot>> = {
            let mut guard = self.songs.lock().unwrap();
            guard.drain(..).collect()
        };
        for slot in songs {
            self.delete_backing(&slot);
        }
    }
}

/// Does the file name look like one of ours, wherever it lives?
fn matches_temp_name(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let Some(suffix) = name.strip_prefix(TEMP_PREFIX) else {
        return false;
    };
    suffix.len() == TEMP_SUFFIX_LEN
        && suffix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
}

/// Remove leftovers from an earlier crash. Returns how many were deleted.
pub fn sweep_stale_temp_files(temp_dir: &Path) -> io::Result<usize> {
    let mut removed = 0usize;
    for entry in fs::read_dir(temp_dir)? {
        let entry = entry?;
        if !matches_temp_name(&entry.path()) {
            continue;
        }
        if fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fresh_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("music-room-storage-{tag}-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn owned_files(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| matches_temp_name(p))
            .collect()
    }

    #[test]
    fn reserve_temp_creates_owned_file() {
        let dir = fresh_dir("create");
        let storage = MusicStorage::new(dir.clone(), 4);
        let slot = storage.reserve_temp().unwrap();
        let path = slot.lock_backing().path().unwrap().to_path_buf();
        assert!(path.exists());
        assert!(storage.is_owned_temp_path(&path));
        drop(storage);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn queue_bounds_are_enforced() {
        let dir = fresh_dir("bounds");
        let storage = MusicStorage::new(dir.clone(), 3);
        for _ in 0..3 {
            storage.reserve_temp().unwrap();
        }
        assert!(storage.is_full());
        assert!(matches!(
            storage.reserve_temp(),
            Err(StorageError::QueueFull)
        ));
        assert!(matches!(
            storage.reserve_local(),
            Err(StorageError::QueueFull)
        ));
        assert!(matches!(
            storage.reserve_at(3),
            Err(StorageError::QueueFull)
        ));
        assert_eq!(storage.len(), 3);
        drop(storage);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn no_temp_files_survive_destruction() {
        let dir = fresh_dir("destroy");
        {
            let storage = MusicStorage::new(dir.clone(), 8);
            for _ in 0..5 {
                storage.reserve_temp().unwrap();
            }
            storage.remove_by_position(1);
            storage.remove_front();
            assert_eq!(owned_files(&dir).len(), 3);
        }
        assert!(owned_files(&dir).is_empty());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn local_backing_is_never_deleted() {
        let dir = fresh_dir("local");
        let own_song = dir.join("mine.mp3");
        fs::write(&own_song, b"not really mp3").unwrap();
        {
            let storage = MusicStorage::new(dir.clone(), 4);
            let slot = storage.reserve_local().unwrap();
            *slot.lock_backing() = Backing::Local {
                path: own_song.clone(),
            };
            storage.remove_front();
        }
        assert!(own_song.exists());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn reserve_at_grows_with_empty_slots() {
        let dir = fresh_dir("grow");
        let storage = MusicStorage::new(dir.clone(), 8);
        let slot = storage.reserve_at(3).unwrap();
        assert_eq!(storage.len(), 4);
        assert_eq!(storage.position_of(slot.id()), Some(3));
        // reserving the same position again returns the same slot
        assert_eq!(storage.reserve_at(3).unwrap().id(), slot.id());
        drop(storage);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn removal_shifts_positions() {
        let dir = fresh_dir("shift");
        let storage = MusicStorage::new(dir.clone(), 8);
        let a = storage.reserve_temp().unwrap();
        let b = storage.reserve_temp().unwrap();
        let c = storage.reserve_temp().unwrap();
        assert_eq!(storage.remove_by_id(b.id()), Some(1));
        assert_eq!(storage.position_of(a.id()), Some(0));
        assert_eq!(storage.position_of(c.id()), Some(1));
        assert_eq!(storage.remove_by_id(b.id()), None);
        drop(storage);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn fan_out_claim_is_exclusive() {
        let dir = fresh_dir("claim");
        let storage = MusicStorage::new(dir.clone(), 4);
        let slot = storage.reserve_temp().unwrap();
        assert!(slot.begin_fan_out());
        assert!(!slot.begin_fan_out());
        slot.record_delivery();
        assert_eq!(slot.sent(), 2);
        drop(storage);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn concurrent_reserve_and_cancel_never_deadlocks() {
        let dir = fresh_dir("churn");
        let storage = Arc::new(MusicStorage::new(dir.clone(), 6));

        let mut workers = Vec::new();
        for _ in 0..4 {
            let storage = storage.clone();
            workers.push(thread::spawn(move || {
                for _ in 0..50 {
                    match storage.reserve_temp() {
                        Ok(slot) => {
                            // simulate a cancelled reservation
                            storage.remove_by_id(slot.id());
                        }
                        Err(StorageError::QueueFull) => {
                            storage.remove_front();
                        }
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }
        drop(storage);
        assert!(owned_files(&dir).is_empty());
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn playback_order_matches_enqueue_order() {
        let dir = fresh_dir("order");
        let storage = MusicStorage::new(dir.clone(), 8);
        let ids: Vec<SlotId> = (0..5)
            .map(|_| storage.reserve_temp().unwrap().id())
            .collect();
        let mut popped = Vec::new();
        while let Some(front) = storage.front() {
            popped.push(front.id());
            storage.remove_front();
        }
        assert_eq!(popped, ids);
        drop(storage);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn foreign_paths_are_not_owned() {
        let dir = fresh_dir("foreign");
        let storage = MusicStorage::new(dir.clone(), 4);
        assert!(!storage.is_owned_temp_path(Path::new("/elsewhere/musicBroadcaster_abc123")));
        assert!(!storage.is_owned_temp_path(&dir.join("other_abc123")));
        assert!(!storage.is_owned_temp_path(&dir.join("musicBroadcaster_toolong1")));
        assert!(storage.is_owned_temp_path(&dir.join("musicBroadcaster_a1B2c3")));
        drop(storage);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn sweep_removes_only_matching_files() {
        let dir = fresh_dir("sweep");
        fs::write(dir.join("musicBroadcaster_stale1"), b"x").unwrap();
        fs::write(dir.join("keepme.mp3"), b"x").unwrap();
        let removed = sweep_stale_temp_files(&dir).unwrap();
        assert_eq!(removed, 1);
        assert!(dir.join("keepme.mp3").exists());
        fs::remove_dir_all(dir).unwrap();
    }
}
