//! Runtime configuration shared by the host and participant reactors.

use std::path::PathBuf;

use crate::storage::MAX_SONGS;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Directory that receives spooled song files.
    pub temp_dir: PathBuf,
    /// Queue capacity; never above 255 because positions travel in a byte.
    pub max_songs: usize,
    /// Ceiling on message bodies and shared files.
    pub max_file_size: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            max_songs: MAX_SONGS,
            max_file_size: room_proto::MAX_FILE_SIZE_BYTES,
        }
    }
}
