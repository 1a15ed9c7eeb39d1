//! Validation and loading of user-supplied MP3 files.
//!
//! The room only ever ships whole files, so validation is deliberately
//! shallow: the extension must be `.mp3` (any case), the file must exist,
//! must not be empty, and must fit under the configured size cap. Decoding
//! problems surface later in the playback engine.

use std::fs;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("not a valid mp3 file")]
    NotMp3,
    #[error("unable to open file: {0}")]
    Unreadable(#[from] std::io::Error),
    #[error("file is empty")]
    Empty,
    #[error("file too big; max size is {0} bytes")]
    TooLarge(u32),
}

/// Check `path` without reading the content. Returns the file size.
pub fn validate_mp3(path: &Path, max_file_size: u32) -> Result<u64, MediaError> {
    let is_mp3 = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("mp3"))
        .unwrap_or(false);
    if !is_mp3 {
        return Err(MediaError::NotMp3);
    }

    let len = fs::metadata(path)?.len();
    if len == 0 {
        return Err(MediaError::Empty);
    }
    if len > max_file_size as u64 {
        return Err(MediaError::TooLarge(max_file_size));
    }
    Ok(len)
}

/// Validate and read the whole file.
pub fn load_mp3(path: &Path, max_file_size: u32) -> Result<Vec<u8>, MediaError> {
    validate_mp3(path, max_file_size)?;
    Ok(fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scratch_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("music-room-media-{}-{name}", std::process::id()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn rejects_wrong_extension() {
        let path = scratch_file("notes.txt", b"hello");
        assert!(matches!(
            validate_mp3(&path, 1024),
            Err(MediaError::NotMp3)
        ));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn accepts_uppercase_extension() {
        let path = scratch_file("SONG.MP3", b"data");
        assert_eq!(validate_mp3(&path, 1024).unwrap(), 4);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_empty_file() {
        let path = scratch_file("empty.mp3", b"");
        assert!(matches!(validate_mp3(&path, 1024), Err(MediaError::Empty)));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_oversized_file() {
        let path = scratch_file("big.mp3", &[0u8; 32]);
        assert!(matches!(
            validate_mp3(&path, 16),
            Err(MediaError::TooLarge(16))
        ));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn rejects_missing_file() {
        let path = std::env::temp_dir().join("music-room-media-definitely-missing.mp3");
        assert!(matches!(
            validate_mp3(&path, 1024),
            Err(MediaError::Unreadable(_))
        ));
    }

    #[test]
    fn load_returns_bytes() {
        let path = scratch_file("ok.mp3", b"mp3 bytes");
        assert_eq!(load_mp3(&path, 1024).unwrap(), b"mp3 bytes");
        fs::remove_file(path).unwrap();
    }
}
