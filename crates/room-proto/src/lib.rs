//! Shared wire-protocol primitives for the listening room.
//!
//! Every message on a room connection is a fixed 6-byte header followed by
//! `body_size` bytes of body:
//!
//! ```text
//! | cmd: u8 | opt: u8 | body_size: u32 LE |
//! |-----------------------------------------|
//! |                  BODY                   |
//! ```
//!
//! `cmd` selects a [`Command`]; `opt` carries a queue position where one is
//! needed (positions are 0-based and fit a byte because the queue is bounded);
//! `body_size` is the exact length of the body that follows.

use std::io::{self, Read};

/// Size of the fixed message header in bytes.
pub const HEADER_LEN: usize = 6;

/// Size of a `PLAY_NEXT` body: the room start time as `i64` LE seconds.
pub const START_TIME_LEN: usize = 8;

/// Default ceiling on `body_size`, and on the audio files users may share.
pub const MAX_FILE_SIZE_BYTES: u32 = 50_000_000;

/// Commands understood by both ends of a room connection.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Client announces itself; the body is its display name (UTF-8).
    Join = 0x01,
    /// Client is leaving the room; graceful counterpart to just closing.
    Leave = 0x02,

    /// Client asks the room to reserve a queue slot for an upload.
    ReqAddToQueue = 0x10,
    /// Client abandons a reservation it was granted.
    CancelReqAddToQueue = 0x11,
    /// Reservation granted; `opt` is the assigned queue position.
    ResAddToQueueOk = 0x12,
    /// Reservation denied (queue full).
    ResAddToQueueNotOk = 0x13,
    /// The slot at position `opt` was removed; drop the local copy.
    RemoveQueueEntry = 0x14,
    /// MP3 bytes for the slot at position `opt`; body is the whole file.
    SongData = 0x15,

    /// Start (or join) playback of the queue head; body is the start time.
    PlayNext = 0x20,
    /// Client acknowledges a completed `SongData` transfer.
    RecvOk = 0x21,

    ResOk = 0x30,
    ResNotOk = 0x31,
    GoodMsg = 0x32,

    /// The peer sent a frame that could not be parsed.
    BadFormat = 0x7E,
    /// The peer sent a well-formed frame that made no sense here.
    BadValues = 0x7F,
}

impl Command {
    pub fn from_u8(b: u8) -> io::Result<Self> {
        let cmd = match b {
            0x01 => Command::Join,
            0x02 => Command::Leave,
            0x10 => Command::ReqAddToQueue,
            0x11 => Command::CancelReqAddToQueue,
            0x12 => Command::ResAddToQueueOk,
            0x13 => Command::ResAddToQueueNotOk,
            0x14 => Command::RemoveQueueEntry,
            0x15 => Command::SongData,
            0x20 => Command::PlayNext,
            0x21 => Command::RecvOk,
            0x30 => Command::ResOk,
            0x31 => Command::ResNotOk,
            0x32 => Command::GoodMsg,
            0x7E => Command::BadFormat,
            0x7F => Command::BadValues,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown command {b:#04x}"),
                ));
            }
        };
        Ok(cmd)
    }
}

/// A parsed message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub option: u8,
    pub body_size: u32,
}

impl Header {
    pub fn new(command: Command, option: u8, body_size: u32) -> Self {
        Self {
            command,
            option,
            body_size,
        }
    }

    /// Header-only message: no option, no body.
    pub fn basic(command: Command) -> Self {
        Self::new(command, 0, 0)
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0] = self.command as u8;
        out[1] = self.option;
        out[2..HEADER_LEN].copy_from_slice(&self.body_size.to_le_bytes());
        out
    }

    /// Parse a header, rejecting unknown commands and bodies above `max_body`.
    pub fn decode(bytes: &[u8; HEADER_LEN], max_body: u32) -> io::Result<Self> {
        let command = Command::from_u8(bytes[0])?;
        let option = bytes[1];
        let body_size = u32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        if body_size > max_body {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("body size {body_size} exceeds ceiling {max_body}"),
            ));
        }
        Ok(Self {
            command,
            option,
            body_size,
        })
    }
}

/// Read and parse one header from `r`.
pub fn read_header(mut r: impl Read, max_body: u32) -> io::Result<Header> {
    let mut buf = [0u8; HEADER_LEN];
    r.read_exact(&mut buf)?;
    Header::decode(&buf, max_body)
}

/// Encode a `PLAY_NEXT` body: wall-clock seconds since the Unix epoch.
pub fn encode_start_time(secs: i64) -> [u8; START_TIME_LEN] {
    secs.to_le_bytes()
}

/// Decode a `PLAY_NEXT` body.
pub fn decode_start_time(body: &[u8]) -> io::Result<i64> {
    let bytes: [u8; START_TIME_LEN] = body
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "short PLAY_NEXT body"))?;
    Ok(i64::from_le_bytes(bytes))
}

/// Encode a `JOIN` body: the client's display name.
pub fn encode_join_name(name: &str) -> Vec<u8> {
    name.as_bytes().to_vec()
}

/// Decode a `JOIN` body. Empty bodies are fine; invalid UTF-8 is not.
pub fn decode_join_name(body: &[u8]) -> io::Result<String> {
    let name = std::str::from_utf8(body)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "join name not utf-8"))?;
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_COMMANDS: [Command; 15] = [
        Command::Join,
        Command::Leave,
        Command::ReqAddToQueue,
        Command::CancelReqAddToQueue,
        Command::ResAddToQueueOk,
        Command::ResAddToQueueNotOk,
        Command::RemoveQueueEntry,
        Command::SongData,
        Command::PlayNext,
        Command::RecvOk,
        Command::ResOk,
        Command::ResNotOk,
        Command::GoodMsg,
        Command::BadFormat,
        Command::BadValues,
    ];

    #[test]
    fn header_roundtrip_all_commands() {
        for (i, cmd) in ALL_COMMANDS.iter().enumerate() {
            let header = Header::new(*cmd, i as u8, (i as u32) * 1000 + 7);
            let decoded = Header::decode(&header.encode(), MAX_FILE_SIZE_BYTES).unwrap();
            assert_eq!(decoded, header);
        }
    }

    #[test]
    fn body_size_is_little_endian() {
        let header = Header::new(Command::SongData, 3, 0x0102_0304);
        let bytes = header.encode();
        assert_eq!(bytes, [0x15, 3, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn decode_rejects_unknown_command() {
        let bytes = [0xFEu8, 0, 0, 0, 0, 0];
        let err = Header::decode(&bytes, MAX_FILE_SIZE_BYTES).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn decode_rejects_oversized_body() {
        let header = Header::new(Command::SongData, 0, MAX_FILE_SIZE_BYTES + 1);
        let err = Header::decode(&header.encode(), MAX_FILE_SIZE_BYTES).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn decode_accepts_body_at_ceiling() {
        let header = Header::new(Command::SongData, 0, MAX_FILE_SIZE_BYTES);
        assert!(Header::decode(&header.encode(), MAX_FILE_SIZE_BYTES).is_ok());
    }

    #[test]
    fn read_header_consumes_exactly_six_bytes() {
        let header = Header::new(Command::RecvOk, 0, 0);
        let mut data = header.encode().to_vec();
        data.extend_from_slice(b"trailing");
        let mut cursor = io::Cursor::new(data);
        let decoded = read_header(&mut cursor, MAX_FILE_SIZE_BYTES).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(cursor.position(), HEADER_LEN as u64);
    }

    #[test]
    fn start_time_roundtrip() {
        for secs in [0i64, 1_680_000_000, -1, i64::MAX] {
            assert_eq!(decode_start_time(&encode_start_time(secs)).unwrap(), secs);
        }
    }

    #[test]
    fn start_time_rejects_short_body() {
        assert!(decode_start_time(&[0u8; 4]).is_err());
    }

    #[test]
    fn join_name_roundtrip() {
        let body = encode_join_name("dj quietstorm");
        assert_eq!(decode_join_name(&body).unwrap(), "dj quietstorm");
        assert_eq!(decode_join_name(&[]).unwrap(), "");
    }

    #[test]
    fn join_name_rejects_invalid_utf8() {
        assert!(decode_join_name(&[0xFF, 0xFE]).is_err());
    }
}
