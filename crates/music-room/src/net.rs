//! Serialized TCP stream endpoint.
//!
//! [`SharedStream`] wraps one blocking `TcpStream` with an independent read
//! half and write half, each behind its own mutex, so the reactor and its
//! workers can share a connection:
//!
//! - reads are serialized by the read mutex (the reactor's gating discipline
//!   additionally guarantees header/body ordering),
//! - [`SharedStream::write_message`] emits header and body under a single
//!   acquisition of the write mutex, making every message atomic with respect
//!   to other writers on the same stream.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Mutex;

use room_proto::{Command, HEADER_LEN, Header};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    /// The socket itself failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// A read returned zero bytes: the peer closed the connection.
    #[error("peer closed the connection")]
    PeerClosed,
    /// The peer sent bytes that do not parse as a frame.
    #[error("bad frame: {0}")]
    BadFrame(String),
}

pub struct SharedStream {
    read: Mutex<TcpStream>,
    write: Mutex<TcpStream>,
    peer: SocketAddr,
}

impl SharedStream {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        let write = stream.try_clone()?;
        Ok(Self {
            read: Mutex::new(stream),
            write: Mutex::new(write),
            peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Fill `buf` completely, looping over short reads.
    pub fn read_exact(&self, buf: &mut [u8]) -> Result<(), NetError> {
        let mut stream = self.read.lock().unwrap();
        read_full(&mut stream, buf)
    }

    /// Read and parse one message header.
    pub fn read_header(&self, max_body: u32) -> Result<Header, NetError> {
        let mut buf = [0u8; HEADER_LEN];
        {
            let mut stream = self.read.lock().unwrap();
            read_full(&mut stream, &mut buf)?;
        }
        Header::decode(&buf, max_body).map_err(|e| NetError::BadFrame(e.to_string()))
    }

    /// Write a whole message; header and body go out under one lock
    /// acquisition so concurrent writers cannot interleave.
    pub fn write_message(
        &self,
        command: Command,
        option: u8,
        body: &[u8],
    ) -> Result<(), NetError> {
        let body_size: u32 = body
            .len()
            .try_into()
            .map_err(|_| NetError::BadFrame("body too large for frame".to_string()))?;
        let header = Header::new(command, option, body_size);
        let mut stream = self.write.lock().unwrap();
        stream.write_all(&header.encode())?;
        if !body.is_empty() {
            stream.write_all(body)?;
        }
        Ok(())
    }

    /// Header-only message with `opt = 0`.
    pub fn send_basic(&self, command: Command) -> Result<(), NetError> {
        self.write_message(command, 0, &[])
    }

    /// Header-only message carrying a queue position in `opt`.
    pub fn send_with_option(&self, command: Command, option: u8) -> Result<(), NetError> {
        self.write_message(command, option, &[])
    }

    /// Shut both directions down; unblocks any thread parked in a read.
    pub fn shutdown(&self) {
        let stream = self.read.lock().unwrap();
        let _ = stream.shutdown(Shutdown::Both);
    }
}

fn read_full(stream: &mut TcpStream, buf: &mut [u8]) -> Result<(), NetError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(NetError::PeerClosed),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(NetError::Transport(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    fn loopback_pair() -> (SharedStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (SharedStream::new(server).unwrap(), client)
    }

    #[test]
    fn read_exact_loops_over_short_reads() {
        let (stream, mut peer) = loopback_pair();
        let writer = thread::spawn(move || {
            peer.write_all(b"hel").unwrap();
            thread::sleep(std::time::Duration::from_millis(10));
            peer.write_all(b"lo").unwrap();
            peer
        });
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        writer.join().unwrap();
    }

    #[test]
    fn zero_byte_read_is_peer_closed() {
        let (stream, peer) = loopback_pair();
        drop(peer);
        let mut buf = [0u8; 1];
        assert!(matches!(
            stream.read_exact(&mut buf),
            Err(NetError::PeerClosed)
        ));
    }

    #[test]
    fn read_header_rejects_unknown_command() {
        let (stream, mut peer) = loopback_pair();
        peer.write_all(&[0xFE, 0, 0, 0, 0, 0]).unwrap();
        assert!(matches!(
            stream.read_header(room_proto::MAX_FILE_SIZE_BYTES),
            Err(NetError::BadFrame(_))
        ));
    }

    #[test]
    fn read_header_rejects_oversized_body() {
        let (stream, mut peer) = loopback_pair();
        let header = Header::new(Command::SongData, 0, 1000);
        peer.write_all(&header.encode()).unwrap();
        assert!(matches!(
            stream.read_header(999),
            Err(NetError::BadFrame(_))
        ));
    }

    #[test]
    fn concurrent_writers_never_interleave_messages() {
        let (stream, peer) = loopback_pair();
        let stream = Arc::new(stream);

        let mut writers = Vec::new();
        for fill in 1u8..=4 {
            let stream = stream.clone();
            writers.push(thread::spawn(move || {
                for round in 0..25 {
                    let body = vec![fill; 10 + (round % 7)];
                    stream
                        .write_message(Command::SongData, fill, &body)
                        .unwrap();
                }
            }));
        }

        let reader = thread::spawn(move || {
            let mut peer = peer;
            for _ in 0..100 {
                let header = room_proto::read_header(&mut peer, 1024).unwrap();
                assert_eq!(header.command, Command::SongData);
                let mut body = vec![0u8; header.body_size as usize];
                peer.read_exact(&mut body).unwrap();
                // every byte of the body must carry the writer's fill value
                assert!(body.iter().all(|b| *b == header.option));
            }
        });

        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
    }
}
