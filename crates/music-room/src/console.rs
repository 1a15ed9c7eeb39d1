//! The interactive ` >> ` console.
//!
//! One thread reads stdin for the whole process and forwards whole lines on
//! a channel; whichever loop is active (top level, host reactor, client
//! reactor) consumes them. The top-level loop dispatches `make room` /
//! `join room` and returns here when a session ends.

use std::io::{self, BufRead, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use crossbeam_channel::{Receiver, unbounded};

use crate::cli::Args;
use crate::{client, host};

/// Print the input marker without a newline.
pub fn prompt() {
    print!(" >> ");
    let _ = io::stdout().flush();
}

/// Spawn the process-wide stdin reader.
pub fn spawn_stdin_reader() -> Receiver<String> {
    let (tx, rx) = unbounded();
    thread_spawn_stdin(tx);
    rx
}

fn thread_spawn_stdin(tx: crossbeam_channel::Sender<String>) {
    std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        })
        .expect("spawn stdin thread");
}

/// Top-level command loop. Returns when the user exits.
pub fn run(args: &Args) -> Result<()> {
    let stdin_rx = spawn_stdin_reader();

    loop {
        prompt();
        let Ok(line) = stdin_rx.recv() else {
            return Ok(());
        };
        match line.trim() {
            "" => {}
            "exit" => return Ok(()),
            "help" => print_help(),
            "faq" => print_faq(),
            "make room" => {
                if let Err(e) = host_room(args, &stdin_rx) {
                    println!("Error: {e:#}");
                }
            }
            "join room" => {
                if let Err(e) = join_room(args, &stdin_rx) {
                    println!("Error: {e:#}");
                }
            }
            _ => println!("Invalid command. Try 'help' for information"),
        }
    }
}

fn host_room(args: &Args, stdin_rx: &Receiver<String>) -> Result<()> {
    let port = prompt_port(stdin_rx)?;
    let host = prompt_host(stdin_rx)?;

    let listener =
        TcpListener::bind((host.as_str(), port)).with_context(|| format!("bind {host}:{port}"))?;
    println!("Room open on {}", listener.local_addr()?);
    print_session_help();
    prompt();

    let player = Arc::new(room_audio::player::Player::new(
        args.device.clone(),
        args.playback_config(),
    ));
    host::Room::run(listener, player, stdin_rx.clone(), args.session_config())
}

fn join_room(args: &Args, stdin_rx: &Receiver<String>) -> Result<()> {
    let port = prompt_port(stdin_rx)?;
    let host = prompt_host(stdin_rx)?;
    let name = prompt_name(stdin_rx)?;

    let stream =
        TcpStream::connect((host.as_str(), port)).with_context(|| format!("connect {host}:{port}"))?;
    println!("Joined the room at {}", stream.peer_addr()?);
    print_session_help();
    prompt();

    let player = Arc::new(room_audio::player::Player::new(
        args.device.clone(),
        args.playback_config(),
    ));
    client::run(stream, &name, player, stdin_rx.clone(), args.session_config())
}

fn prompt_port(stdin_rx: &Receiver<String>) -> Result<u16> {
    loop {
        println!("Enter a port number:");
        prompt();
        let Ok(line) = stdin_rx.recv() else {
            bail!("input closed");
        };
        match line.trim().parse::<u16>() {
            Ok(port) => return Ok(port),
            Err(_) => println!("Error: not a valid port number"),
        }
    }
}

fn prompt_host(stdin_rx: &Receiver<String>) -> Result<String> {
    loop {
        println!("Enter a host:");
        prompt();
        let Ok(line) = stdin_rx.recv() else {
            bail!("input closed");
        };
        let host = line.trim().to_string();
        if !host.is_empty() {
            return Ok(host);
        }
        println!("Error: not a valid host");
    }
}

fn prompt_name(stdin_rx: &Receiver<String>) -> Result<String> {
    loop {
        println!("Enter your name:");
        prompt();
        let Ok(line) = stdin_rx.recv() else {
            bail!("input closed");
        };
        let name = line.trim().to_string();
        if !name.is_empty() {
            return Ok(name);
        }
        println!("Error: name cannot be empty");
    }
}

pub fn print_help() {
    println!(
        "List of commands:\n\n\
         \t'make room'\t| Prompts for a port and host to listen on. Other people can\n\
         \t\t\t| then join and everyone hears the same songs at the same time.\n\n\
         \t'join room'\t| Prompts for the port and host of a room to join, and a name.\n\
         \t\t\t| Once connected you can queue songs with 'add song' (mp3 only).\n\n\
         \t'help'\t\t| Show this text.\n\
         \t'faq'\t\t| Answers to common questions.\n\
         \t'exit'\t\t| Quit.\n"
    );
}

pub fn print_session_help() {
    println!(
        "In-session commands:\n\
         \t'add song'\t| Queue an mp3 file for everyone in the room.\n\
         \t'mute'\t\t| Silence your own output (you stay in sync).\n\
         \t'unmute'\t| Restore your output.\n\
         \t'help'\t\t| Show this text.\n\
         \t'faq'\t\t| Answers to common questions.\n\
         \t'exit', 'quit'\t| Leave the session.\n"
    );
}

pub fn print_faq() {
    println!(
        "Q: What files can I share?\n\
         A: MP3 files up to 50 MB.\n\n\
         Q: Why did my song start in the middle?\n\
         A: You joined while it was already playing; playback seeks so the\n\
         \x20  whole room stays at the same position.\n\n\
         Q: Does muting pause the song for everyone?\n\
         A: No. Muting only silences your device; the room keeps playing.\n\n\
         Q: Where are received songs stored?\n\
         A: In the system temp directory; they are deleted when the queue\n\
         \x20  entry is removed or the session ends.\n"
    );
}
