//! A thin reference client: connects, completes the connection-id
//! handshake, and exposes a blocking `send`/non-blocking `poll_events`
//! pair. Used by integration tests and as the shape a real mobile client
//! would mirror.
//!
//! Grounded on `imbolc-net/src/client.rs`'s `RemoteDispatcher` — background
//! reader thread feeding a channel the foreground drains — trimmed of the
//! ownership/privilege/reconnection-token bookkeeping this domain has no
//! use for.

use std::io::{self, BufReader, BufWriter};
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use log::warn;

use tempolink_types::{Command, ConnectionId, Event};

use crate::framing::{read_message, write_message};
use crate::protocol::ConnectionWelcome;

/// A connected session client. Owns the write half directly; the read
/// half is drained by a background thread into `events`.
pub struct SessionClient {
    connection_id: ConnectionId,
    writer: BufWriter<TcpStream>,
    events: Receiver<Event>,
    disconnected: bool,
}

impl SessionClient {
    /// Connects to `addr` and completes the connection-id handshake.
    pub fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let read_stream = stream.try_clone()?;
        let mut reader = BufReader::new(read_stream);

        let welcome: ConnectionWelcome = read_message(&mut reader)?;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || event_reader_thread(reader, tx));

        Ok(Self {
            connection_id: welcome.connection_id,
            writer: BufWriter::new(stream),
            events: rx,
            disconnected: false,
        })
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Sends one command to the coordinator.
    pub fn send(&mut self, command: Command) -> io::Result<()> {
        write_message(&mut self.writer, &command)
    }

    /// Drains any events received since the last call; never blocks.
    pub fn poll_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    break;
                }
            }
        }
        events
    }

    /// Blocks until the next event arrives or the connection closes.
    pub fn recv_event(&mut self) -> Option<Event> {
        match self.events.recv() {
            Ok(event) => Some(event),
            Err(_) => {
                self.disconnected = true;
                None
            }
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }
}

fn event_reader_thread(mut reader: BufReader<TcpStream>, tx: mpsc::Sender<Event>) {
    loop {
        match read_message::<_, Event>(&mut reader) {
            Ok(event) => {
                if tx.send(event).is_err() {
                    break;
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    warn!(target: "net", "event reader exiting: {e}");
                }
                break;
            }
        }
    }
}
