//! Wire server for the session coordinator.
//!
//! Each inbound TCP connection gets a dedicated reader thread that decodes
//! framed `Command`s and hands them to the `Coordinator`; a single writer
//! thread owns every connection's write half plus a per-connection outbox,
//! so one slow client can never block delivery to the others. Volatile
//! frames (the `scrollTick` best-effort path) are superseded by a fresher
//! frame of the same kind when the outbox backs up; every other event is
//! queued and retried until delivered or the connection is declared
//! stalled and dropped.
//!
//! Grounded on `imbolc-net/src/server.rs`'s `ClientWriter`/outbox/writer-
//! thread/feedback-channel shape, trimmed of the DAW-specific dirty-flag
//! diffing this domain has no use for.

use std::collections::{HashMap, VecDeque};
use std::io::{self, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{info, warn};

use tempolink_core::{Coordinator, EventSink};
use tempolink_types::{Command, ConnectionId, Event};

use crate::framing::{read_message, serialize_frame};
use crate::protocol::ConnectionWelcome;

/// Whether a queued frame may be superseded by a fresher one of the same
/// kind when the outbox backs up, or must be delivered in order no matter
/// what.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FrameKind {
    Volatile,
    Reliable,
}

impl FrameKind {
    fn of(event: &Event) -> Self {
        if event.is_reliable() {
            FrameKind::Reliable
        } else {
            FrameKind::Volatile
        }
    }
}

struct QueuedFrame {
    data: Arc<Vec<u8>>,
    offset: usize,
    kind: FrameKind,
}

/// Outbox depth past which a connection is declared stalled and dropped.
const MAX_OUTBOX_DEPTH: usize = 64;

/// Per-write timeout; a write that can't complete within this window is
/// treated as a partial write and queued.
const WRITE_TIMEOUT: Duration = Duration::from_millis(20);

struct ClientWriter {
    stream: TcpStream,
    outbox: VecDeque<QueuedFrame>,
}

impl ClientWriter {
    fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        Ok(Self {
            stream,
            outbox: VecDeque::new(),
        })
    }

    fn send_frame(&mut self, data: Arc<Vec<u8>>, kind: FrameKind) -> io::Result<()> {
        if !self.outbox.is_empty() {
            self.queue_frame(data, 0, kind);
            return Ok(());
        }
        match self.stream.write(&data) {
            Ok(n) if n == data.len() => Ok(()),
            Ok(n) => {
                self.queue_frame(data, n, kind);
                Ok(())
            }
            Err(ref e) if is_would_block(e) => {
                self.queue_frame(data, 0, kind);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn queue_frame(&mut self, data: Arc<Vec<u8>>, offset: usize, kind: FrameKind) {
        if kind == FrameKind::Volatile {
            // A fresher scrollTick supersedes any not-yet-started frame of
            // the same kind already waiting.
            self.outbox
                .retain(|f| f.offset > 0 || f.kind != FrameKind::Volatile);
        }
        self.outbox.push_back(QueuedFrame { data, offset, kind });
    }

    fn flush_outbox(&mut self) -> io::Result<()> {
        while let Some(front) = self.outbox.front_mut() {
            match self.stream.write(&front.data[front.offset..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
                Ok(n) => {
                    front.offset += n;
                    if front.offset >= front.data.len() {
                        self.outbox.pop_front();
                    } else {
                        return Ok(());
                    }
                }
                Err(ref e) if is_would_block(e) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn is_stalled(&self) -> bool {
        self.outbox.len() > MAX_OUTBOX_DEPTH
    }
}

fn is_would_block(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Commands sent from accept/reader threads to the writer thread.
enum WriterCommand {
    AddClient {
        connection_id: ConnectionId,
        stream: TcpStream,
    },
    RemoveClient {
        connection_id: ConnectionId,
    },
    SendTo {
        connection_id: ConnectionId,
        frame: Arc<Vec<u8>>,
        kind: FrameKind,
    },
    Shutdown,
}

/// Feedback from the writer thread back to the coordinator: a connection
/// whose outbox overflowed or whose socket errored.
enum WriterFeedback {
    Stalled { connection_id: ConnectionId },
}

fn writer_thread(cmd_rx: Receiver<WriterCommand>, feedback_tx: Sender<WriterFeedback>) {
    let mut writers: HashMap<ConnectionId, ClientWriter> = HashMap::new();

    loop {
        let mut got_command = false;
        loop {
            match cmd_rx.try_recv() {
                Ok(WriterCommand::AddClient {
                    connection_id,
                    stream,
                }) => {
                    got_command = true;
                    match ClientWriter::new(stream) {
                        Ok(writer) => {
                            writers.insert(connection_id, writer);
                        }
                        Err(e) => warn!(target: "net", "failed to register connection: {e}"),
                    }
                }
                Ok(WriterCommand::RemoveClient { connection_id }) => {
                    got_command = true;
                    writers.remove(&connection_id);
                }
                Ok(WriterCommand::SendTo {
                    connection_id,
                    frame,
                    kind,
                }) => {
                    got_command = true;
                    if let Some(writer) = writers.get_mut(&connection_id) {
                        if writer.send_frame(frame, kind).is_err() || writer.is_stalled() {
                            writers.remove(&connection_id);
                            let _ = feedback_tx.send(WriterFeedback::Stalled { connection_id });
                        }
                    }
                }
                Ok(WriterCommand::Shutdown) => return,
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => return,
            }
        }

        let mut stalled = Vec::new();
        for (id, writer) in writers.iter_mut() {
            if !writer.outbox.is_empty() && (writer.flush_outbox().is_err() || writer.is_stalled())
            {
                stalled.push(id.clone());
            }
        }
        for id in stalled {
            writers.remove(&id);
            let _ = feedback_tx.send(WriterFeedback::Stalled { connection_id: id });
        }

        if !got_command {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

/// The `EventSink` implementation the coordinator fans events out through:
/// serializes once per event and routes the shared byte buffer to the
/// writer thread.
struct NetSink {
    writer_tx: Sender<WriterCommand>,
}

impl EventSink for NetSink {
    fn send_to(&self, connection_id: &ConnectionId, event: Event) {
        let kind = FrameKind::of(&event);
        let frame = match serialize_frame(&event) {
            Ok(bytes) => Arc::new(bytes),
            Err(e) => {
                warn!(target: "net", "failed to serialize event: {e}");
                return;
            }
        };
        let _ = self.writer_tx.send(WriterCommand::SendTo {
            connection_id: connection_id.clone(),
            frame,
            kind,
        });
    }

    fn disconnect(&self, connection_id: &ConnectionId) {
        let _ = self.writer_tx.send(WriterCommand::RemoveClient {
            connection_id: connection_id.clone(),
        });
    }
}

/// Tunables the net layer needs that aren't coordinator-internal.
#[derive(Clone, Copy)]
pub struct ServerConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
        }
    }
}

/// Accepts connections and drives a [`Coordinator`] over the framed wire
/// protocol. Owns the writer thread and the accept loop; reader threads
/// are spawned one per connection and left detached (they exit on their
/// own when the peer disconnects).
pub struct CoordinatorServer {
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    writer_tx: Sender<WriterCommand>,
    writer_handle: Option<JoinHandle<()>>,
    feedback_handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    config: ServerConfig,
}

impl CoordinatorServer {
    /// Binds `addr` and constructs the `Coordinator` wired to this
    /// server's writer thread as its `EventSink`. `build_coordinator` lets
    /// the caller supply `Coordinator::new` without this module needing to
    /// know about `Config`.
    pub fn bind(
        addr: &str,
        config: ServerConfig,
        build_coordinator: impl FnOnce(Arc<dyn EventSink>) -> Arc<Coordinator>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        info!(target: "net", "listening on {addr}");

        let (writer_tx, writer_cmd_rx) = mpsc::channel();
        let (feedback_tx, feedback_rx) = mpsc::channel();
        let writer_handle = thread::spawn(move || writer_thread(writer_cmd_rx, feedback_tx));

        let sink: Arc<dyn EventSink> = Arc::new(NetSink {
            writer_tx: writer_tx.clone(),
        });
        let coordinator = build_coordinator(sink);

        let feedback_coordinator = coordinator.clone();
        let feedback_handle = thread::spawn(move || {
            for feedback in feedback_rx {
                let WriterFeedback::Stalled { connection_id } = feedback;
                warn!(target: "net", "connection {connection_id} stalled, disconnecting");
                feedback_coordinator.handle_disconnect(&connection_id);
            }
        });

        Ok(Self {
            listener,
            coordinator,
            writer_tx,
            writer_handle: Some(writer_handle),
            feedback_handle: Some(feedback_handle),
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn coordinator(&self) -> Arc<Coordinator> {
        self.coordinator.clone()
    }

    /// Runs the accept loop on the calling thread until `shutdown` is
    /// called from another thread (or a fatal accept error occurs).
    pub fn serve(&self) {
        let _ = self.listener.set_nonblocking(false);
        for stream in self.listener.incoming() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => self.accept(stream),
                Err(e) => {
                    warn!(target: "net", "accept failed: {e}");
                }
            }
        }
    }

    fn accept(&self, stream: TcpStream) {
        let connection_id = ConnectionId::generate();
        let peer = stream.peer_addr().ok();
        info!(target: "net", "accepted connection {connection_id} ({peer:?})");

        let write_half = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "net", "failed to clone stream for {connection_id}: {e}");
                return;
            }
        };

        if let Err(e) = self.send_welcome(&write_half, &connection_id) {
            warn!(target: "net", "welcome handshake failed for {connection_id}: {e}");
            return;
        }

        let _ = self.writer_tx.send(WriterCommand::AddClient {
            connection_id: connection_id.clone(),
            stream: write_half,
        });

        let coordinator = self.coordinator.clone();
        let writer_tx = self.writer_tx.clone();
        let heartbeat_timeout = self.config.heartbeat_timeout;
        let reader_id = connection_id.clone();
        thread::spawn(move || {
            reader_thread(stream, reader_id, coordinator, writer_tx, heartbeat_timeout);
        });
    }

    fn send_welcome(&self, mut stream: &TcpStream, connection_id: &ConnectionId) -> io::Result<()> {
        crate::framing::write_message(
            &mut stream,
            &ConnectionWelcome {
                connection_id: connection_id.clone(),
            },
        )
    }

    /// Stops the accept loop and every background thread.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.coordinator.shutdown();
        // Unblock the accept loop by connecting to ourselves once.
        if let Ok(addr) = self.listener.local_addr() {
            let _ = TcpStream::connect(addr);
        }
        let _ = self.writer_tx.send(WriterCommand::Shutdown);
    }
}

impl Drop for CoordinatorServer {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.writer_handle.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.feedback_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Per-connection reader loop: decodes framed `Command`s and dispatches
/// them to the coordinator until the peer disconnects or goes idle past
/// the heartbeat timeout.
fn reader_thread(
    stream: TcpStream,
    connection_id: ConnectionId,
    coordinator: Arc<Coordinator>,
    writer_tx: Sender<WriterCommand>,
    heartbeat_timeout: Duration,
) {
    if let Err(e) = stream.set_read_timeout(Some(heartbeat_timeout)) {
        warn!(target: "net", "failed to set read timeout for {connection_id}: {e}");
    }
    let mut reader = BufReader::new(stream);
    let mut last_seen = Instant::now();

    loop {
        match read_message::<_, Command>(&mut reader) {
            Ok(command) => {
                last_seen = Instant::now();
                let should_disconnect = coordinator.handle_command(&connection_id, command);
                if should_disconnect {
                    break;
                }
            }
            Err(ref e) if is_would_block(e) => {
                if last_seen.elapsed() >= heartbeat_timeout {
                    info!(target: "net", "connection {connection_id} timed out");
                    break;
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    warn!(target: "net", "connection {connection_id} read error: {e}");
                }
                break;
            }
        }
    }

    coordinator.handle_disconnect(&connection_id);
    let _ = writer_tx.send(WriterCommand::RemoveClient { connection_id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    use tempolink_core::config::Config;

    fn spawn_test_server() -> (Arc<CoordinatorServer>, JoinHandle<()>) {
        let server = CoordinatorServer::bind("127.0.0.1:0", ServerConfig::default(), |sink| {
            Coordinator::new(&Config::load(), sink)
        })
        .unwrap();
        let server = Arc::new(server);
        let for_thread = server.clone();
        let handle = thread::spawn(move || for_thread.serve());
        thread::sleep(StdDuration::from_millis(20));
        (server, handle)
    }

    #[test]
    fn accept_sends_welcome_with_unique_connection_ids() {
        let (server, handle) = spawn_test_server();
        let addr = server.local_addr().unwrap();

        let mut ids = Vec::new();
        for _ in 0..2 {
            let stream = TcpStream::connect(addr).unwrap();
            let mut reader = BufReader::new(stream);
            let welcome: ConnectionWelcome = read_message(&mut reader).unwrap();
            ids.push(welcome.connection_id);
        }
        assert_ne!(ids[0], ids[1]);

        server.shutdown();
        let _ = handle.join();
    }

    #[test]
    fn join_sends_snapshot_with_the_joining_member() {
        let (server, handle) = spawn_test_server();
        let addr = server.local_addr().unwrap();

        let stream = TcpStream::connect(addr).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let _welcome: ConnectionWelcome = read_message(&mut reader).unwrap();

        let mut writer = stream;
        crate::framing::write_message(
            &mut writer,
            &Command::JoinSession {
                session_id: "t1".to_string().into(),
                display_name: Some("alice".to_string()),
                role: None,
            },
        )
        .unwrap();

        let snapshot: Event = read_message(&mut reader).unwrap();
        match snapshot {
            Event::Snapshot { members, .. } => assert_eq!(members.len(), 1),
            other => panic!("expected Snapshot, got {other:?}"),
        }

        server.shutdown();
        let _ = handle.join();
    }
}
