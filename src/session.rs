//! Server session loop
//!
//! One client at a time: the sink is a single device, so a second sender
//! would only fight the first. Each connection walks
//! `Listening → Handshaking → Streaming → Draining → Listening`; anything
//! that goes wrong inside a session sends the server back to `Listening`,
//! except losing the sink itself, which moves it to `Failed` and stops it.

use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::buffer::{JitterBuffer, JitterBufferStats};
use crate::audio::gain::{GainState, SharedGain};
use crate::audio::sink::SharedSinkFactory;
use crate::audio::writer::{SinkWriter, SinkWriterStats};
use crate::config::ServerConfig;
use crate::error::{Error, Result, SinkError};
use crate::network::receiver::{AudioReceiver, ReceiverStats};
use crate::network::socket;
use crate::protocol::{receive_config, SessionConfig};

/// How often the accept loop checks for shutdown
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Listening,
    Handshaking,
    Streaming,
    Draining,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Listening => "listening",
            SessionState::Handshaking => "handshaking",
            SessionState::Streaming => "streaming",
            SessionState::Draining => "draining",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Server state visible from other threads
#[derive(Debug)]
pub struct ServerStatus {
    state: Mutex<SessionState>,
    sessions_completed: AtomicU64,
    sessions_rejected: AtomicU64,
    /// Report of the most recent finished session
    last_report: Mutex<Option<SessionReport>>,
}

impl ServerStatus {
    fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Listening),
            sessions_completed: AtomicU64::new(0),
            sessions_rejected: AtomicU64::new(0),
            last_report: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Sessions that streamed and were torn down
    pub fn sessions_completed(&self) -> u64 {
        self.sessions_completed.load(Ordering::Relaxed)
    }

    /// Connections turned away during the handshake
    pub fn sessions_rejected(&self) -> u64 {
        self.sessions_rejected.load(Ordering::Relaxed)
    }

    pub fn last_report(&self) -> Option<SessionReport> {
        self.last_report.lock().clone()
    }

    fn transition(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state != next {
            tracing::debug!("Session state: {} -> {}", *state, next);
            *state = next;
        }
    }
}

/// Summary of one finished session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub peer: SocketAddr,
    /// Parameters from the client's handshake
    pub config: SessionConfig,
    /// Time from the handshake to the end of the drain
    pub duration: Duration,
    pub receiver: ReceiverStats,
    /// Jitter buffer counters at the end of the session
    pub buffer: JitterBufferStats,
    /// `None` when the writer had to be abandoned during the drain
    pub writer: Option<SinkWriterStats>,
    /// Why the session ended early, if it did
    pub error: Option<String>,
}

impl fmt::Display for SessionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {} frames received in {:.1}s, {} evicted",
            self.peer,
            self.config,
            self.receiver.frames_received,
            self.duration.as_secs_f32(),
            self.buffer.evicted,
        )?;
        match &self.writer {
            Some(w) => write!(f, ", {} written, {} repeated", w.frames_written, w.frames_repeated)?,
            None => write!(f, ", writer abandoned")?,
        }
        if let Some(e) = &self.error {
            write!(f, ", ended by: {}", e)?;
        }
        Ok(())
    }
}

/// Relay server: accepts senders and feeds their audio into the sink
pub struct Server {
    config: ServerConfig,
    /// Non-blocking, so the accept loop can watch for shutdown
    listener: TcpListener,
    /// Opens the sink in each session's writer thread
    factory: SharedSinkFactory,
    /// Volume applied at the sink, shared with every session's writer
    device_gain: SharedGain,
    status: Arc<ServerStatus>,
}

impl Server {
    /// Bind the listener after checking that the sink exists.
    ///
    /// The sink itself is only opened once a client has completed the
    /// handshake, so a pipe nobody reads yet does not block startup.
    pub fn bind(config: ServerConfig, factory: SharedSinkFactory) -> Result<Self> {
        config.validate()?;
        factory.check().map_err(into_fatal)?;
        let listener = socket::bind_listener(config.bind_addr()?, config.recv_buffer_size)?;

        tracing::info!("Listening on {}", listener.local_addr()?);
        Ok(Self {
            device_gain: Arc::new(GainState::new(config.device_volume)),
            config,
            listener,
            factory,
            status: Arc::new(ServerStatus::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn status(&self) -> Arc<ServerStatus> {
        self.status.clone()
    }

    /// Volume applied at the sink; adjustable while streaming
    pub fn device_gain(&self) -> SharedGain {
        self.device_gain.clone()
    }

    /// Serve clients until `shutdown` is set or the sink is lost for good
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            let (stream, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                    continue;
                }
            };

            tracing::info!("Client connected from {}", peer);
            match self.handle_connection(stream, peer, shutdown) {
                Ok(report) => {
                    tracing::info!("Session finished: {}", report);
                    *self.status.last_report.lock() = Some(report);
                    self.status.sessions_completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if e.is_fatal() => {
                    self.status.transition(SessionState::Failed);
                    tracing::error!("Cannot continue: {}", e);
                    return Err(e);
                }
                Err(Error::Handshake(e)) => {
                    self.status.sessions_rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("Rejected {}: {}", peer, e);
                }
                Err(e) => tracing::warn!("Session with {} failed: {}", peer, e),
            }
            self.status.transition(SessionState::Listening);
        }

        tracing::info!("Server stopped");
        Ok(())
    }

    /// Run one session on an accepted connection
    pub fn handle_connection(
        &mut self,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: &AtomicBool,
    ) -> Result<SessionReport> {
        self.status.transition(SessionState::Handshaking);
        socket::tune_accepted(&stream, self.config.recv_buffer_size)?;
        let session = receive_config(&stream, self.config.handshake_timeout())?;
        tracing::info!("Session from {}: {}", peer, session);

        let started = Instant::now();
        let buffer = Arc::new(JitterBuffer::for_quality(session.quality));
        let abort = Arc::new(AtomicBool::new(false));
        let writer = SinkWriter::from_factory(self.factory.clone(), buffer.clone(), session.quality)
            .with_device_gain(self.device_gain.clone())
            .with_abort(abort.clone())
            .spawn()?;

        self.status.transition(SessionState::Streaming);
        stream.set_read_timeout(Some(self.config.read_timeout()))?;
        let mut receiver = AudioReceiver::new(&stream, session.geometry(), buffer.clone());
        // a dead sink ends the session as surely as a dead socket
        let received = receiver.run(|| shutdown.load(Ordering::Relaxed) || writer.is_finished());
        let receiver_stats = receiver.stats().clone();
        let _ = stream.shutdown(Shutdown::Both);

        self.status.transition(SessionState::Draining);
        let mut error = received.err().map(|e| e.to_string());
        let writer_stats = match writer.wait(self.config.drain_timeout()) {
            Some(Ok(stats)) => Some(stats),
            Some(Err(e @ SinkError::ResourceUnavailable(_))) => return Err(e.into()),
            Some(Err(e)) => {
                error.get_or_insert_with(|| e.to_string());
                None
            }
            None => {
                tracing::warn!(
                    "Drain did not finish within {:?}, dropping {} buffered frames",
                    self.config.drain_timeout(),
                    buffer.len()
                );
                abort.store(true, Ordering::Relaxed);
                None
            }
        };

        // the writer released the sink; the next client needs it back
        self.factory.check().map_err(into_fatal)?;

        Ok(SessionReport {
            peer,
            config: session,
            duration: started.elapsed(),
            receiver: receiver_stats,
            buffer: buffer.stats(),
            writer: writer_stats,
            error,
        })
    }
}

fn into_fatal(e: SinkError) -> Error {
    match e {
        SinkError::Disconnected(msg) => SinkError::ResourceUnavailable(msg).into(),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sink::{FileSinkFactory, Sink};
    use crate::error::HandshakeError;
    use std::io::Write;

    #[derive(Clone, Default)]
    struct MemorySink {
        data: Arc<Mutex<Vec<u8>>>,
    }

    impl Sink for MemorySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1".into(),
            port: 0,
            handshake_timeout_ms: 500,
            drain_timeout_ms: 1000,
            ..Default::default()
        }
    }

    fn memory_server(config: ServerConfig) -> (Server, MemorySink, Arc<AtomicU64>) {
        let sink = MemorySink::default();
        let created = Arc::new(AtomicU64::new(0));
        let factory = {
            let sink = sink.clone();
            let created = created.clone();
            move |_: &AtomicBool| -> std::result::Result<Box<dyn Sink>, SinkError> {
                created.fetch_add(1, Ordering::Relaxed);
                Ok(Box::new(sink.clone()))
            }
        };
        let server = Server::bind(config, Arc::new(factory)).unwrap();
        (server, sink, created)
    }

    fn accept(server: &Server) -> (TcpStream, SocketAddr) {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match server.listener.accept() {
                Ok(conn) => return conn,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("accept failed: {}", e),
            }
        }
    }

    #[test]
    fn test_single_session_opens_sink_once() {
        let (mut server, sink, created) = memory_server(test_config());
        let addr = server.local_addr().unwrap();
        assert_eq!(created.load(Ordering::Relaxed), 0);

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"CONFIG:16000:1:64:high_quality\n").unwrap();
        for i in 0..4u8 {
            client.write_all(&[i; 128]).unwrap();
        }
        drop(client);

        let (stream, peer) = accept(&server);
        let report = server
            .handle_connection(stream, peer, &AtomicBool::new(false))
            .unwrap();

        assert_eq!(report.receiver.frames_received, 4);
        assert!(report.error.is_none());
        let writer = report.writer.unwrap();
        assert_eq!(writer.frames_written, 4);
        // underruns between frames are covered by repeats
        let data = sink.data.lock();
        assert_eq!(data.len() as u64, (writer.frames_written + writer.frames_repeated) * 128);
        assert_eq!(&data[..128], &[0u8; 128][..]);
        assert_eq!(created.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_bad_handshake_never_opens_sink() {
        let (mut server, sink, created) = memory_server(test_config());
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"HELLO\n").unwrap();

        let (stream, peer) = accept(&server);
        let result = server.handle_connection(stream, peer, &AtomicBool::new(false));

        assert!(matches!(result, Err(Error::Handshake(HandshakeError::Malformed(_)))));
        assert!(sink.data.lock().is_empty());
        assert_eq!(created.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_missing_sink_path_is_fatal_at_bind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("virtmic");
        let result = Server::bind(test_config(), Arc::new(FileSinkFactory::new(&path)));

        assert!(matches!(
            result,
            Err(Error::Sink(SinkError::ResourceUnavailable(_)))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_sink_lost_during_session_stops_server() {
        let factory = |_: &AtomicBool| -> std::result::Result<Box<dyn Sink>, SinkError> {
            Err(SinkError::ResourceUnavailable("pipe removed".into()))
        };
        let mut server = Server::bind(test_config(), Arc::new(factory)).unwrap();
        let status = server.status();
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"CONFIG:16000:1:64\n").unwrap();
        client.write_all(&[1; 128]).unwrap();

        let shutdown = AtomicBool::new(false);
        let result = server.run(&shutdown);

        assert!(matches!(result, Err(Error::Sink(SinkError::ResourceUnavailable(_)))));
        assert_eq!(status.state(), SessionState::Failed);
        assert_eq!(status.sessions_completed(), 0);
        drop(client);
    }

    #[cfg(unix)]
    #[test]
    fn test_unread_pipe_does_not_block_server() {
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("virtmic");
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);

        let mut config = test_config();
        config.drain_timeout_ms = 200;
        let started = Instant::now();
        let mut server = Server::bind(config, Arc::new(FileSinkFactory::new(&path))).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        let status = server.status();
        let addr = server.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = thread::spawn({
            let shutdown = shutdown.clone();
            move || server.run(&shutdown)
        });

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"CONFIG:16000:1:64:low_latency\n").unwrap();
        for i in 0..10u8 {
            client.write_all(&[i; 128]).unwrap();
        }
        drop(client);

        let deadline = Instant::now() + Duration::from_secs(5);
        while status.sessions_completed() < 1 || status.state() != SessionState::Listening {
            assert!(Instant::now() < deadline, "session never ended");
            thread::sleep(Duration::from_millis(10));
        }
        let report = status.last_report().unwrap();
        assert_eq!(report.receiver.frames_received, 10);
        assert!(report.writer.is_none());

        shutdown.store(true, Ordering::SeqCst);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_device_volume_reaches_sink() {
        let mut config = test_config();
        config.device_volume = 0.5;
        let (mut server, sink, _) = memory_server(config);
        let addr = server.local_addr().unwrap();

        let pcm: Vec<u8> = [2000i16; 64].iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"CONFIG:16000:1:64:low_latency\n").unwrap();
        client.write_all(&pcm).unwrap();
        drop(client);

        let (stream, peer) = accept(&server);
        server
            .handle_connection(stream, peer, &AtomicBool::new(false))
            .unwrap();

        let data = sink.data.lock();
        assert!(!data.is_empty());
        assert!(data
            .chunks_exact(2)
            .all(|b| i16::from_le_bytes([b[0], b[1]]) == 1000));
    }
}
