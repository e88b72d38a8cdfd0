//! Loopback tests of the full sender → server → sink path

use parking_lot::Mutex;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mic_relay::audio::gain::GainState;
use mic_relay::audio::sink::Sink;
use mic_relay::audio::ToneSource;
use mic_relay::config::{ClientConfig, ServerConfig};
use mic_relay::error::SinkError;
use mic_relay::network::stream_to_server;
use mic_relay::protocol::{Quality, SessionConfig};
use mic_relay::session::{Server, ServerStatus, SessionState};

type Writes = Arc<Mutex<Vec<Vec<u8>>>>;

/// Records each write call separately
struct MemorySink {
    writes: Writes,
    /// Pause for 50 ms on every n-th write
    stall_every: Option<usize>,
    count: usize,
}

impl Sink for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.count += 1;
        if let Some(n) = self.stall_every {
            if self.count % n == 0 {
                thread::sleep(Duration::from_millis(50));
            }
        }
        self.writes.lock().push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct TestServer {
    addr: SocketAddr,
    status: Arc<ServerStatus>,
    writes: Writes,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<mic_relay::Result<()>>>,
}

impl TestServer {
    fn start() -> Self {
        Self::start_with_stalls(None)
    }

    fn start_with_stalls(stall_every: Option<usize>) -> Self {
        let config = ServerConfig {
            bind_address: "127.0.0.1".into(),
            port: 0,
            handshake_timeout_ms: 1000,
            ..Default::default()
        };
        let writes: Writes = Arc::default();
        let factory = {
            let writes = writes.clone();
            move |_: &AtomicBool| -> Result<Box<dyn Sink>, SinkError> {
                Ok(Box::new(MemorySink {
                    writes: writes.clone(),
                    stall_every,
                    count: 0,
                }))
            }
        };

        let mut server = Server::bind(config, Arc::new(factory)).unwrap();
        let addr = server.local_addr().unwrap();
        let status = server.status();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = thread::spawn({
            let shutdown = shutdown.clone();
            move || server.run(&shutdown)
        });

        Self {
            addr,
            status,
            writes,
            shutdown,
            handle: Some(handle),
        }
    }

    fn wait_for(&self, what: &str, cond: impl Fn(&ServerStatus) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond(&self.status) {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap().unwrap();
        }
    }
}

fn constant_frame(value: i16, samples: usize) -> Vec<u8> {
    std::iter::repeat(value)
        .take(samples)
        .flat_map(|s| s.to_le_bytes())
        .collect()
}

/// Send `count` constant frames numbered from zero at the session's real-time rate
fn stream_paced(client: &mut TcpStream, session: &SessionConfig, count: u32) {
    let samples = session.frame_size as usize * session.channels as usize;
    let period = session.frame_duration();
    let start = Instant::now();
    for i in 0..count {
        client.write_all(&constant_frame(i as i16, samples)).unwrap();
        let next = start + period * (i + 1);
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }
}

/// The distinct frames written to the sink, with repeats collapsed
fn distinct_values(writes: &[Vec<u8>]) -> Vec<i16> {
    let mut values: Vec<i16> = Vec::new();
    for w in writes {
        let first = i16::from_le_bytes([w[0], w[1]]);
        assert!(w.chunks_exact(2).all(|b| i16::from_le_bytes([b[0], b[1]]) == first));
        if values.last() != Some(&first) {
            values.push(first);
        }
    }
    values
}

#[test]
fn test_low_latency_stream_reaches_sink_in_order() {
    let server = TestServer::start();
    let session = SessionConfig::new(44100, 1, 128, Quality::LowLatency).unwrap();

    let mut client = TcpStream::connect(server.addr).unwrap();
    client.set_nodelay(true).unwrap();
    client.write_all(b"CONFIG:44100:1:128:low_latency\n").unwrap();

    stream_paced(&mut client, &session, 500);
    drop(client);

    server.wait_for("session end", |s| s.sessions_completed() == 1);
    let report = server.status.last_report().unwrap();
    let writes = server.writes.lock().clone();
    server.stop();

    assert!(writes.iter().all(|w| w.len() == 256));
    let values = distinct_values(&writes);
    assert!(values.windows(2).all(|w| w[0] < w[1]), "frames out of order");
    assert_eq!(values.last(), Some(&499));

    // every frame is either written or evicted
    assert_eq!(report.receiver.frames_received, 500);
    let evicted = report.receiver.frames_evicted;
    assert_eq!(values.len() as u64, 500 - evicted);
    assert_eq!(report.writer.unwrap().frames_written, 500 - evicted);
}

#[test]
fn test_stalled_sink_evicts_oldest_and_keeps_order() {
    let server = TestServer::start_with_stalls(Some(100));
    let session = SessionConfig::new(44100, 1, 128, Quality::LowLatency).unwrap();

    let mut client = TcpStream::connect(server.addr).unwrap();
    client.set_nodelay(true).unwrap();
    client.write_all(b"CONFIG:44100:1:128:low_latency\n").unwrap();
    stream_paced(&mut client, &session, 500);
    drop(client);

    server.wait_for("session end", |s| s.sessions_completed() == 1);
    let report = server.status.last_report().unwrap();
    let writes = server.writes.lock().clone();
    server.stop();

    let values = distinct_values(&writes);
    assert!(values.windows(2).all(|w| w[0] < w[1]), "frames out of order");
    assert_eq!(values.last(), Some(&499));

    // a 50 ms stall outlasts the whole low-latency buffer
    let evicted = report.receiver.frames_evicted;
    assert!(evicted > 0);
    assert_eq!(report.receiver.frames_received, 500);
    assert_eq!(values.len() as u64, 500 - evicted);
    let writer = report.writer.unwrap();
    assert_eq!(writer.frames_written, 500 - evicted);
    assert_eq!(report.buffer.evicted as u64, evicted);
}

#[test]
fn test_malformed_handshake_then_valid_session() {
    let server = TestServer::start();

    let mut bad = TcpStream::connect(server.addr).unwrap();
    bad.write_all(b"CONFIG:44100:1\n").unwrap();
    server.wait_for("first rejection", |s| s.sessions_rejected() == 1);
    drop(bad);

    // no newline within the line cap
    let mut flood = TcpStream::connect(server.addr).unwrap();
    flood.write_all(&[b'A'; 300]).unwrap();
    server.wait_for("second rejection", |s| s.sessions_rejected() == 2);
    drop(flood);

    let mut good = TcpStream::connect(server.addr).unwrap();
    good.write_all(b"CONFIG:16000:1:64:high_quality\n").unwrap();
    for i in 1..=5 {
        good.write_all(&constant_frame(i, 64)).unwrap();
    }
    drop(good);

    server.wait_for("session end", |s| s.sessions_completed() == 1);
    let writes = server.writes.lock().clone();
    server.stop();

    assert_eq!(distinct_values(&writes), vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_disconnect_mid_frame_delivers_padded_frame() {
    let server = TestServer::start();

    let mut client = TcpStream::connect(server.addr).unwrap();
    client.write_all(b"CONFIG:44100:1:128:balanced\n").unwrap();
    client.write_all(&[0x11; 100]).unwrap();
    drop(client);

    server.wait_for("session end", |s| s.sessions_completed() == 1);
    server.wait_for("listening", |s| s.state() == SessionState::Listening);
    let writes = server.writes.lock().clone();

    let mut expected = vec![0x11u8; 100];
    expected.resize(256, 0);
    assert!(!writes.is_empty());
    assert!(writes.iter().all(|w| *w == expected));

    // the server accepts the next client
    let mut next = TcpStream::connect(server.addr).unwrap();
    next.write_all(b"CONFIG:44100:1:128\n").unwrap();
    next.write_all(&constant_frame(3, 128)).unwrap();
    drop(next);
    server.wait_for("second session", |s| s.sessions_completed() == 2);
    server.stop();
}

#[test]
fn test_sender_streams_tone_to_server() {
    let server = TestServer::start();
    let client = ClientConfig {
        host: "127.0.0.1".into(),
        port: server.addr.port(),
        sample_rate: 16000,
        frame_size: 160,
        quality: Quality::Balanced,
        ..Default::default()
    };
    let session = client.session_config().unwrap();

    let shutdown = Arc::new(AtomicBool::new(false));
    let sender = thread::spawn({
        let shutdown = shutdown.clone();
        let client = client.clone();
        move || {
            let tone = ToneSource::new(&session, 440.0);
            stream_to_server(&client, tone, Arc::new(GainState::default()), &shutdown)
        }
    });

    server.wait_for("streaming", |s| s.state() == SessionState::Streaming);
    thread::sleep(Duration::from_millis(300));
    shutdown.store(true, Ordering::SeqCst);
    let stats = sender.join().unwrap().unwrap();
    assert!(stats.frames_sent > 0);

    server.wait_for("session end", |s| s.sessions_completed() == 1);
    let writes = server.writes.lock().clone();
    server.stop();

    assert!(!writes.is_empty());
    assert!(writes.iter().all(|w| w.len() == 320));
}
