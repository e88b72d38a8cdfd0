//! Configuration line exchange
//!
//! The sender opens every session with one ASCII line:
//!
//! ```text
//! CONFIG:<sample_rate>:<channels>:<frame_size>[:<quality>]\n
//! ```
//!
//! The quality field may be omitted by older senders and then defaults to
//! `balanced`. After the newline the stream carries raw frames only.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use super::{Quality, SessionConfig};
use crate::error::HandshakeError;

/// Longest accepted configuration line, newline included
pub const MAX_CONFIG_LINE: usize = 256;

const PREFIX: &str = "CONFIG:";

/// Write the configuration line for `config`
pub fn send_config<W: Write>(writer: &mut W, config: &SessionConfig) -> io::Result<()> {
    writer.write_all(config.to_config_line().as_bytes())?;
    writer.flush()
}

/// Read and validate the configuration line from a freshly accepted stream.
///
/// The whole line must arrive within `timeout`. The stream is read one byte
/// at a time so that no audio following the newline is consumed.
pub fn receive_config(stream: &TcpStream, timeout: Duration) -> Result<SessionConfig, HandshakeError> {
    let mut reader = DeadlineReader {
        stream,
        deadline: Instant::now() + timeout,
    };
    let line = read_config_line(&mut reader, MAX_CONFIG_LINE)?;
    parse_config_line(&line)
}

/// Read bytes up to and including a newline, giving up after `max_len` bytes
pub fn read_config_line<R: Read>(reader: &mut R, max_len: usize) -> Result<String, HandshakeError> {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];

    while line.len() < max_len {
        match reader.read(&mut byte) {
            Ok(0) => {
                return Err(HandshakeError::Malformed(
                    "connection closed before end of configuration line".into(),
                ))
            }
            Ok(_) => {
                if byte[0] == b'\n' {
                    return String::from_utf8(line)
                        .map_err(|_| HandshakeError::Malformed("configuration line is not ASCII".into()));
                }
                line.push(byte[0]);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_timeout(&e) => return Err(HandshakeError::Timeout),
            Err(e) => return Err(HandshakeError::Malformed(format!("read failed: {}", e))),
        }
    }

    Err(HandshakeError::Malformed(format!(
        "no newline within {} bytes",
        max_len
    )))
}

/// Parse a configuration line (trailing newline optional)
pub fn parse_config_line(line: &str) -> Result<SessionConfig, HandshakeError> {
    let line = line.trim();
    if !line.starts_with(PREFIX) {
        return Err(HandshakeError::Malformed("missing CONFIG: prefix".into()));
    }

    let parts: Vec<&str> = line.split(':').collect();
    if parts.len() < 4 {
        return Err(HandshakeError::Malformed(format!(
            "expected at least 4 fields, got {}",
            parts.len()
        )));
    }

    let sample_rate = parse_field::<u32>("sample rate", parts[1])?;
    let channels = parse_field::<u16>("channels", parts[2])?;
    let frame_size = parse_field::<u32>("frame size", parts[3])?;
    let quality = match parts.get(4).map(|q| q.trim()) {
        Some(q) if !q.is_empty() => q.parse::<Quality>()?,
        _ => Quality::default(),
    };

    SessionConfig::new(sample_rate, channels, frame_size, quality)
}

fn parse_field<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, HandshakeError> {
    value
        .trim()
        .parse()
        .map_err(|_| HandshakeError::Malformed(format!("invalid {} '{}'", name, value)))
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Reads from a stream while enforcing an overall deadline
struct DeadlineReader<'a> {
    stream: &'a TcpStream,
    deadline: Instant,
}

impl Read for DeadlineReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::ErrorKind::TimedOut.into());
        }
        self.stream.set_read_timeout(Some(remaining))?;
        let mut stream = self.stream;
        stream.read(buf)
    }
}
