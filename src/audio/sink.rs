//! Playback sinks
//!
//! A sink accepts a continuous s16le byte stream. On Linux this is usually a
//! named pipe read by a `module-pipe-source` virtual microphone; creating that
//! pipe and registering it with the audio server happens outside this crate.
//! Sinks are opened by the sink writer after the handshake, so waiting for
//! the pipe's reader never holds up the accept loop.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::SinkError;

/// How often an unread pipe is retried
const PIPE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Consumer of the relayed PCM stream
pub trait Sink: Send {
    /// Write some of `buf`, returning how many bytes were accepted
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()>;

    /// Release the underlying resource
    fn close(&mut self) -> io::Result<()> {
        self.flush()
    }
}

/// Produces a fresh sink for each session
pub trait SinkFactory: Send + Sync {
    /// Open the sink, giving up once `cancel` is set
    fn create(&self, cancel: &AtomicBool) -> Result<Box<dyn Sink>, SinkError>;

    /// Check that the sink could be opened, without opening it
    fn check(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<F> SinkFactory for F
where
    F: Fn(&AtomicBool) -> Result<Box<dyn Sink>, SinkError> + Send + Sync,
{
    fn create(&self, cancel: &AtomicBool) -> Result<Box<dyn Sink>, SinkError> {
        self(cancel)
    }
}

/// Factory shared between the server and its sink writers
pub type SharedSinkFactory = Arc<dyn SinkFactory>;

/// What sits at a sink path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathKind {
    Pipe,
    File,
}

fn path_kind(path: &Path) -> Result<PathKind, SinkError> {
    let meta = fs::metadata(path).map_err(|e| unavailable(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if meta.file_type().is_fifo() {
            return Ok(PathKind::Pipe);
        }
    }

    if meta.is_file() {
        Ok(PathKind::File)
    } else {
        Err(SinkError::ResourceUnavailable(format!(
            "{} is neither a pipe nor a regular file",
            path.display()
        )))
    }
}

fn unavailable(path: &Path, e: io::Error) -> SinkError {
    SinkError::ResourceUnavailable(format!("{}: {}", path.display(), e))
}

/// Open the write end of a named pipe once a reader is present.
///
/// A non-blocking open fails with `ENXIO` while nobody reads the pipe, which
/// lets the wait be cancelled. The descriptor is switched back to blocking
/// so a slow reader throttles the writer instead of failing it.
#[cfg(unix)]
fn open_pipe(path: &Path, cancel: &AtomicBool) -> Result<File, SinkError> {
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    let mut announced = false;
    loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => {
                let fd = file.as_raw_fd();
                let ret = unsafe {
                    let flags = libc::fcntl(fd, libc::F_GETFL);
                    if flags < 0 {
                        flags
                    } else {
                        libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK)
                    }
                };
                if ret < 0 {
                    return Err(unavailable(path, io::Error::last_os_error()));
                }
                return Ok(file);
            }
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                if cancel.load(Ordering::Relaxed) {
                    return Err(SinkError::Disconnected(format!(
                        "gave up waiting for a reader on {}",
                        path.display()
                    )));
                }
                if !announced {
                    tracing::info!("Waiting for a reader on {}", path.display());
                    announced = true;
                }
                thread::sleep(PIPE_POLL_INTERVAL);
            }
            Err(e) => return Err(unavailable(path, e)),
        }
    }
}

#[cfg(not(unix))]
fn open_pipe(path: &Path, _cancel: &AtomicBool) -> Result<File, SinkError> {
    Err(SinkError::ResourceUnavailable(format!(
        "{}: named pipes are not supported on this platform",
        path.display()
    )))
}

/// Writes to a named pipe or an existing regular file
pub struct FileSink {
    path: PathBuf,
    /// `None` once closed
    file: Option<File>,
}

impl FileSink {
    /// Open `path` for writing.
    ///
    /// A pipe is opened once something reads it, or the wait is abandoned
    /// when `cancel` is set. A regular file is appended to. Nothing is
    /// created: a missing path is `ResourceUnavailable`.
    pub fn open(path: impl AsRef<Path>, cancel: &AtomicBool) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = match path_kind(&path)? {
            PathKind::Pipe => open_pipe(&path, cancel)?,
            PathKind::File => OpenOptions::new()
                .append(true)
                .open(&path)
                .map_err(|e| unavailable(&path, e))?,
        };
        tracing::debug!("Opened sink {}", path.display());
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "sink closed"))
    }
}

impl Sink for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file()?.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Factory reopening the same path for every session
pub struct FileSinkFactory {
    path: PathBuf,
}

impl FileSinkFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SinkFactory for FileSinkFactory {
    fn create(&self, cancel: &AtomicBool) -> Result<Box<dyn Sink>, SinkError> {
        Ok(Box::new(FileSink::open(&self.path, cancel)?))
    }

    fn check(&self) -> Result<(), SinkError> {
        path_kind(&self.path).map(|_| ())
    }
}

/// Writes to standard output, for piping into a player
pub struct StdoutSink {
    out: io::Stdout,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self { out: io::stdout() }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for StdoutSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.lock().flush()
    }
}

/// Target selected on the command line or in the config file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkTarget {
    Stdout,
    Path(PathBuf),
}

impl SinkTarget {
    /// `-` selects standard output, anything else is a path
    pub fn parse(value: &str) -> Self {
        if value == "-" {
            SinkTarget::Stdout
        } else {
            SinkTarget::Path(PathBuf::from(value))
        }
    }

    /// Build the factory for this target
    pub fn into_factory(self) -> SharedSinkFactory {
        match self {
            SinkTarget::Stdout => Arc::new(|_: &AtomicBool| -> Result<Box<dyn Sink>, SinkError> {
                Ok(Box::new(StdoutSink::new()))
            }),
            SinkTarget::Path(path) => Arc::new(FileSinkFactory::new(path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Instant;

    #[cfg(unix)]
    fn make_fifo(path: &Path) {
        use std::os::unix::ffi::OsStrExt;
        let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pcm");
        File::create(&path).unwrap();
        let cancel = AtomicBool::new(false);

        let factory = FileSinkFactory::new(&path);
        factory.check().unwrap();
        let mut sink = factory.create(&cancel).unwrap();
        assert_eq!(sink.write(&[1, 2, 3, 4]).unwrap(), 4);
        sink.close().unwrap();

        let mut sink = factory.create(&cancel).unwrap();
        sink.write(&[5, 6]).unwrap();
        sink.close().unwrap();

        assert_eq!(fs::read(&path).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_closed_sink_reports_broken_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.pcm");
        File::create(&path).unwrap();

        let mut sink = FileSink::open(&path, &AtomicBool::new(false)).unwrap();
        sink.close().unwrap();
        let err = sink.write(&[0]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_missing_path_is_unavailable_and_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.pipe");
        let factory = FileSinkFactory::new(&path);

        assert!(matches!(factory.check(), Err(SinkError::ResourceUnavailable(_))));
        let result = factory.create(&AtomicBool::new(false));
        assert!(matches!(result, Err(SinkError::ResourceUnavailable(_))));
        assert!(!path.exists());
    }

    #[test]
    fn test_directory_is_not_a_sink() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileSinkFactory::new(dir.path()).check();
        assert!(matches!(result, Err(SinkError::ResourceUnavailable(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_unread_pipe_waits_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.pipe");
        make_fifo(&path);

        let factory = FileSinkFactory::new(&path);
        factory.check().unwrap();

        let cancel = Arc::new(AtomicBool::new(false));
        let opener = thread::spawn({
            let cancel = cancel.clone();
            move || factory.create(&cancel).map(|_| ())
        });

        thread::sleep(Duration::from_millis(200));
        assert!(!opener.is_finished());

        let cancelled_at = Instant::now();
        cancel.store(true, Ordering::Relaxed);
        let result = opener.join().unwrap();
        assert!(matches!(result, Err(SinkError::Disconnected(_))));
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
    }

    #[cfg(unix)]
    #[test]
    fn test_pipe_opens_once_read() {
        use std::os::unix::fs::OpenOptionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mic.pipe");
        make_fifo(&path);

        let mut reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .unwrap();

        let mut sink = FileSink::open(&path, &AtomicBool::new(false)).unwrap();
        sink.write(&[9, 8, 7]).unwrap();
        sink.close().unwrap();

        let mut received = Vec::new();
        reader.read_to_end(&mut received).unwrap();
        assert_eq!(received, vec![9, 8, 7]);
    }

    #[test]
    fn test_sink_target_parse() {
        assert_eq!(SinkTarget::parse("-"), SinkTarget::Stdout);
        assert_eq!(
            SinkTarget::parse("/tmp/mic.pipe"),
            SinkTarget::Path(PathBuf::from("/tmp/mic.pipe"))
        );
    }
}
