//! Syslog relay: the device's live system log as a byte stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};

use crate::session::{DeviceService, ServiceSession, StartServiceError};

/// Syslog relay result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(i32)]
pub enum SyslogCode {
    /// Bad argument rejected before sending.
    InvalidArg = -1,
    /// Transport or multiplexer failure.
    MuxError = -2,
    /// TLS session failed.
    SslError = -3,
    /// Stream ended before data arrived.
    NotEnoughData = -4,
    /// No data within the timeout.
    Timeout = -5,
    /// Device error with no known mapping.
    UnknownError = -256,
}

/// Errors from the syslog relay.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SyslogError {
    /// A caller-supplied argument was rejected, or the call conflicts with a running capture.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// No data arrived in time.
    #[error("timed out")]
    Timeout,

    /// The device closed the stream.
    #[error("log stream ended")]
    NotEnoughData,

    /// The connection failed.
    #[error(transparent)]
    Transport(crate::Error),

    /// The service could not be started.
    #[error(transparent)]
    Start(#[from] StartServiceError),
}

impl SyslogError {
    /// Numeric code in the syslog relay taxonomy.
    pub const fn code(&self) -> SyslogCode {
        match self {
            Self::InvalidArg(_) => SyslogCode::InvalidArg,
            Self::Timeout => SyslogCode::Timeout,
            Self::NotEnoughData => SyslogCode::NotEnoughData,
            Self::Transport(crate::Error::Ssl(_)) | Self::Start(StartServiceError::Tls { .. }) => {
                SyslogCode::SslError
            }
            Self::Transport(_) | Self::Start(_) => SyslogCode::MuxError,
        }
    }
}

impl From<crate::Error> for SyslogError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Timeout => Self::Timeout,
            crate::Error::EndOfStream => Self::NotEnoughData,
            crate::Error::InvalidArg(msg) => Self::InvalidArg(msg),
            other => Self::Transport(other),
        }
    }
}

/// Three-letter month names that open a record header.
const MONTHS: [&str; 12] = [
    "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
];

/// One parsed syslog record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct LogRecord {
    /// `MMM dd HH:MM:SS` as sent; empty for text before the first header.
    pub timestamp: String,
    /// Device name.
    pub device: String,
    /// Process name, possibly with a `(subsystem)` suffix.
    pub process: String,
    /// Process id.
    pub pid: Option<u32>,
    /// Level such as `Notice` or `Error`.
    pub level: Option<String>,
    /// Message text; continuation lines are joined with `\n`.
    pub message: String,
}

impl LogRecord {
    /// Parses a header line, returning `None` for continuation lines.
    pub fn parse(line: &str) -> Option<Self> {
        let mut rest = line;
        let month = next_field(&mut rest)?;
        let day = next_field(&mut rest)?;
        let time = next_field(&mut rest)?;
        let device = next_field(&mut rest)?;
        let process_token = next_field(&mut rest)?;

        if !MONTHS.contains(&month)
            || day.len() > 2
            || !day.bytes().all(|b| b.is_ascii_digit())
            || !is_clock(time)
        {
            return None;
        }

        let process_token = process_token.strip_suffix(':').unwrap_or(process_token);
        let (process, pid) = match process_token.rfind('[') {
            Some(open) if process_token.ends_with(']') => (
                &process_token[..open],
                process_token[open + 1..process_token.len() - 1].parse().ok(),
            ),
            _ => (process_token, None),
        };

        let mut message = rest.strip_prefix(' ').unwrap_or(rest);
        let mut level = None;
        if let Some(inner) = message.strip_prefix('<')
            && let Some(close) = inner.find(">:")
        {
            level = Some(inner[..close].to_owned());
            message = inner[close + 2..].trim_start_matches(' ');
        }

        Some(Self {
            timestamp: format!("{month} {day:>2} {time}"),
            device: device.to_owned(),
            process: process.to_owned(),
            pid,
            level,
            message: message.to_owned(),
        })
    }
}

/// Splits the next space-separated field off `rest`.
fn next_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start_matches(' ');
    let end = trimmed.find(' ').unwrap_or(trimmed.len());
    let (token, tail) = trimmed.split_at(end);
    *rest = tail;
    (!token.is_empty()).then_some(token)
}

/// Whether `s` looks like `HH:MM:SS`.
fn is_clock(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 8
        && b[2] == b':'
        && b[5] == b':'
        && [0, 1, 3, 4, 6, 7].iter().all(|&i| b[i].is_ascii_digit())
}

/// Turns a byte stream into records.
///
/// A record is emitted once the next header arrives (or on
/// [`finish`](Self::finish)), so continuation lines can be folded in.
#[derive(Debug, Default)]
pub struct LineAssembler {
    /// Bytes of an unterminated line.
    partial: Vec<u8>,
    /// Record still collecting continuation lines.
    pending: Option<LogRecord>,
}

impl LineAssembler {
    /// New assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes and returns the records they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<LogRecord> {
        let mut done = Vec::new();
        for &b in bytes {
            match b {
                b'\n' => {
                    let line = std::mem::take(&mut self.partial);
                    self.line(&String::from_utf8_lossy(&line), &mut done);
                }
                0 => {}
                _ => self.partial.push(b),
            }
        }
        done
    }

    /// Flushes the unterminated line and the record still collecting.
    pub fn finish(&mut self) -> Vec<LogRecord> {
        let mut done = Vec::new();
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.line(&String::from_utf8_lossy(&line), &mut done);
        }
        done.extend(self.pending.take());
        done
    }

    /// Handles one complete line.
    fn line(&mut self, line: &str, done: &mut Vec<LogRecord>) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(record) = LogRecord::parse(line) {
            done.extend(self.pending.replace(record));
            return;
        }
        match &mut self.pending {
            Some(record) => {
                record.message.push('\n');
                record.message.push_str(line);
            }
            None if line.is_empty() => {}
            None => {
                self.pending = Some(LogRecord {
                    message: line.to_owned(),
                    ..LogRecord::default()
                });
            }
        }
    }
}

/// Consumer of captured bytes.
trait Sink: Send + 'static {
    /// Handles one received chunk.
    fn data(&mut self, chunk: &[u8]);
    /// Runs once after the reader stops.
    fn end(&mut self) {}
}

/// Passes bytes through.
struct Raw<F>(F);

impl<F: FnMut(&[u8]) + Send + 'static> Sink for Raw<F> {
    fn data(&mut self, chunk: &[u8]) {
        (self.0)(chunk);
    }
}

/// Drops the NUL separators between messages.
struct Text<F>(F);

impl<F: FnMut(&[u8]) + Send + 'static> Sink for Text<F> {
    fn data(&mut self, chunk: &[u8]) {
        let text: Vec<u8> = chunk.iter().copied().filter(|&b| b != 0).collect();
        if !text.is_empty() {
            (self.0)(&text);
        }
    }
}

/// Assembles records.
struct Lines<F> {
    on_record: F,
    assembler: LineAssembler,
}

impl<F: FnMut(LogRecord) + Send + 'static> Sink for Lines<F> {
    fn data(&mut self, chunk: &[u8]) {
        for record in self.assembler.push(chunk) {
            (self.on_record)(record);
        }
    }

    fn end(&mut self) {
        for record in self.assembler.finish() {
            (self.on_record)(record);
        }
    }
}

/// Background reader state.
#[derive(Debug)]
struct Capture {
    /// Stops the reader.
    cancel: Arc<AtomicBool>,
    /// Reader thread.
    thread: JoinHandle<()>,
}

/// Syslog relay client.
#[derive(Debug)]
pub struct SyslogRelay {
    /// Session shared with the capture thread.
    session: Arc<Mutex<ServiceSession>>,
    /// Running capture, if any.
    capture: Option<Capture>,
}

impl DeviceService for SyslogRelay {
    const SERVICE_NAME: &'static str = "com.apple.syslog_relay";
    type Error = SyslogError;

    fn from_session(session: ServiceSession) -> Result<Self, SyslogError> {
        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            capture: None,
        })
    }
}

/// Locks a shared session.
fn lock(session: &Mutex<ServiceSession>) -> MutexGuard<'_, ServiceSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyslogRelay {
    /// Reads raw log bytes, waiting at most `timeout`.
    pub fn receive(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, SyslogError> {
        if self.capture.is_some() {
            return Err(SyslogError::InvalidArg("capture is running"));
        }
        if buf.is_empty() {
            return Err(SyslogError::InvalidArg("empty buffer"));
        }
        Ok(lock(&self.session).receive(buf, timeout)?)
    }

    /// Starts a background reader delivering raw bytes, NULs included.
    pub fn start_capture_raw(
        &mut self,
        on_data: impl FnMut(&[u8]) + Send + 'static,
    ) -> Result<(), SyslogError> {
        self.spawn(Raw(on_data))
    }

    /// Starts a background reader delivering log text with NUL separators removed.
    pub fn start_capture(
        &mut self,
        on_data: impl FnMut(&[u8]) + Send + 'static,
    ) -> Result<(), SyslogError> {
        self.spawn(Text(on_data))
    }

    /// Starts a background reader delivering parsed records.
    ///
    /// The record being assembled when the capture stops is delivered last.
    pub fn start_capture_lines(
        &mut self,
        on_record: impl FnMut(LogRecord) + Send + 'static,
    ) -> Result<(), SyslogError> {
        self.spawn(Lines {
            on_record,
            assembler: LineAssembler::new(),
        })
    }

    /// Runs the reader thread feeding `sink`.
    fn spawn(&mut self, mut sink: impl Sink) -> Result<(), SyslogError> {
        if self.capture.is_some() {
            return Err(SyslogError::InvalidArg("capture already running"));
        }
        let session = Arc::clone(&self.session);
        let poll = lock(&session).options().poll_interval;
        let cancel = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&cancel);

        let thread = thread::Builder::new()
            .name("syslog-relay".into())
            .spawn(move || {
                let mut buf = vec![0u8; 4096];
                while !stop.load(Ordering::Acquire) {
                    let received = lock(&session).receive(&mut buf, Some(poll));
                    match received {
                        Ok(n) => {
                            trace!(bytes = n, "syslog data");
                            sink.data(&buf[..n]);
                        }
                        Err(crate::Error::Timeout) => {}
                        Err(e) => {
                            debug!(error = %e, "syslog capture ended");
                            break;
                        }
                    }
                }
                sink.end();
            })
            .map_err(|e| SyslogError::Transport(e.into()))?;

        self.capture = Some(Capture { cancel, thread });
        Ok(())
    }

    /// Whether a capture is running.
    pub const fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Stops the background reader and waits for it.
    pub fn stop_capture(&mut self) -> Result<(), SyslogError> {
        let capture = self
            .capture
            .take()
            .ok_or(SyslogError::InvalidArg("no capture running"))?;
        capture.cancel.store(true, Ordering::Release);
        if capture.thread.join().is_err() {
            debug!("syslog callback panicked");
        }
        Ok(())
    }

    /// Stops any capture and closes the session. Safe to call repeatedly.
    pub fn close(&mut self) -> Result<(), SyslogError> {
        if self.capture.is_some() {
            self.stop_capture()?;
        }
        Ok(lock(&self.session).close()?)
    }
}

impl Drop for SyslogRelay {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(error = %e, "closing syslog relay on drop");
        }
    }
}
