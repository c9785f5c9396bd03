//! Device connections: raw and framed I/O, receive timeouts, TLS upgrade.

mod socket;
mod tls;

use std::fmt;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use mobdev_proto::afc::{self, Packet};
use mobdev_proto::codec::{self, Format};
use plist::{Dictionary, Value};
use rustls::{ClientConnection, StreamOwned};
use tracing::{debug, trace, warn};

pub use socket::{Closer, Socket};
pub use tls::TlsIdentity;

use crate::error::from_io;
use crate::{Error, Result};

/// Upper bound on the TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shortest timeout handed to the socket; zero means "block" to the OS.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// The byte stream under a connection, plain or TLS-wrapped.
enum Stream {
    /// Plaintext socket.
    Plain(Box<dyn Socket>),
    /// TLS session over the socket.
    Tls(Box<StreamOwned<ClientConnection, Box<dyn Socket>>>),
}

impl Stream {
    fn socket(&self) -> &dyn Socket {
        match self {
            Self::Plain(sock) => sock.as_ref(),
            Self::Tls(tls) => tls.sock.as_ref(),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(sock) => sock.read(buf),
            Self::Tls(tls) => tls.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(sock) => sock.write(buf),
            Self::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(sock) => sock.flush(),
            Self::Tls(tls) => tls.flush(),
        }
    }
}

/// An exclusively owned byte stream to one port on one device.
///
/// Framed reads ([`receive_plist`](Self::receive_plist),
/// [`receive_packet`](Self::receive_packet)) buffer partial frames across
/// timeouts, so a timed-out call can be retried without losing bytes.
/// [`pending_len`](Self::pending_len) reports what is buffered.
///
/// After [`disconnect`](Self::disconnect) every operation fails with
/// [`Error::Closed`]; disconnecting again is a no-op.
pub struct Connection {
    /// UDID of the device on the other end.
    udid: String,
    /// Destination port on the device.
    port: u16,
    /// `None` once disconnected.
    stream: Option<Stream>,
    /// Bytes received but not yet consumed by a framed read.
    pending: Vec<u8>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("udid", &self.udid)
            .field("port", &self.port)
            .field("connected", &self.is_connected())
            .field("tls", &self.is_tls())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Connection {
    /// Wraps an already-connected socket.
    pub fn from_socket(udid: impl Into<String>, port: u16, socket: Box<dyn Socket>) -> Self {
        Self {
            udid: udid.into(),
            port,
            stream: Some(Stream::Plain(socket)),
            pending: Vec::new(),
        }
    }

    /// Relabels a tunnel once it reaches its device port.
    pub(crate) fn retarget(mut self, udid: &str, port: u16) -> Self {
        udid.clone_into(&mut self.udid);
        self.port = port;
        self
    }

    /// UDID of the device.
    pub fn udid(&self) -> &str {
        &self.udid
    }

    /// Destination port.
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Whether the connection is still open.
    pub const fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether TLS is active.
    pub const fn is_tls(&self) -> bool {
        matches!(self.stream, Some(Stream::Tls(_)))
    }

    /// Bytes of a partially received frame still buffered.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn stream(&mut self) -> Result<&mut Stream> {
        self.stream.as_mut().ok_or(Error::Closed)
    }

    /// Sends up to `buf.len()` bytes, returning how many were accepted.
    pub fn send(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Err(Error::InvalidArg("empty send buffer"));
        }
        let stream = self.stream()?;
        let sent = stream.write(buf).map_err(from_io)?;
        stream.flush().map_err(from_io)?;
        Ok(sent)
    }

    /// Sends all of `buf`, looping over partial sends.
    pub fn send_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.send(buf)? {
                0 => return Err(Error::EndOfStream),
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    /// Single read bounded by `timeout` (`None` blocks).
    fn read_once(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let stream = self.stream()?;
        stream
            .socket()
            .set_read_timeout(timeout.map(|t| t.max(MIN_TIMEOUT)))
            .map_err(from_io)?;
        match stream.read(buf).map_err(from_io)? {
            0 => Err(Error::EndOfStream),
            n => Ok(n),
        }
    }

    /// Receives up to `buf.len()` bytes.
    ///
    /// Returns as soon as any data is available. Fails with
    /// [`Error::Timeout`] if nothing arrives within `timeout` and with
    /// [`Error::EndOfStream`] if the peer closed the stream.
    pub fn receive(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if buf.is_empty() {
            return Err(Error::InvalidArg("empty receive buffer"));
        }
        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(n);
        }
        self.read_once(buf, timeout)
    }

    /// Buffers until at least `want` bytes are pending.
    fn fill(&mut self, want: usize, deadline: Option<Instant>) -> Result<()> {
        while self.pending.len() < want {
            let timeout = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(Error::Timeout);
                    }
                    Some(left)
                }
                None => None,
            };
            let mut chunk = vec![0u8; want - self.pending.len()];
            let n = self.read_once(&mut chunk, timeout)?;
            self.pending.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    /// Receives one frame: a fixed-size header whose contents give the
    /// total frame length (header included).
    fn receive_frame(
        &mut self,
        header_len: usize,
        frame_len: impl FnOnce(&[u8]) -> Result<usize>,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.fill(header_len, deadline)?;
        let total = frame_len(&self.pending[..header_len])?;
        self.fill(total, deadline)?;
        Ok(self.pending.drain(..total).collect())
    }

    /// Sends a length-prefixed plist frame.
    pub fn send_plist(&mut self, value: &Value, format: Format) -> Result<()> {
        if crate::debug::payloads() {
            trace!(port = self.port, ?value, "send plist");
        }
        let frame = codec::to_frame(value, format).map_err(from_io)?;
        self.send_all(&frame)
    }

    /// Receives one length-prefixed plist frame of any top-level type.
    pub fn receive_plist_value(&mut self, timeout: Option<Duration>) -> Result<Value> {
        let frame = self.receive_frame(
            codec::PREFIX_LEN,
            |prefix| {
                let mut len = [0u8; codec::PREFIX_LEN];
                len.copy_from_slice(prefix);
                Ok(codec::PREFIX_LEN + codec::payload_len(len).map_err(from_io)?)
            },
            timeout,
        )?;
        let value = codec::from_payload(&frame[codec::PREFIX_LEN..]).map_err(from_io)?;
        if crate::debug::payloads() {
            trace!(port = self.port, ?value, "received plist");
        }
        Ok(value)
    }

    /// Receives one length-prefixed plist frame holding a dictionary.
    pub fn receive_plist(&mut self, timeout: Option<Duration>) -> Result<Dictionary> {
        self.receive_plist_value(timeout)?
            .into_dictionary()
            .ok_or_else(|| Error::Malformed("expected a dictionary".into()))
    }

    /// Sends one AFC packet.
    pub fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        if crate::debug::payloads() {
            trace!(header = ?packet.header(), "send AFC packet");
        }
        self.send_all(&packet.to_bytes())
    }

    /// Receives one AFC packet.
    pub fn receive_packet(&mut self, timeout: Option<Duration>) -> Result<Packet> {
        let frame = self.receive_frame(
            afc::HEADER_LEN,
            |head| {
                let mut buf = [0u8; afc::HEADER_LEN];
                buf.copy_from_slice(head);
                Ok(afc::Header::from_bytes(&buf)?.packet_len())
            },
            timeout,
        )?;
        let packet = Packet::from_bytes(&frame)?;
        if crate::debug::payloads() {
            trace!(header = ?packet.header(), "received AFC packet");
        }
        Ok(packet)
    }

    /// Receives one usbmuxd packet, returning its tag and dictionary.
    pub(crate) fn receive_mux(&mut self, timeout: Option<Duration>) -> Result<(u32, Dictionary)> {
        use mobdev_proto::mux;

        let mut header = None;
        let frame = self.receive_frame(
            mux::HEADER_LEN,
            |head| {
                let mut buf = [0u8; mux::HEADER_LEN];
                buf.copy_from_slice(head);
                let parsed = mux::Header::from_bytes(buf).map_err(from_io)?;
                header = Some(parsed);
                Ok(parsed.length as usize)
            },
            timeout,
        )?;
        let header = header.ok_or_else(|| Error::Malformed("multiplexer header".into()))?;
        let dict = mux::payload_dict(&header, &frame[mux::HEADER_LEN..]).map_err(from_io)?;
        Ok((header.tag, dict))
    }

    /// Performs a TLS handshake and wraps the stream.
    ///
    /// Fails with [`Error::InvalidArg`] if TLS is already on. A failed
    /// handshake leaves the connection closed.
    pub fn enable_tls(&mut self, identity: &TlsIdentity) -> Result<()> {
        let mut sock = match self.stream.take() {
            None => return Err(Error::Closed),
            Some(Stream::Tls(tls)) => {
                self.stream = Some(Stream::Tls(tls));
                return Err(Error::InvalidArg("TLS already enabled"));
            }
            Some(Stream::Plain(sock)) => sock,
        };
        if !self.pending.is_empty() {
            warn!(bytes = self.pending.len(), "discarding plaintext buffered before TLS");
            self.pending.clear();
        }

        let handshake = identity.client().and_then(|mut conn| {
            sock.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).map_err(from_io)?;
            while conn.is_handshaking() {
                conn.complete_io(&mut sock)
                    .map_err(|e| Error::Ssl(format!("handshake: {e}")))?;
            }
            Ok(conn)
        });
        match handshake {
            Ok(conn) => {
                debug!(port = self.port, "TLS enabled");
                self.stream = Some(Stream::Tls(Box::new(StreamOwned::new(conn, sock))));
                Ok(())
            }
            Err(e) => {
                warn!(port = self.port, error = %e, "TLS handshake failed");
                if let Err(err) = sock.shutdown() {
                    trace!(error = %err, "shutdown after failed handshake");
                }
                Err(e)
            }
        }
    }

    /// Leaves TLS and continues in plaintext on the same socket.
    ///
    /// With `bypass` the TLS state is dropped without sending
    /// `close_notify`, which services that switch to a plaintext data
    /// channel after a TLS handshake require. A no-op without TLS.
    pub fn disable_tls(&mut self, bypass: bool) -> Result<()> {
        match self.stream.take() {
            None => Err(Error::Closed),
            Some(Stream::Plain(sock)) => {
                self.stream = Some(Stream::Plain(sock));
                Ok(())
            }
            Some(Stream::Tls(tls)) => {
                let StreamOwned { mut conn, mut sock } = *tls;
                if !bypass {
                    send_close_notify(&mut conn, &mut sock);
                }
                debug!(port = self.port, bypass, "TLS disabled");
                self.stream = Some(Stream::Plain(sock));
                Ok(())
            }
        }
    }

    /// Returns a handle that can shut this connection down from another thread.
    pub fn closer(&self) -> Result<Closer> {
        let stream = self.stream.as_ref().ok_or(Error::Closed)?;
        Ok(Closer(stream.socket().try_clone_socket().map_err(from_io)?))
    }

    /// Raw file descriptor of the underlying socket.
    #[cfg(unix)]
    pub fn raw_fd(&self) -> Result<std::os::fd::RawFd> {
        Ok(self.stream.as_ref().ok_or(Error::Closed)?.socket().raw_fd())
    }

    /// Releases the socket. Calling it again is a no-op.
    pub fn disconnect(&mut self) -> Result<()> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        self.pending.clear();
        let sock = match stream {
            Stream::Plain(sock) => sock,
            Stream::Tls(tls) => {
                let StreamOwned { mut conn, mut sock } = *tls;
                send_close_notify(&mut conn, &mut sock);
                sock
            }
        };
        if let Err(e) = sock.shutdown() {
            trace!(error = %e, "shutdown on disconnect");
        }
        debug!(udid = %self.udid, port = self.port, "disconnected");
        Ok(())
    }
}

/// Best-effort TLS `close_notify`.
fn send_close_notify(conn: &mut ClientConnection, sock: &mut Box<dyn Socket>) {
    conn.send_close_notify();
    while conn.wants_write() {
        if let Err(e) = conn.write_tls(sock) {
            trace!(error = %e, "close_notify not delivered");
            break;
        }
    }
}
