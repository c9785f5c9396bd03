//! Byte-stream sockets a [`Connection`](super::Connection) can run over.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// A blocking, bidirectional byte stream with timeout and shutdown control.
///
/// Implemented for [`TcpStream`] and (on Unix) [`UnixStream`]; custom
/// transports may implement it to run the service clients over other links.
pub trait Socket: Read + Write + Send + fmt::Debug {
    /// Sets the read timeout; `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Shuts down both directions, waking any blocked reader.
    fn shutdown(&self) -> io::Result<()>;

    /// Clones the underlying handle.
    fn try_clone_socket(&self) -> io::Result<Box<dyn Socket>>;

    /// Raw file descriptor of the socket.
    #[cfg(unix)]
    fn raw_fd(&self) -> std::os::fd::RawFd;
}

impl Socket for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        Self::set_read_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        Self::shutdown(self, Shutdown::Both)
    }

    fn try_clone_socket(&self) -> io::Result<Box<dyn Socket>> {
        Ok(Box::new(self.try_clone()?))
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> std::os::fd::RawFd {
        std::os::fd::AsRawFd::as_raw_fd(self)
    }
}

#[cfg(unix)]
impl Socket for UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        Self::set_read_timeout(self, timeout)
    }

    fn shutdown(&self) -> io::Result<()> {
        Self::shutdown(self, Shutdown::Both)
    }

    fn try_clone_socket(&self) -> io::Result<Box<dyn Socket>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn raw_fd(&self) -> std::os::fd::RawFd {
        std::os::fd::AsRawFd::as_raw_fd(self)
    }
}

/// Handle that can shut a connection down from another thread.
///
/// Obtained from [`Connection::closer`](super::Connection::closer); shutting
/// down makes any blocked receive on the connection return promptly.
#[derive(Debug)]
pub struct Closer(pub(super) Box<dyn Socket>);

impl Closer {
    /// Shuts the connection down; errors from an already-closed socket are ignored.
    pub fn close(&self) {
        if let Err(e) = self.0.shutdown() {
            tracing::trace!(error = %e, "shutdown on closed socket");
        }
    }
}
