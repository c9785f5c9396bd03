//! `std::io` adapter over an AFC file handle.

use std::io::{self, Read, Seek, SeekFrom, Write};

use mobdev_proto::afc::{AfcStatus, LockOp};
use tracing::debug;

use super::{AfcClient, AfcError};

/// An open AFC file. The handle is closed when the value is dropped.
#[derive(Debug)]
pub struct AfcFile<'a> {
    /// Client the handle belongs to.
    client: &'a AfcClient,
    /// Device file handle.
    handle: u64,
    /// Cleared once the handle is closed.
    open: bool,
}

impl<'a> AfcFile<'a> {
    /// Wraps a handle returned by [`AfcClient::file_open`].
    pub(super) const fn new(client: &'a AfcClient, handle: u64) -> Self {
        Self {
            client,
            handle,
            open: true,
        }
    }

    /// Device file handle.
    pub const fn handle(&self) -> u64 {
        self.handle
    }

    /// Applies a lock operation.
    pub fn lock(&self, op: LockOp) -> Result<(), AfcError> {
        self.client.file_lock(self.handle, op)
    }

    /// Resizes the file.
    pub fn set_len(&self, size: u64) -> Result<(), AfcError> {
        self.client.file_truncate(self.handle, size)
    }

    /// Closes the handle, reporting any failure.
    pub fn close(mut self) -> Result<(), AfcError> {
        self.open = false;
        self.client.file_close(self.handle)
    }
}

impl Read for AfcFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let data = match self.client.file_read(self.handle, buf.len()) {
            Ok(data) => data,
            Err(AfcError::Status {
                status: AfcStatus::EndOfData,
                ..
            }) => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }
}

impl Write for AfcFile<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        Ok(self.client.file_write(self.handle, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for AfcFile<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.client.file_seek(self.handle, pos)?;
        Ok(self.client.file_tell(self.handle)?)
    }
}

impl Drop for AfcFile<'_> {
    fn drop(&mut self) {
        if self.open
            && let Err(e) = self.client.file_close(self.handle)
        {
            debug!(handle = self.handle, error = %e, "closing afc file on drop");
        }
    }
}
