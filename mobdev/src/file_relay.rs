//! File relay: diagnostic archives streamed off the device.
//!
//! The host names the sources it wants; once the device acknowledges, the
//! connection carries a gzipped cpio archive until the device closes it.

use std::io::{self, Read};
use std::time::Duration;

use flate2::read::GzDecoder;
use mobdev_proto::message::string_array;
use mobdev_proto::{DictExt, Request};
use tracing::debug;

use crate::session::{DeviceService, ServiceSession, StartServiceError};
use crate::transport::Connection;

/// How long to wait for the device to stage the requested sources.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// File relay result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(i32)]
pub enum FileRelayCode {
    /// Bad argument rejected before sending.
    InvalidArg = -1,
    /// Message could not be encoded or decoded.
    PlistError = -2,
    /// Transport or multiplexer failure.
    MuxError = -3,
    /// A requested source name is unknown to the device.
    InvalidSource = -4,
    /// Nothing was collected for the requested sources.
    StagingEmpty = -5,
    /// The device refused to relay the sources.
    PermissionDenied = -6,
    /// Device error with no known mapping.
    UnknownError = -256,
}

/// Errors from the file relay.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FileRelayError {
    /// A caller-supplied argument was rejected locally.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// A reply could not be decoded.
    #[error("malformed message: {0}")]
    Plist(String),

    /// The connection failed.
    #[error(transparent)]
    Transport(crate::Error),

    /// The device refused the request.
    #[error("device reported {name}")]
    Device {
        /// Mapped local code.
        code: FileRelayCode,
        /// Raw error name.
        name: String,
    },

    /// The service could not be started.
    #[error(transparent)]
    Start(#[from] StartServiceError),
}

impl FileRelayError {
    /// Numeric code in the file relay taxonomy.
    pub const fn code(&self) -> FileRelayCode {
        match self {
            Self::InvalidArg(_) => FileRelayCode::InvalidArg,
            Self::Plist(_) => FileRelayCode::PlistError,
            Self::Transport(_) | Self::Start(_) => FileRelayCode::MuxError,
            Self::Device { code, .. } => *code,
        }
    }

    /// Maps a device error name.
    fn device(name: &str) -> Self {
        let code = match name {
            "InvalidSource" => FileRelayCode::InvalidSource,
            "StagingEmpty" => FileRelayCode::StagingEmpty,
            "PermissionDenied" => FileRelayCode::PermissionDenied,
            _ => FileRelayCode::UnknownError,
        };
        Self::Device {
            code,
            name: name.to_owned(),
        }
    }
}

impl From<crate::Error> for FileRelayError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Malformed(msg) => Self::Plist(msg),
            crate::Error::InvalidArg(msg) => Self::InvalidArg(msg),
            other => Self::Transport(other),
        }
    }
}

/// Diagnostic sources the relay can collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Source {
    /// AppleSupport logs.
    AppleSupport,
    /// Network logs.
    Network,
    /// VPN logs.
    Vpn,
    /// Wi-Fi logs.
    WiFi,
    /// Address book, calendar and similar databases.
    UserDatabases,
    /// Crash logs.
    CrashReporter,
    /// Contents of `/tmp`.
    Tmp,
    /// System configuration preferences.
    SystemConfiguration,
}

impl Source {
    /// Wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AppleSupport => "AppleSupport",
            Self::Network => "Network",
            Self::Vpn => "VPN",
            Self::WiFi => "WiFi",
            Self::UserDatabases => "UserDatabases",
            Self::CrashReporter => "CrashReporter",
            Self::Tmp => "tmp",
            Self::SystemConfiguration => "SystemConfiguration",
        }
    }
}

/// File relay client.
#[derive(Debug)]
pub struct FileRelay {
    /// Underlying session.
    session: ServiceSession,
}

impl DeviceService for FileRelay {
    const SERVICE_NAME: &'static str = "com.apple.mobile.file_relay";
    type Error = FileRelayError;

    fn from_session(session: ServiceSession) -> Result<Self, FileRelayError> {
        Ok(Self { session })
    }
}

impl FileRelay {
    /// Requests `sources` and returns the archive stream.
    pub fn request_sources(&mut self, sources: &[Source]) -> Result<Archive, FileRelayError> {
        self.request_sources_timeout(sources, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Like [`request_sources`](Self::request_sources) with an explicit wait for the acknowledgement.
    ///
    /// The session's connection moves into the returned [`Archive`].
    pub fn request_sources_timeout(
        &mut self,
        sources: &[Source],
        timeout: Duration,
    ) -> Result<Archive, FileRelayError> {
        if sources.is_empty() {
            return Err(FileRelayError::InvalidArg("no sources"));
        }
        let request = Request::new().with(
            "Sources",
            string_array(sources.iter().map(|s| s.as_str())),
        );
        self.session.send_plist(&request.into_value())?;

        let reply = self.session.receive_plist(Some(timeout))?;
        if let Some(name) = reply.string("Error") {
            debug!(error = name, "file relay refused");
            return Err(FileRelayError::device(name));
        }
        match reply.string("Status") {
            Some("Acknowledged") => {}
            other => {
                return Err(FileRelayError::Plist(format!(
                    "unexpected status {other:?}"
                )));
            }
        }

        let read_timeout = self.session.options().receive_timeout();
        let conn = self.session.hand_off()?;
        Ok(Archive {
            conn,
            timeout: read_timeout,
        })
    }

    /// Closes the client.
    pub fn close(&mut self) -> Result<(), FileRelayError> {
        Ok(self.session.close()?)
    }
}

/// Raw archive bytes; end of stream reads as EOF.
#[derive(Debug)]
pub struct Archive {
    /// Connection carrying the archive.
    conn: Connection,
    /// Bound on each read.
    timeout: Option<Duration>,
}

impl Archive {
    /// Decompresses the stream, yielding the cpio archive.
    pub fn gunzip(self) -> GzDecoder<Self> {
        GzDecoder::new(self)
    }
}

impl Read for Archive {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.conn.receive(buf, self.timeout) {
            Ok(n) => Ok(n),
            Err(crate::Error::EndOfStream) => Ok(0),
            Err(crate::Error::Timeout) => Err(io::ErrorKind::TimedOut.into()),
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

impl Drop for Archive {
    fn drop(&mut self) {
        if let Err(e) = self.conn.disconnect() {
            debug!(error = %e, "closing file relay archive");
        }
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;
    use std::thread;

    use flate2::Compression;
    use flate2::write::GzEncoder;
    use mobdev_proto::{Format, decode_dict, encode};

    use super::*;
    use crate::session::tests::session_pair;

    fn client() -> (FileRelay, std::os::unix::net::UnixStream) {
        let (session, peer) = session_pair(FileRelay::SERVICE_NAME);
        (FileRelay::from_session(session).unwrap(), peer)
    }

    #[test]
    fn streams_archive_until_close() {
        let (mut relay, mut peer) = client();
        let device = thread::spawn(move || {
            let req = decode_dict(&mut peer).unwrap();
            let ack = Request::new().with("Status", "Acknowledged").into_value();
            encode(&mut peer, &ack, Format::Xml).unwrap();
            let mut gz = GzEncoder::new(Vec::new(), Compression::default());
            gz.write_all(b"070707 cpio payload").unwrap();
            peer.write_all(&gz.finish().unwrap()).unwrap();
            req
        });

        let archive = relay
            .request_sources(&[Source::CrashReporter, Source::Tmp])
            .unwrap();
        let mut text = String::new();
        archive.gunzip().read_to_string(&mut text).unwrap();
        assert_eq!(text, "070707 cpio payload");

        let req = device.join().unwrap();
        let sources = mobdev_proto::message::strings_from(req.get("Sources").unwrap()).unwrap();
        assert_eq!(sources, vec!["CrashReporter", "tmp"]);
        relay.close().unwrap();
    }

    #[test]
    fn device_errors_map_to_codes() {
        let (mut relay, mut peer) = client();
        thread::spawn(move || {
            for name in ["StagingEmpty", "Weird"] {
                decode_dict(&mut peer).unwrap();
                let err = Request::new().with("Error", name).into_value();
                encode(&mut peer, &err, Format::Xml).unwrap();
            }
        });
        let err = relay.request_sources(&[Source::WiFi]).unwrap_err();
        assert_eq!(err.code(), FileRelayCode::StagingEmpty);
        let err = relay.request_sources(&[Source::WiFi]).unwrap_err();
        assert_eq!(err.code(), FileRelayCode::UnknownError);
        assert!(matches!(err, FileRelayError::Device { name, .. } if name == "Weird"));
    }

    #[test]
    fn empty_source_list_is_rejected() {
        let (mut relay, _peer) = client();
        assert_eq!(
            relay.request_sources(&[]).unwrap_err().code(),
            FileRelayCode::InvalidArg
        );
    }
}
