//! Screenshot service, spoken over the DeviceLink message layer.
//!
//! DeviceLink messages are plist arrays whose first element names the
//! message. The connection starts with a version exchange and a
//! `DLMessageDeviceReady` before any request is accepted.

use mobdev_proto::{DictExt, Request};
use plist::Value;
use tracing::debug;

use crate::session::{DeviceService, ServiceSession, StartServiceError};

/// Highest DeviceLink major version this client speaks.
pub const DL_VERSION_MAJOR: u64 = 300;

/// Highest DeviceLink minor version this client speaks.
pub const DL_VERSION_MINOR: u64 = 0;

/// Screenshot result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(i32)]
pub enum ScreenshotCode {
    /// Bad argument rejected before sending.
    InvalidArg = -1,
    /// Message could not be encoded or decoded.
    PlistError = -2,
    /// Transport or multiplexer failure.
    MuxError = -3,
    /// TLS session failed.
    SslError = -4,
    /// No reply within the receive timeout.
    ReceiveTimeout = -5,
    /// DeviceLink version not supported by this client.
    BadVersion = -6,
    /// Device error with no known mapping.
    UnknownError = -256,
}

/// Errors from the screenshot service.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ScreenshotError {
    /// A message did not have the expected shape.
    #[error("malformed message: {0}")]
    Plist(String),

    /// The device speaks a newer DeviceLink version.
    #[error("device link version {major}.{minor} is newer than supported")]
    BadVersion {
        /// Device major version.
        major: u64,
        /// Device minor version.
        minor: u64,
    },

    /// No reply arrived in time.
    #[error("timed out")]
    ReceiveTimeout,

    /// The connection failed.
    #[error(transparent)]
    Transport(crate::Error),

    /// The service could not be started.
    #[error(transparent)]
    Start(#[from] StartServiceError),
}

impl ScreenshotError {
    /// Numeric code in the screenshot taxonomy.
    pub const fn code(&self) -> ScreenshotCode {
        match self {
            Self::Plist(_) => ScreenshotCode::PlistError,
            Self::BadVersion { .. } => ScreenshotCode::BadVersion,
            Self::ReceiveTimeout => ScreenshotCode::ReceiveTimeout,
            Self::Transport(crate::Error::InvalidArg(_)) => ScreenshotCode::InvalidArg,
            Self::Transport(crate::Error::Ssl(_)) | Self::Start(StartServiceError::Tls { .. }) => {
                ScreenshotCode::SslError
            }
            Self::Transport(_) | Self::Start(_) => ScreenshotCode::MuxError,
        }
    }
}

impl From<crate::Error> for ScreenshotError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::Timeout => Self::ReceiveTimeout,
            crate::Error::Malformed(msg) => Self::Plist(msg),
            other => Self::Transport(other),
        }
    }
}

/// Screenshot client.
#[derive(Debug)]
pub struct Screenshot {
    /// Underlying session, past the DeviceLink handshake.
    session: ServiceSession,
}

impl DeviceService for Screenshot {
    const SERVICE_NAME: &'static str = "com.apple.mobile.screenshotr";
    type Error = ScreenshotError;

    fn from_session(session: ServiceSession) -> Result<Self, ScreenshotError> {
        let mut client = Self { session };
        client.version_exchange()?;
        Ok(client)
    }
}

impl Screenshot {
    /// Sends a DeviceLink array.
    fn send(&mut self, message: Vec<Value>) -> Result<(), ScreenshotError> {
        Ok(self.session.send_binary_plist(&Value::Array(message))?)
    }

    /// Receives a DeviceLink array and checks its message name.
    fn receive(&mut self, expected: &str) -> Result<Vec<Value>, ScreenshotError> {
        let timeout = self.session.options().receive_timeout();
        let Value::Array(message) = self.session.receive_plist_value(timeout)? else {
            return Err(ScreenshotError::Plist("expected a DeviceLink array".into()));
        };
        match message.first().and_then(Value::as_string) {
            Some(name) if name == expected => Ok(message),
            other => Err(ScreenshotError::Plist(format!(
                "expected {expected}, got {other:?}"
            ))),
        }
    }

    /// Negotiates the DeviceLink version and waits for the device to be ready.
    fn version_exchange(&mut self) -> Result<(), ScreenshotError> {
        let offer = self.receive("DLMessageVersionExchange")?;
        let major = offer.get(1).and_then(Value::as_unsigned_integer);
        let minor = offer.get(2).and_then(Value::as_unsigned_integer);
        let (Some(major), Some(minor)) = (major, minor) else {
            return Err(ScreenshotError::Plist("version exchange without versions".into()));
        };
        if major > DL_VERSION_MAJOR || (major == DL_VERSION_MAJOR && minor > DL_VERSION_MINOR) {
            return Err(ScreenshotError::BadVersion { major, minor });
        }

        self.send(vec![
            "DLMessageVersionExchange".into(),
            "DLVersionsOk".into(),
            DL_VERSION_MAJOR.into(),
        ])?;
        self.receive("DLMessageDeviceReady")?;
        debug!(major, minor, "device link ready");
        Ok(())
    }

    /// Captures the screen. The image is PNG or TIFF depending on the device.
    pub fn take_screenshot(&mut self) -> Result<Vec<u8>, ScreenshotError> {
        let request = Request::new().with("MessageType", "ScreenShotRequest");
        self.send(vec!["DLMessageProcessMessage".into(), request.into_value()])?;

        let reply = self.receive("DLMessageProcessMessage")?;
        let dict = reply
            .get(1)
            .and_then(Value::as_dictionary)
            .ok_or_else(|| ScreenshotError::Plist("reply without payload".into()))?;
        if dict.string("MessageType") != Some("ScreenShotReply") {
            return Err(ScreenshotError::Plist("not a ScreenShotReply".into()));
        }
        dict.data("ScreenShotData")
            .map(<[u8]>::to_vec)
            .ok_or_else(|| ScreenshotError::Plist("missing ScreenShotData".into()))
    }

    /// Says goodbye and closes the session. Safe to call repeatedly.
    pub fn close(&mut self) -> Result<(), ScreenshotError> {
        if self.session.is_active() {
            let bye = vec![
                "DLMessageDisconnect".into(),
                "___EmptyParameterString___".into(),
            ];
            if let Err(e) = self.send(bye) {
                debug!(error = %e, "device link disconnect");
            }
        }
        Ok(self.session.close()?)
    }
}

impl Drop for Screenshot {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!(error = %e, "closing screenshot client on drop");
        }
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::thread;

    use mobdev_proto::{Format, decode, encode};

    use super::*;
    use crate::session::tests::session_pair;

    fn send(peer: &mut UnixStream, items: Vec<Value>) {
        encode(peer, &Value::Array(items), Format::Binary).unwrap();
    }

    fn name(value: &Value) -> String {
        value.as_array().unwrap()[0].as_string().unwrap().to_owned()
    }

    #[test]
    fn handshake_capture_and_disconnect() {
        let (session, mut peer) = session_pair(Screenshot::SERVICE_NAME);
        let device = thread::spawn(move || {
            send(
                &mut peer,
                vec!["DLMessageVersionExchange".into(), 300u64.into(), 0u64.into()],
            );
            let ok = decode(&mut peer).unwrap();
            send(&mut peer, vec!["DLMessageDeviceReady".into()]);

            let req = decode(&mut peer).unwrap();
            let reply = Request::new()
                .with("MessageType", "ScreenShotReply")
                .with_data("ScreenShotData", b"\x89PNG".to_vec());
            send(
                &mut peer,
                vec!["DLMessageProcessMessage".into(), reply.into_value()],
            );
            let bye = decode(&mut peer).unwrap();
            (ok, req, bye)
        });

        let mut shot = Screenshot::from_session(session).unwrap();
        assert_eq!(shot.take_screenshot().unwrap(), b"\x89PNG");
        shot.close().unwrap();
        shot.close().unwrap();

        let (ok, req, bye) = device.join().unwrap();
        assert_eq!(ok.as_array().unwrap()[1].as_string(), Some("DLVersionsOk"));
        assert_eq!(name(&req), "DLMessageProcessMessage");
        assert_eq!(
            bye.as_array().unwrap()[1].as_string(),
            Some("___EmptyParameterString___")
        );
    }

    #[test]
    fn newer_device_version_is_rejected() {
        let (session, mut peer) = session_pair(Screenshot::SERVICE_NAME);
        send(
            &mut peer,
            vec!["DLMessageVersionExchange".into(), 301u64.into(), 0u64.into()],
        );
        let err = Screenshot::from_session(session).unwrap_err();
        assert_eq!(err.code(), ScreenshotCode::BadVersion);
        assert_eq!(err.code() as i32, -6);
    }
}
