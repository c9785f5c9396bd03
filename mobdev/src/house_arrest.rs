//! House arrest: file access to an app's sandbox container.
//!
//! After a successful vend request the connection speaks AFC; it moves to
//! a new [`AfcClient`] and this client only accepts [`close`](HouseArrest::close).

use mobdev_proto::{DictExt, Request};
use plist::Dictionary;
use tracing::debug;

use crate::afc::AfcClient;
use crate::session::{DeviceService, ServiceSession, StartServiceError};

/// House arrest result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
#[repr(i32)]
pub enum HouseArrestCode {
    /// Bad argument rejected before sending.
    InvalidArg = -1,
    /// Message could not be encoded or decoded.
    PlistError = -2,
    /// Connection to the service failed or was closed.
    ConnFailed = -3,
    /// Connection already handed to an AFC client.
    InvalidMode = -4,
    /// Device error with no known mapping.
    UnknownError = -256,
}

/// Errors from house arrest requests.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HouseArrestError {
    /// A caller-supplied argument was rejected locally.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// A reply could not be decoded.
    #[error("malformed message: {0}")]
    Plist(String),

    /// The connection failed.
    #[error("connection failed")]
    ConnFailed(#[source] crate::Error),

    /// The connection already moved to an AFC client.
    #[error("connection was handed to an AFC client")]
    InvalidMode,

    /// The device refused the request.
    #[error("device reported {0}")]
    Device(String),

    /// The service could not be started.
    #[error(transparent)]
    Start(#[from] StartServiceError),
}

impl HouseArrestError {
    /// Numeric code in the house arrest taxonomy.
    pub const fn code(&self) -> HouseArrestCode {
        match self {
            Self::InvalidArg(_) => HouseArrestCode::InvalidArg,
            Self::Plist(_) => HouseArrestCode::PlistError,
            Self::ConnFailed(_) | Self::Start(_) => HouseArrestCode::ConnFailed,
            Self::InvalidMode => HouseArrestCode::InvalidMode,
            Self::Device(_) => HouseArrestCode::UnknownError,
        }
    }
}

impl From<crate::Error> for HouseArrestError {
    fn from(err: crate::Error) -> Self {
        match err {
            crate::Error::HandedOff => Self::InvalidMode,
            crate::Error::Malformed(msg) => Self::Plist(msg),
            crate::Error::InvalidArg(msg) => Self::InvalidArg(msg),
            other => Self::ConnFailed(other),
        }
    }
}

/// What part of the sandbox to vend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Vend {
    /// The whole app container.
    Container,
    /// Only the `Documents` directory.
    Documents,
}

impl Vend {
    /// Wire command name.
    pub const fn command(self) -> &'static str {
        match self {
            Self::Container => "VendContainer",
            Self::Documents => "VendDocuments",
        }
    }

    /// Parses a wire command name.
    pub fn from_command(name: &str) -> Option<Self> {
        match name {
            "VendContainer" => Some(Self::Container),
            "VendDocuments" => Some(Self::Documents),
            _ => None,
        }
    }
}

/// House arrest client.
#[derive(Debug)]
pub struct HouseArrest {
    /// Underlying session.
    session: ServiceSession,
}

impl DeviceService for HouseArrest {
    const SERVICE_NAME: &'static str = "com.apple.mobile.house_arrest";
    type Error = HouseArrestError;

    fn from_session(session: ServiceSession) -> Result<Self, HouseArrestError> {
        Ok(Self { session })
    }
}

impl HouseArrest {
    /// Sends a raw request dictionary.
    pub fn send_request(&mut self, request: Dictionary) -> Result<(), HouseArrestError> {
        if request.is_empty() {
            return Err(HouseArrestError::InvalidArg("empty request"));
        }
        Ok(self.session.send_plist(&Request::from(request).into_value())?)
    }

    /// Sends `command` for `app_id`. Only `VendContainer` and `VendDocuments` are accepted.
    pub fn send_command(&mut self, command: &str, app_id: &str) -> Result<(), HouseArrestError> {
        let vend = Vend::from_command(command)
            .ok_or(HouseArrestError::InvalidArg("unknown house arrest command"))?;
        if app_id.is_empty() {
            return Err(HouseArrestError::InvalidArg("empty app identifier"));
        }
        let request = Request::new()
            .with("Command", vend.command())
            .with("Identifier", app_id);
        self.send_request(request.into_dict())
    }

    /// Reads the reply to the last command.
    pub fn result(&mut self) -> Result<Dictionary, HouseArrestError> {
        let timeout = self.session.options().receive_timeout();
        Ok(self.session.receive_plist(timeout)?)
    }

    /// Vends part of an app's sandbox and returns an AFC client rooted in it.
    pub fn vend(&mut self, vend: Vend, app_id: &str) -> Result<AfcClient, HouseArrestError> {
        self.send_command(vend.command(), app_id)?;
        let reply = self.result()?;
        if let Some(error) = reply.string("Error") {
            debug!(app_id, error, "vend refused");
            return Err(HouseArrestError::Device(error.to_owned()));
        }
        if reply.string("Status") != Some("Complete") {
            return Err(HouseArrestError::Plist("vend reply without status".into()));
        }

        let conn = self.session.hand_off()?;
        let options = self.session.options().clone();
        debug!(app_id, command = vend.command(), "container vended");
        Ok(AfcClient::new(ServiceSession::from_connection(
            AfcClient::SERVICE_NAME,
            conn,
            options,
        )))
    }

    /// Whether the connection moved to an AFC client.
    pub const fn is_handed_off(&self) -> bool {
        self.session.is_handed_off()
    }

    /// Closes the client. After a vend this leaves the AFC client untouched.
    pub fn close(&mut self) -> Result<(), HouseArrestError> {
        Ok(self.session.close()?)
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::thread;

    use mobdev_proto::afc::{Packet, Response as AfcResponse};
    use mobdev_proto::{Format, decode_dict, encode};

    use super::*;
    use crate::afc::AfcStatus;
    use crate::session::tests::session_pair;

    fn client() -> (HouseArrest, std::os::unix::net::UnixStream) {
        let (session, peer) = session_pair(HouseArrest::SERVICE_NAME);
        (HouseArrest::from_session(session).unwrap(), peer)
    }

    #[test]
    fn vend_hands_connection_to_afc() {
        let (mut ha, mut peer) = client();
        let device = thread::spawn(move || {
            let req = decode_dict(&mut peer).unwrap();
            let ok = Request::new().with("Status", "Complete").into_value();
            encode(&mut peer, &ok, Format::Xml).unwrap();
            let packet = Packet::read_from(&mut peer).unwrap();
            AfcResponse::Status(AfcStatus::Success)
                .into_packet(packet.packet_num)
                .write_to(&mut peer)
                .unwrap();
            req
        });

        let afc = ha.vend(Vend::Documents, "com.example.notes").unwrap();
        assert!(ha.is_handed_off());
        assert!(matches!(
            ha.send_command("VendContainer", "x").unwrap_err(),
            HouseArrestError::InvalidMode
        ));
        assert_eq!(ha.result().unwrap_err().code(), HouseArrestCode::InvalidMode);
        ha.close().unwrap();

        afc.make_directory("/Documents/new").unwrap();
        let req = device.join().unwrap();
        assert_eq!(req.string("Command"), Some("VendDocuments"));
        assert_eq!(req.string("Identifier"), Some("com.example.notes"));
    }

    #[test]
    fn device_error_keeps_session() {
        let (mut ha, mut peer) = client();
        thread::spawn(move || {
            decode_dict(&mut peer).unwrap();
            let err = Request::new().with("Error", "ApplicationLookupFailed").into_value();
            encode(&mut peer, &err, Format::Xml).unwrap();
            peer
        });
        let err = ha.vend(Vend::Container, "com.missing").unwrap_err();
        assert!(matches!(&err, HouseArrestError::Device(name) if name == "ApplicationLookupFailed"));
        assert_eq!(err.code(), HouseArrestCode::UnknownError);
        assert!(!ha.is_handed_off());
    }

    #[test]
    fn rejects_unknown_command_locally() {
        let (mut ha, _peer) = client();
        assert_eq!(
            ha.send_command("VendEverything", "com.x").unwrap_err().code(),
            HouseArrestCode::InvalidArg
        );
        assert_eq!(
            ha.send_command("VendContainer", "").unwrap_err().code(),
            HouseArrestCode::InvalidArg
        );
    }
}
